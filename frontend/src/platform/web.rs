//! Browser implementation of the transport tiers, the durable store and the
//! clock, plus the entry points a page calls to boot a timer context.

use crate::dataflow::{drain_ready, relay, Relay};
use crate::popup::{build_popup_url, parse_popup_params};
use crate::runtime::{auto_advance, render_frame, run_sync_loop, Frame};
use crate::service::{
    MirrorHandles, OwnerHandles, ServiceOptions, SyncDriver, TimerController, TimerObserver,
    TimerService,
};
use crate::sync::{
    KeyValueStore, ReconnectPolicy, StorageError, StorageTransport, SyncTransport, TimerStore,
    Transport, TransportError, TransportKind,
};
use crate::time_types::TimeSource;
use futures::channel::mpsc::UnboundedReceiver;
use gloo_timers::future::IntervalStream;
use shared::{ContextMode, PopupParams, Stage, SyncConfig, TimingSection};
use std::cell::Cell;
use std::rc::Rc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{BroadcastChannel, MessageEvent, Performance, Storage, Window};

const POPUP_TARGET: &str = "meeting-timer-mirror";
const POPUP_FEATURES: &str = "popup,width=640,height=360";

// ===== CLOCK =====

/// `performance.timeOrigin + performance.now()`: monotonic within a context
/// and on a shared epoch across same-origin windows.
pub struct PerformanceTimeSource {
    performance: Performance,
}

impl PerformanceTimeSource {
    pub fn new() -> Option<Self> {
        let performance = web_sys::window()?.performance()?;
        Some(Self { performance })
    }
}

impl TimeSource for PerformanceTimeSource {
    fn now_ms(&self) -> i64 {
        (self.performance.time_origin() + self.performance.now()) as i64
    }
}

// ===== LOGGING =====

struct ConsoleLogger;

static CONSOLE_LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            log::Level::Error => web_sys::console::error_1(&line),
            log::Level::Warn => web_sys::console::warn_1(&line),
            log::Level::Info => web_sys::console::info_1(&line),
            log::Level::Debug | log::Level::Trace => web_sys::console::debug_1(&line),
        }
    }

    fn flush(&self) {}
}

/// Route `log` records to the browser console. Safe to call more than once.
pub fn init_console_logger(level: log::LevelFilter) {
    if log::set_logger(&CONSOLE_LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// ===== BROADCAST CHANNEL =====

pub struct WebBroadcast {
    name: String,
    channel: Option<BroadcastChannel>,
    channel_message_relay: Relay<String>,
    receiver: UnboundedReceiver<String>,
    failed: Rc<Cell<bool>>,
    on_message: Option<Closure<dyn FnMut(MessageEvent)>>,
    on_message_error: Option<Closure<dyn FnMut(MessageEvent)>>,
}

impl WebBroadcast {
    pub fn open(name: &str) -> Result<Self, TransportError> {
        let (channel_message_relay, receiver) = relay();
        let mut transport = Self {
            name: name.to_string(),
            channel: None,
            channel_message_relay,
            receiver,
            failed: Rc::new(Cell::new(false)),
            on_message: None,
            on_message_error: None,
        };
        transport.connect()?;
        Ok(transport)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let channel = BroadcastChannel::new(&self.name)
            .map_err(|_| TransportError::Unavailable(TransportKind::Broadcast))?;

        let channel_message_relay = self.channel_message_relay.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            if let Some(raw) = event.data().as_string() {
                channel_message_relay.send(raw);
            }
        });
        let failed = self.failed.clone();
        let on_message_error = Closure::<dyn FnMut(MessageEvent)>::new(move |_event: MessageEvent| {
            failed.set(true);
        });

        channel.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        channel.set_onmessageerror(Some(on_message_error.as_ref().unchecked_ref()));
        self.failed.set(false);
        self.channel = Some(channel);
        self.on_message = Some(on_message);
        self.on_message_error = Some(on_message_error);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.set_onmessage(None);
            channel.set_onmessageerror(None);
            channel.close();
        }
        self.on_message = None;
        self.on_message_error = None;
    }
}

impl Transport for WebBroadcast {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn is_open(&self) -> bool {
        self.channel.is_some() && !self.failed.get()
    }

    fn publish(&mut self, raw: &str, _now_ms: i64) -> Result<(), TransportError> {
        let Some(channel) = self.channel.as_ref() else {
            return Err(TransportError::Closed(TransportKind::Broadcast));
        };
        channel
            .post_message(&JsValue::from_str(raw))
            .map_err(|error| {
                self.failed.set(true);
                TransportError::Write {
                    kind: TransportKind::Broadcast,
                    reason: format!("{:?}", error),
                }
            })
    }

    fn drain(&mut self, _now_ms: i64) -> Vec<String> {
        drain_ready(&mut self.receiver)
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.disconnect();
        self.connect()
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

// ===== WINDOW HANDLE =====

/// `postMessage` to one held window (the popup for a main window, the
/// opener for a popup). Only same-origin string messages are accepted.
pub struct WebWindow {
    own: Window,
    peer: Window,
    origin: String,
    receiver: UnboundedReceiver<String>,
    listener: Option<Closure<dyn FnMut(MessageEvent)>>,
}

impl WebWindow {
    pub fn attach(peer: Window) -> Result<Self, TransportError> {
        let unavailable = TransportError::Unavailable(TransportKind::Window);
        let own = web_sys::window().ok_or(unavailable.clone())?;
        let origin = own.location().origin().map_err(|_| unavailable.clone())?;

        let (window_message_relay, receiver) = relay::<String>();
        let expected_origin = origin.clone();
        let listener = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            if event.origin() != expected_origin {
                return;
            }
            if let Some(raw) = event.data().as_string() {
                window_message_relay.send(raw);
            }
        });
        own.add_event_listener_with_callback("message", listener.as_ref().unchecked_ref())
            .map_err(|_| unavailable)?;

        Ok(Self {
            own,
            peer,
            origin,
            receiver,
            listener: Some(listener),
        })
    }
}

impl Transport for WebWindow {
    fn kind(&self) -> TransportKind {
        TransportKind::Window
    }

    /// The closed probe: a popup the presenter shut reports `closed == true`.
    fn is_open(&self) -> bool {
        self.listener.is_some() && !self.peer.closed().unwrap_or(true)
    }

    fn publish(&mut self, raw: &str, _now_ms: i64) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(TransportKind::Window));
        }
        self.peer
            .post_message(&JsValue::from_str(raw), &self.origin)
            .map_err(|error| TransportError::Write {
                kind: TransportKind::Window,
                reason: format!("{:?}", error),
            })
    }

    fn drain(&mut self, _now_ms: i64) -> Vec<String> {
        drain_ready(&mut self.receiver)
    }

    fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = self
                .own
                .remove_event_listener_with_callback("message", listener.as_ref().unchecked_ref());
        }
    }
}

// ===== LOCAL STORAGE =====

pub struct LocalStorage {
    storage: Storage,
}

impl LocalStorage {
    pub fn open() -> Result<Self, StorageError> {
        let storage = web_sys::window()
            .and_then(|window| window.local_storage().ok().flatten())
            .ok_or(StorageError::Unavailable)?;
        Ok(Self { storage })
    }
}

fn js_reason(error: JsValue) -> String {
    error.as_string().unwrap_or_else(|| format!("{:?}", error))
}

impl KeyValueStore for LocalStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get_item(key).map_err(|error| StorageError::Read {
            key: key.to_string(),
            reason: js_reason(error),
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set_item(key, value).map_err(|error| StorageError::Write {
            key: key.to_string(),
            reason: js_reason(error),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.storage.remove_item(key).map_err(|error| StorageError::Write {
            key: key.to_string(),
            reason: js_reason(error),
        })
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let read_error = |error: JsValue| StorageError::Read {
            key: "*".to_string(),
            reason: js_reason(error),
        };
        let length = self.storage.length().map_err(read_error)?;
        let mut keys = Vec::with_capacity(length as usize);
        for index in 0..length {
            if let Some(key) = self.storage.key(index).map_err(read_error)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

// ===== BOOT =====

/// Assemble the tiers this browser supports. Missing ones are skipped.
pub fn build_transport(
    config: &SyncConfig,
    context_id: &str,
    peer: Option<Window>,
    now_ms: i64,
) -> (SyncTransport, Option<TimerStore>) {
    let mut transport = SyncTransport::new(ReconnectPolicy::from(&config.timing));

    match WebBroadcast::open(&config.channel.broadcast_name) {
        Ok(broadcast) => transport.attach(Box::new(broadcast)),
        Err(error) => log::info!("Broadcast channel unavailable: {}", error),
    }

    if let Some(peer) = peer {
        match WebWindow::attach(peer) {
            Ok(window) => transport.attach(Box::new(window)),
            Err(error) => log::info!("Window messaging unavailable: {}", error),
        }
    }

    let store = match LocalStorage::open() {
        Ok(storage) => {
            let storage: Rc<dyn KeyValueStore> = Rc::new(storage);
            transport.attach(Box::new(StorageTransport::new(
                storage.clone(),
                config.channel.storage_prefix.as_str(),
                context_id,
                &config.timing,
                now_ms,
            )));
            Some(TimerStore::new(storage, config.channel.state_key.as_str()))
        }
        Err(error) => {
            log::warn!("Local storage unavailable: {}", error);
            None
        }
    };

    (transport, store)
}

fn clock() -> Result<Rc<dyn TimeSource>, JsValue> {
    PerformanceTimeSource::new()
        .map(|clock| Rc::new(clock) as Rc<dyn TimeSource>)
        .ok_or_else(|| JsValue::from_str("performance clock unavailable"))
}

/// A running main-window timer. The render loop shares the controller.
pub struct OwnerPage {
    pub controller: Rc<TimerController>,
    pub observer: TimerObserver,
    pub driver: SyncDriver,
}

/// Boot the owning timer of a main window and start its loops at the
/// `[timing]` periods.
pub fn boot_owner(
    directory_id: &str,
    stages: Vec<Stage>,
    config: &SyncConfig,
    on_frame: impl Fn(Frame) + 'static,
) -> Result<OwnerPage, JsValue> {
    let clock = clock()?;
    let options = ServiceOptions::new(directory_id)
        .with_stages(stages)
        .with_timing(config.timing.clone());
    let (transport, store) = build_transport(config, &options.context_id, None, clock.now_ms());
    let OwnerHandles {
        controller,
        observer,
        driver,
    } = TimerService::owner(options, transport, store, clock);

    let controller = Rc::new(controller);
    spawn_sync_loop(driver.clone(), &config.timing);
    spawn_render_loop(
        observer.clone(),
        Some(controller.clone()),
        &config.timing,
        on_frame,
    );
    Ok(OwnerPage {
        controller,
        observer,
        driver,
    })
}

/// Boot a popup mirror from its own URL and start its loops. The opener
/// becomes the window tier.
pub fn boot_mirror(
    config: &SyncConfig,
    on_frame: impl Fn(Frame) + 'static,
) -> Result<MirrorHandles, JsValue> {
    let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
    let href = window.location().href()?;
    let params = parse_popup_params(&href).map_err(|error| JsValue::from_str(&error.to_string()))?;

    let opener = window
        .opener()
        .ok()
        .and_then(|opener| opener.dyn_into::<Window>().ok());

    let clock = clock()?;
    let options = ServiceOptions::new(params.directory_id()).with_timing(config.timing.clone());
    let (transport, store) = build_transport(config, &options.context_id, opener, clock.now_ms());
    let handles = TimerService::mirror(options, transport, store, clock);

    spawn_sync_loop(handles.driver.clone(), &config.timing);
    spawn_render_loop(handles.observer.clone(), None, &config.timing, on_frame);
    Ok(handles)
}

/// Open the mirror popup and give the owner a direct line to it.
pub fn open_mirror_popup(
    base_url: &str,
    session_id: &str,
    meeting_id: &str,
    driver: &SyncDriver,
) -> Result<Option<Window>, JsValue> {
    let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
    let params = PopupParams {
        mode: ContextMode::Mirror,
        session_id: session_id.to_string(),
        meeting_id: meeting_id.to_string(),
        timestamp: driver.observer().now_ms(),
    };
    let url = build_popup_url(base_url, &params).map_err(|error| JsValue::from_str(&error.to_string()))?;

    let popup = window.open_with_url_and_target_and_features(&url, POPUP_TARGET, POPUP_FEATURES)?;
    match popup.clone().map(WebWindow::attach) {
        Some(Ok(tier)) => driver.attach_transport(Box::new(tier)),
        Some(Err(error)) => log::info!("Popup opened without direct messaging: {}", error),
        None => log::warn!("Popup blocked; mirror will sync over the remaining tiers"),
    }
    Ok(popup)
}

/// Drive the sync tick from a browser interval until shutdown.
pub fn spawn_sync_loop(driver: SyncDriver, timing: &TimingSection) {
    let period_ms = timing.sync_period_ms();
    wasm_bindgen_futures::spawn_local(async move {
        run_sync_loop(&driver, IntervalStream::new(period_ms)).await;
    });
}

/// Render on an interval. Owners also apply the expiry policy each frame.
pub fn spawn_render_loop(
    observer: TimerObserver,
    controller: Option<Rc<TimerController>>,
    timing: &TimingSection,
    on_frame: impl Fn(Frame) + 'static,
) {
    use futures::StreamExt;

    let period_ms = timing.render_period_ms();
    wasm_bindgen_futures::spawn_local(async move {
        let mut frames = IntervalStream::new(period_ms);
        while frames.next().await.is_some() {
            if observer.is_shut_down() {
                break;
            }
            if let Some(controller) = controller.as_ref() {
                auto_advance(controller);
            }
            on_frame(render_frame(&observer));
        }
    });
}
