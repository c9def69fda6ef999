//! Composition root: one clock engine, one stage sequencer, one sync session
//! and the durable record, wired together per context.
//!
//! Consumers never see the parts. An owning window gets a
//! [`TimerController`] (write) and [`TimerObserver`] (read); a mirror gets an
//! observer and a [`RemoteControl`] that forwards commands to the owner.
//! Both get a [`SyncDriver`] that the host calls on every sync tick.

use crate::dataflow::{Listeners, Subscription};
use crate::sync::{
    ConnectionState, ConnectionStatus, SessionEvent, SessionRole, SyncDiagnostics, SyncSession,
    SyncTransport, TimerStore, Transport,
};
use crate::time_types::TimeSource;
use crate::timer::{compute_remaining, rebase_snapshot, ClockEngine, StageSequencer};
use futures_signals::signal::{Mutable, Signal};
use shared::{ControlAction, Stage, StoredTimerRecord, TimerSnapshot, TimerState, TimingSection};
use std::cell::RefCell;
use std::rc::Rc;

/// What subscribers see after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimerView {
    pub state: TimerState,
    pub stage_index: usize,
    pub stage: Option<Stage>,
    pub stage_count: usize,
    pub connection: ConnectionStatus,
    pub revision: u64,
}

impl TimerView {
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        compute_remaining(&self.state, now_ms)
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_count == 0 || self.stage_index + 1 >= self.stage_count
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub context_id: String,
    pub directory_id: String,
    pub stages: Vec<Stage>,
    pub timing: TimingSection,
}

impl ServiceOptions {
    pub fn new(directory_id: impl Into<String>) -> Self {
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            directory_id: directory_id.into(),
            stages: Vec::new(),
            timing: TimingSection::default(),
        }
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = context_id.into();
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_timing(mut self, timing: TimingSection) -> Self {
        self.timing = timing;
        self
    }
}

struct ServiceCore {
    role: SessionRole,
    clock: Rc<dyn TimeSource>,
    engine: ClockEngine,
    sequencer: StageSequencer,
    session: SyncSession,
    store: Option<TimerStore>,
    /// Owner: bumped on every local change. Mirror: last revision applied.
    revision: u64,
    last_local_change_at: Option<i64>,
    /// Stage carried by the last snapshot when the local list doesn't have it.
    remote_stage: Option<Stage>,
    /// Index carried by the last snapshot, shown while there is no local list.
    remote_stage_index: usize,
    /// A restored state is waiting for its stage list.
    pending_restore: bool,
    shut_down: bool,
}

impl ServiceCore {
    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn view(&self) -> TimerView {
        TimerView {
            state: self.engine.state().clone(),
            stage_index: if self.sequencer.is_empty() {
                self.remote_stage_index
            } else {
                self.sequencer.current_index()
            },
            stage: self
                .sequencer
                .current_stage()
                .cloned()
                .or_else(|| self.remote_stage.clone()),
            stage_count: self.sequencer.len(),
            connection: self.session.connection().status(),
            revision: self.revision,
        }
    }

    fn snapshot(&self, now_ms: i64) -> TimerSnapshot {
        TimerSnapshot {
            state: self.engine.state().clone(),
            stage_index: self.sequencer.current_index(),
            stage: self.sequencer.current_stage().cloned(),
            sent_at_ms: now_ms,
            revision: self.revision,
        }
    }

    /// Restore from the durable record, if there is one for this directory.
    fn restore(&mut self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let record = match store.load() {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(error) => {
                log::warn!("Ignoring unreadable timer record: {}", error);
                return;
            }
        };

        let directory_id = self.engine.state().directory_id.clone();
        let (state, stage_index, revision) = match record {
            StoredTimerRecord::Current(snapshot) => {
                let stored_directory = &snapshot.state.directory_id;
                if !stored_directory.is_empty() && *stored_directory != directory_id {
                    log::debug!("Stored timer belongs to directory {}", stored_directory);
                    return;
                }
                let mut state = snapshot.state;
                state.directory_id = directory_id;
                (state, snapshot.stage_index, snapshot.revision)
            }
            StoredTimerRecord::Legacy(legacy) => {
                let (stage_id, duration_ms) = self
                    .sequencer
                    .current_stage()
                    .map(|stage| (stage.id.clone(), stage.duration_ms()))
                    .unwrap_or_default();
                let state = legacy.into_state(duration_ms, &directory_id, &stage_id);
                (state, self.sequencer.current_index(), 0)
            }
        };

        log::info!(
            "Restored timer state (stage {}, running {})",
            state.stage_id,
            state.is_running
        );
        let stages = self.sequencer.stages().to_vec();
        if stages.is_empty() {
            self.pending_restore = true;
            self.remote_stage_index = stage_index;
        } else if !self.sequencer.adopt(stages, &state.stage_id) {
            self.sequencer.sync_to(stage_index, &state.stage_id);
        }
        self.engine.hydrate(state);
        self.revision = revision;
    }

    /// Apply a command to local state. `true` if anything changed.
    fn apply_local(&mut self, action: ControlAction, now_ms: i64) -> bool {
        let before = (self.engine.state().clone(), self.sequencer.current_index());
        match action {
            ControlAction::Next => {
                self.sequencer.next(&mut self.engine);
            }
            ControlAction::Prev => {
                self.sequencer.prev(&mut self.engine);
            }
            ControlAction::Reset => {
                self.engine.reset();
                self.sequencer.load_current(&mut self.engine);
            }
            other => {
                self.engine.control(other, now_ms);
            }
        }
        before != (self.engine.state().clone(), self.sequencer.current_index())
    }

    /// Persist and broadcast after a local change.
    fn commit(&mut self, now_ms: i64) {
        self.revision += 1;
        self.last_local_change_at = Some(now_ms);
        let snapshot = self.snapshot(now_ms);
        if let Some(store) = self.store.as_ref() {
            if let Err(error) = store.save(&snapshot) {
                log::warn!("Failed to persist timer state: {}", error);
            }
        }
        self.session.send_snapshot(snapshot, now_ms);
    }

    /// Last-writer-wins. Mirrors take any snapshot not behind the revision
    /// they hold; an owner only takes one sent after its own latest change.
    fn apply_snapshot(&mut self, snapshot: TimerSnapshot, now_ms: i64) -> bool {
        match self.role {
            SessionRole::Owner => {
                if let Some(changed_at) = self.last_local_change_at {
                    if snapshot.sent_at_ms < changed_at {
                        log::debug!("Ignoring older snapshot revision {}", snapshot.revision);
                        return false;
                    }
                }
            }
            // Tiers deliver independently, so an older revision can land last.
            SessionRole::Mirror => {
                if snapshot.revision < self.revision {
                    log::debug!(
                        "Ignoring snapshot revision {} behind {}",
                        snapshot.revision,
                        self.revision
                    );
                    return false;
                }
            }
        }

        let mut state = rebase_snapshot(&snapshot, now_ms);
        state.directory_id = self.engine.state().directory_id.clone();
        self.sequencer.sync_to(snapshot.stage_index, &state.stage_id);
        self.remote_stage = snapshot.stage;
        self.remote_stage_index = snapshot.stage_index;
        self.engine.hydrate(state);
        self.revision = match self.role {
            SessionRole::Owner => self.revision.max(snapshot.revision),
            SessionRole::Mirror => snapshot.revision,
        };
        true
    }

    /// Degraded mirrors also watch the durable record.
    fn poll_record(&mut self) -> bool {
        if self.role != SessionRole::Mirror || !self.session.connection().is_degraded {
            return false;
        }
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.load() {
            Ok(Some(StoredTimerRecord::Current(snapshot))) if snapshot.revision > self.revision => {
                log::debug!("Hydrating from stored record revision {}", snapshot.revision);
                let mut state = snapshot.state;
                state.directory_id = self.engine.state().directory_id.clone();
                self.sequencer.sync_to(snapshot.stage_index, &state.stage_id);
                self.remote_stage = snapshot.stage;
                self.remote_stage_index = snapshot.stage_index;
                self.engine.hydrate(state);
                self.revision = snapshot.revision;
                true
            }
            Ok(_) => false,
            Err(error) => {
                log::debug!("Stored record unreadable: {}", error);
                false
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent, now_ms: i64) -> bool {
        match event {
            SessionEvent::SnapshotRequested { requester } => {
                log::debug!("Answering snapshot request from {}", requester);
                let snapshot = self.snapshot(now_ms);
                self.session.send_snapshot(snapshot, now_ms);
                false
            }
            SessionEvent::SnapshotReceived(snapshot) => self.apply_snapshot(snapshot, now_ms),
            SessionEvent::ControlReceived(action) => {
                if self.apply_local(action, now_ms) {
                    self.commit(now_ms);
                    true
                } else {
                    false
                }
            }
            SessionEvent::ConnectionChanged(status) => {
                if status == ConnectionStatus::Connected {
                    match self.role {
                        SessionRole::Owner => {
                            let snapshot = self.snapshot(now_ms);
                            self.session.send_snapshot(snapshot, now_ms);
                        }
                        SessionRole::Mirror => {
                            self.session.request_sync(now_ms);
                        }
                    }
                }
                true
            }
        }
    }
}

/// Listener registry plus the signal mirror of the same value.
#[derive(Clone)]
struct Notifier {
    listeners: Listeners<TimerView>,
    state: Mutable<TimerView>,
}

impl Notifier {
    fn new(initial: TimerView) -> Self {
        Self {
            listeners: Listeners::new(),
            state: Mutable::new(initial),
        }
    }

    fn publish(&self, view: TimerView) {
        self.state.set(view.clone());
        self.listeners.emit(&view);
    }
}

#[derive(Clone)]
struct Shared {
    core: Rc<RefCell<ServiceCore>>,
    notifier: Notifier,
}

impl Shared {
    /// Run `f` against the core, then notify if it reported a change. The
    /// borrow is released before listeners run.
    fn update(&self, f: impl FnOnce(&mut ServiceCore) -> bool) {
        let view = {
            let mut core = self.core.borrow_mut();
            if core.shut_down || !f(&mut core) {
                return;
            }
            core.view()
        };
        self.notifier.publish(view);
    }

    fn read<R>(&self, f: impl FnOnce(&ServiceCore) -> R) -> R {
        f(&self.core.borrow())
    }
}

pub struct OwnerHandles {
    pub controller: TimerController,
    pub observer: TimerObserver,
    pub driver: SyncDriver,
}

pub struct MirrorHandles {
    pub observer: TimerObserver,
    pub remote: RemoteControl,
    pub driver: SyncDriver,
}

pub struct TimerService;

impl TimerService {
    /// The authoritative timer of a main window.
    pub fn owner(
        options: ServiceOptions,
        transport: SyncTransport,
        store: Option<TimerStore>,
        clock: Rc<dyn TimeSource>,
    ) -> OwnerHandles {
        let shared = Self::build(SessionRole::Owner, options, transport, store, clock);
        {
            let mut core = shared.core.borrow_mut();
            let now = core.now();
            let snapshot = core.snapshot(now);
            core.session.send_snapshot(snapshot, now);
        }
        OwnerHandles {
            controller: TimerController {
                shared: shared.clone(),
            },
            observer: TimerObserver {
                shared: shared.clone(),
            },
            driver: SyncDriver { shared },
        }
    }

    /// A mirror of some owner's timer, e.g. the presenter popup.
    pub fn mirror(
        options: ServiceOptions,
        transport: SyncTransport,
        store: Option<TimerStore>,
        clock: Rc<dyn TimeSource>,
    ) -> MirrorHandles {
        let shared = Self::build(SessionRole::Mirror, options, transport, store, clock);
        {
            let mut core = shared.core.borrow_mut();
            let now = core.now();
            core.session.announce(now);
        }
        MirrorHandles {
            observer: TimerObserver {
                shared: shared.clone(),
            },
            remote: RemoteControl {
                shared: shared.clone(),
            },
            driver: SyncDriver { shared },
        }
    }

    fn build(
        role: SessionRole,
        options: ServiceOptions,
        transport: SyncTransport,
        store: Option<TimerStore>,
        clock: Rc<dyn TimeSource>,
    ) -> Shared {
        let now = clock.now_ms();
        let mut engine = ClockEngine::new(options.directory_id.as_str());
        let sequencer = StageSequencer::new(options.stages);
        sequencer.load_current(&mut engine);

        let mut session = SyncSession::new(role, options.context_id, transport, &options.timing, now);
        session.bind_directory(&options.directory_id);

        let mut core = ServiceCore {
            role,
            clock,
            engine,
            sequencer,
            session,
            store,
            revision: 0,
            last_local_change_at: None,
            remote_stage: None,
            remote_stage_index: 0,
            pending_restore: false,
            shut_down: false,
        };
        core.restore();

        let notifier = Notifier::new(core.view());
        Shared {
            core: Rc::new(RefCell::new(core)),
            notifier,
        }
    }
}

/// Write access to an owned timer. Deliberately not `Clone`.
pub struct TimerController {
    shared: Shared,
}

impl TimerController {
    pub fn start(&self) {
        self.control(ControlAction::Play);
    }

    pub fn pause(&self) {
        self.control(ControlAction::Pause);
    }

    pub fn reset(&self) {
        self.control(ControlAction::Reset);
    }

    pub fn adjust(&self, delta_seconds: i64) {
        self.control(ControlAction::Adjust {
            delta_ms: delta_seconds.saturating_mul(1000),
        });
    }

    pub fn next(&self) {
        self.control(ControlAction::Next);
    }

    pub fn prev(&self) {
        self.control(ControlAction::Prev);
    }

    /// Apply, persist, broadcast, notify. Unchanged state sends nothing.
    pub fn control(&self, action: ControlAction) {
        self.shared.update(|core| {
            let now = core.now();
            if core.apply_local(action, now) {
                core.commit(now);
                true
            } else {
                false
            }
        });
    }

    /// Hand over the current stage list. Identical lists are ignored.
    pub fn replace_stages(&self, stages: Vec<Stage>) {
        self.shared.update(|core| {
            let now = core.now();
            let ServiceCore {
                engine,
                sequencer,
                pending_restore,
                ..
            } = &mut *core;
            let changed = if *pending_restore {
                *pending_restore = false;
                let stage_id = engine.state().stage_id.clone();
                sequencer.adopt(stages.clone(), &stage_id)
                    || sequencer.on_stages_replaced(stages, engine)
            } else {
                sequencer.on_stages_replaced(stages, engine)
            };
            if changed {
                core.commit(now);
            }
            changed
        });
    }

    pub fn get_state(&self) -> TimerView {
        self.shared.read(ServiceCore::view)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.shared.read(|core| core.snapshot(core.now()))
    }

    pub fn subscribe(&self, listener: impl Fn(&TimerView) + 'static) -> Subscription {
        self.shared.notifier.listeners.subscribe(listener)
    }

    pub fn observer(&self) -> TimerObserver {
        TimerObserver {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view of a timer, owner or mirror.
#[derive(Clone)]
pub struct TimerObserver {
    shared: Shared,
}

impl TimerObserver {
    pub fn get_state(&self) -> TimerView {
        self.shared.read(ServiceCore::view)
    }

    pub fn now_ms(&self) -> i64 {
        self.shared.read(ServiceCore::now)
    }

    pub fn remaining_ms(&self) -> i64 {
        self.shared
            .read(|core| core.engine.compute_remaining(core.now()))
    }

    pub fn is_expired(&self) -> bool {
        self.shared.read(|core| core.engine.is_expired(core.now()))
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.get_state().stage
    }

    pub fn connection(&self) -> ConnectionState {
        self.shared.read(|core| core.session.connection().clone())
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        self.shared.read(|core| core.session.diagnostics().clone())
    }

    pub fn subscribe(&self, listener: impl Fn(&TimerView) + 'static) -> Subscription {
        self.shared.notifier.listeners.subscribe(listener)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.read(|core| core.shut_down)
    }

    pub fn state_signal(&self) -> impl Signal<Item = TimerView> + use<> {
        self.shared.notifier.state.signal_cloned()
    }
}

/// Mirror-side controls. Commands go to the owner; the mirror changes when
/// the owner's snapshot comes back.
#[derive(Clone)]
pub struct RemoteControl {
    shared: Shared,
}

impl RemoteControl {
    pub fn start(&self) {
        self.control(ControlAction::Play);
    }

    pub fn pause(&self) {
        self.control(ControlAction::Pause);
    }

    pub fn reset(&self) {
        self.control(ControlAction::Reset);
    }

    pub fn adjust(&self, delta_seconds: i64) {
        self.control(ControlAction::Adjust {
            delta_ms: delta_seconds.saturating_mul(1000),
        });
    }

    pub fn next(&self) {
        self.control(ControlAction::Next);
    }

    pub fn prev(&self) {
        self.control(ControlAction::Prev);
    }

    pub fn control(&self, action: ControlAction) {
        let mut core = self.shared.core.borrow_mut();
        if core.shut_down {
            return;
        }
        let now = core.now();
        core.session.send_control(action, now);
    }

    pub fn request_sync(&self) {
        let mut core = self.shared.core.borrow_mut();
        if core.shut_down {
            return;
        }
        let now = core.now();
        core.session.request_sync(now);
    }
}

/// Host-side handle for the sync tick and teardown.
#[derive(Clone)]
pub struct SyncDriver {
    shared: Shared,
}

impl SyncDriver {
    /// One sync tick. Returns the protocol events it handled.
    pub fn tick(&self) -> Vec<SessionEvent> {
        let mut handled = Vec::new();
        self.shared.update(|core| {
            let now = core.now();
            let events = core.session.poll(now);
            let mut changed = false;
            for event in events {
                handled.push(event.clone());
                changed |= core.handle_event(event, now);
            }
            changed |= core.poll_record();
            changed
        });
        handled
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.read(|core| core.shut_down)
    }

    pub fn observer(&self) -> TimerObserver {
        TimerObserver {
            shared: self.shared.clone(),
        }
    }

    /// Add a tier after startup, e.g. the handle of a popup opened later.
    pub fn attach_transport(&self, tier: Box<dyn Transport>) {
        let mut core = self.shared.core.borrow_mut();
        if !core.shut_down {
            core.session.transport_mut().attach(tier);
        }
    }

    /// Close transports and drop every subscriber. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut core = self.shared.core.borrow_mut();
            if core.shut_down {
                return;
            }
            core.session.close();
            core.shut_down = true;
        }
        self.shared.notifier.listeners.clear();
        log::info!("Timer service shut down");
    }
}
