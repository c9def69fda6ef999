//! Event streaming Relay
//!
//! Relay carries raw envelopes from the place they arrive (a browser
//! `onmessage` callback, an in-memory hub delivery) to the transport that
//! drains them on the next sync tick.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use std::sync::{Arc, OnceLock};

/// Type-safe event streaming relay.
///
/// # Event-Source Naming Convention
///
/// Relays follow the `{source}_{event}_relay` pattern:
/// - `channel_message_relay` - BroadcastChannel delivered an envelope
/// - `window_message_relay` - `postMessage` delivered an envelope
///
/// # Examples
///
/// ```rust
/// use timer_frontend::dataflow::{relay, drain_ready};
///
/// let (channel_message_relay, mut inbox) = relay::<String>();
/// channel_message_relay.send("{\"type\":\"PING\"}".to_string());
///
/// assert_eq!(drain_ready(&mut inbox).len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct Relay<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: UnboundedSender<T>,
    #[cfg(debug_assertions)]
    emit_location: Arc<OnceLock<&'static std::panic::Location<'static>>>,
}

/// Error type for Relay operations
#[derive(Debug, Clone)]
pub enum RelayError {
    /// The channel has been closed (receiver dropped)
    ChannelClosed,
    /// Relay send called from multiple locations (debug builds only)
    #[cfg(debug_assertions)]
    MultipleEmitters {
        previous: &'static std::panic::Location<'static>,
        current: &'static std::panic::Location<'static>,
    },
}

impl<T> Relay<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (sender, receiver) = unbounded();
        (
            Relay {
                sender,
                #[cfg(debug_assertions)]
                emit_location: Arc::new(OnceLock::new()),
            },
            receiver,
        )
    }

    /// In debug builds, enforces that a relay is only fed from one call site.
    #[cfg(debug_assertions)]
    #[track_caller]
    fn check_single_source(&self) -> Result<(), RelayError> {
        let caller = std::panic::Location::caller();
        match self.emit_location.set(caller) {
            Ok(()) => Ok(()),
            Err(previous) if previous == caller => Ok(()),
            Err(previous) => Err(RelayError::MultipleEmitters {
                previous,
                current: caller,
            }),
        }
    }

    /// Send an event through the relay.
    ///
    /// If the receiver has been dropped the event is discarded, which is the
    /// at-most-once behavior every transport tier has anyway.
    #[track_caller]
    pub fn send(&self, value: T) {
        #[cfg(debug_assertions)]
        if let Err(e) = self.check_single_source() {
            panic!("{:?}", e);
        }

        let _ = self.sender.unbounded_send(value);
    }

    /// Send with explicit error handling.
    #[track_caller]
    pub fn try_send(&self, value: T) -> Result<(), RelayError> {
        #[cfg(debug_assertions)]
        self.check_single_source()?;

        self.sender
            .unbounded_send(value)
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Whether the receiving side still exists.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl<T> Default for Relay<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A disconnected relay: events are silently discarded.
    fn default() -> Self {
        let (relay, _receiver) = Self::new();
        relay
    }
}

/// Creates a new Relay with an associated receiver stream.
pub fn relay<T>() -> (Relay<T>, UnboundedReceiver<T>)
where
    T: Clone + Send + Sync + 'static,
{
    Relay::new()
}

/// Take everything already queued without waiting.
///
/// Sync ticks are driven by the host's timers, so transports never await
/// their inbox; they take what has arrived since the previous tick.
pub fn drain_ready<T>(receiver: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut ready = Vec::new();
    while let Ok(Some(value)) = receiver.try_next() {
        ready.push(value);
    }
    ready
}
