//! Dataflow primitives shared by the timer and sync layers
//!
//! - **[`Relay`]** - channel feeding arriving envelopes into a transport inbox
//! - **[`Listeners`]** - callback registry behind `subscribe -> unsubscribe`
//!
//! Reactive UI bindings use `futures_signals::signal::Mutable` directly; see
//! `TimerObserver::state_signal`.

pub mod listeners;
pub mod relay;

pub use listeners::{Listeners, Subscription};
pub use relay::{drain_ready, relay, Relay, RelayError};
