//! Meeting timer core
//!
//! A drift-free stage timer that stays consistent across browser contexts:
//! the main window owns the timer, popups mirror it over broadcast, window
//! handle or storage transports.

// Core modules
pub mod dataflow;
pub mod popup;
pub mod runtime;
pub mod service;
pub mod sync;
pub mod time_types;
pub mod timer;

// Host bindings
pub mod platform;

// Multi-context harness
pub mod testing;

pub use popup::{build_popup_url, parse_popup_params, PopupError};
pub use runtime::{auto_advance, render_frame, run_sync_loop, Frame};
pub use service::{
    MirrorHandles, OwnerHandles, RemoteControl, ServiceOptions, SyncDriver, TimerController,
    TimerObserver, TimerService, TimerView,
};
pub use time_types::{ManualTimeSource, SkewedTimeSource, TimeSource};

#[cfg(not(target_arch = "wasm32"))]
pub use time_types::SystemTimeSource;
