//! Browser bindings.
//!
//! Only compiled for wasm32. The rest of the crate is target independent and
//! runs natively under the in-memory hub.

#[cfg(target_arch = "wasm32")]
pub mod web;

#[cfg(target_arch = "wasm32")]
pub use web::{
    boot_mirror, boot_owner, build_transport, init_console_logger, open_mirror_popup,
    spawn_render_loop, spawn_sync_loop, LocalStorage, OwnerPage, PerformanceTimeSource,
    WebBroadcast, WebWindow,
};
