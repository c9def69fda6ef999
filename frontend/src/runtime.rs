//! Host loops: the sync tick and the render frame.
//!
//! Both are plain functions over the service handles so the browser
//! bindings, the simulator and the tests drive them the same way.

use crate::service::{SyncDriver, TimerController, TimerObserver};
use crate::sync::ConnectionStatus;
use crate::timer::presentation::{
    auto_advance_action, format_remaining, round_to_adjust_step, stage_color,
};
use futures::{Stream, StreamExt};
use shared::ControlAction;

/// Tick the driver once per stream item until the stream ends or the
/// service shuts down. Returns the number of ticks run.
pub async fn run_sync_loop<S>(driver: &SyncDriver, mut ticks: S) -> usize
where
    S: Stream + Unpin,
{
    let mut count = 0;
    while ticks.next().await.is_some() {
        if driver.is_shut_down() {
            break;
        }
        driver.tick();
        count += 1;
    }
    log::debug!("Sync loop stopped after {} ticks", count);
    count
}

/// Everything a timer display needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub remaining_ms: i64,
    pub display: String,
    /// While paused, the value the ±30s buttons snap around.
    pub rounded_ms: Option<i64>,
    pub stage_name: Option<String>,
    pub color: Option<String>,
    pub is_running: bool,
    pub connection: ConnectionStatus,
}

pub fn render_frame(observer: &TimerObserver) -> Frame {
    let view = observer.get_state();
    let remaining_ms = view.remaining_ms(observer.now_ms());
    Frame {
        remaining_ms,
        display: format_remaining(remaining_ms),
        rounded_ms: (!view.state.is_running).then(|| round_to_adjust_step(remaining_ms)),
        stage_name: view.stage.as_ref().map(|stage| stage.name.clone()),
        color: view
            .stage
            .as_ref()
            .map(|stage| stage_color(stage, remaining_ms).to_string()),
        is_running: view.state.is_running,
        connection: view.connection,
    }
}

/// Owner-side expiry policy, run from the render loop: advance to the next
/// stage, or pause on the last one.
pub fn auto_advance(controller: &TimerController) -> Option<ControlAction> {
    let observer = controller.observer();
    let action = auto_advance_action(observer.is_expired(), observer.get_state().is_last_stage())?;
    log::info!("Timer expired, auto {:?}", action);
    controller.control(action);
    Some(action)
}
