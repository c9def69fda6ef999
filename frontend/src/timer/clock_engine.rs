//! Anchor-based countdown.
//!
//! Remaining time is always re-derived from `start_time_ms` and the caller's
//! `now`. Nothing here counts ticks, so a throttled background tab or a popup
//! that misses frames still reads the correct value on its next poll.

use shared::{ControlAction, TimerSnapshot, TimerState};

/// What a control call did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Changed,
    Unchanged,
    /// NEXT / PREV: the stage sequencer owns these.
    Delegated,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClockEngine {
    state: TimerState,
}

impl ClockEngine {
    pub fn new(directory_id: impl Into<String>) -> Self {
        Self {
            state: TimerState {
                directory_id: directory_id.into(),
                ..TimerState::default()
            },
        }
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    /// `max(0, duration - elapsed + adjustments)`, elapsed counted only while
    /// running. Clamping happens here, so SUB30 never has to be rejected.
    pub fn compute_remaining(&self, now_ms: i64) -> i64 {
        compute_remaining(&self.state, now_ms)
    }

    /// Running and already at zero; the render loop decides what happens next.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.state.is_running && self.compute_remaining(now_ms) == 0
    }

    pub fn control(&mut self, action: ControlAction, now_ms: i64) -> ControlOutcome {
        let changed = match action {
            ControlAction::Play => self.play(now_ms),
            ControlAction::Pause => self.pause(now_ms),
            ControlAction::Reset => self.reset(),
            ControlAction::Add30 | ControlAction::Sub30 | ControlAction::Adjust { .. } => {
                self.adjust(action.adjustment_ms().unwrap_or(0))
            }
            ControlAction::Next | ControlAction::Prev => return ControlOutcome::Delegated,
        };
        if changed {
            ControlOutcome::Changed
        } else {
            ControlOutcome::Unchanged
        }
    }

    pub fn play(&mut self, now_ms: i64) -> bool {
        if self.state.is_running {
            return false;
        }
        self.state.start_time_ms = Some(now_ms);
        self.state.is_running = true;
        true
    }

    /// Fold-on-pause: the remaining time becomes the new base duration and the
    /// adjustment is consumed.
    pub fn pause(&mut self, now_ms: i64) -> bool {
        if !self.state.is_running {
            return false;
        }
        self.state.duration_ms = self.compute_remaining(now_ms);
        self.state.start_time_ms = None;
        self.state.adjustments_ms = 0;
        self.state.is_running = false;
        true
    }

    /// Stops and clears the adjustment. The duration is reloaded by the caller.
    pub fn reset(&mut self) -> bool {
        let before = self.state.clone();
        self.state.start_time_ms = None;
        self.state.adjustments_ms = 0;
        self.state.is_running = false;
        before != self.state
    }

    pub fn adjust(&mut self, delta_ms: i64) -> bool {
        if delta_ms == 0 {
            return false;
        }
        self.state.adjustments_ms = self.state.adjustments_ms.saturating_add(delta_ms);
        true
    }

    /// Load a stage: stopped, no adjustment, nominal duration.
    pub fn load_stage(&mut self, stage_id: &str, duration_ms: i64) {
        self.state.duration_ms = duration_ms.max(0);
        self.state.start_time_ms = None;
        self.state.adjustments_ms = 0;
        self.state.is_running = false;
        self.state.stage_id = stage_id.to_string();
    }

    /// Overwrite every field with a received or restored state.
    pub fn hydrate(&mut self, state: TimerState) {
        self.state = state;
    }

    pub fn set_directory_id(&mut self, directory_id: &str) {
        self.state.directory_id = directory_id.to_string();
    }
}

pub fn compute_remaining(state: &TimerState, now_ms: i64) -> i64 {
    let elapsed = match (state.is_running, state.start_time_ms) {
        (true, Some(start)) => now_ms.saturating_sub(start),
        _ => 0,
    };
    state
        .duration_ms
        .saturating_sub(elapsed)
        .saturating_add(state.adjustments_ms)
        .max(0)
}

/// Re-anchor a snapshot onto the receiver's clock.
///
/// The sender's anchor is only meaningful on the sender's clock; what both
/// sides agree on is how long the timer had been running when the snapshot
/// was sent. That elapsed span is replayed from the receiver's `now`.
pub fn rebase_snapshot(snapshot: &TimerSnapshot, local_now_ms: i64) -> TimerState {
    let mut state = snapshot.state.clone();
    if state.is_running {
        if let Some(start) = state.start_time_ms {
            let elapsed_at_send = snapshot.sent_at_ms.saturating_sub(start).max(0);
            state.start_time_ms = Some(local_now_ms - elapsed_at_send);
        } else {
            state.start_time_ms = Some(local_now_ms);
        }
    } else {
        state.start_time_ms = None;
    }
    state
}
