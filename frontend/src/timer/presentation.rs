//! Display-side helpers applied to `compute_remaining()` results. None of
//! this feeds back into the clock state.

use shared::{ControlAction, Stage, ADJUST_STEP_MS};

/// `MM:SS`, rounding partial seconds up so a timer shows `00:01` until it
/// actually reaches zero. Hours fold into minutes.
pub fn format_remaining(remaining_ms: i64) -> String {
    let total_seconds = (remaining_ms.max(0) + 999) / 1000;
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// Nearest multiple of the ±30s step. Used by the stage editor when the
/// presenter nudges a paused timer, so the display lands on round values.
pub fn round_to_adjust_step(remaining_ms: i64) -> i64 {
    let step = ADJUST_STEP_MS;
    let rounded = ((remaining_ms.max(0) + step / 2) / step) * step;
    rounded.max(0)
}

/// Auto-advance policy at the render-loop boundary: an expired timer moves
/// to the next stage, or stops on the last one.
pub fn auto_advance_action(expired: bool, on_last_stage: bool) -> Option<ControlAction> {
    match (expired, on_last_stage) {
        (false, _) => None,
        (true, false) => Some(ControlAction::Next),
        (true, true) => Some(ControlAction::Pause),
    }
}

/// Below this the display switches to the stage's alert color.
pub const ALERT_THRESHOLD_MS: i64 = 30_000;

pub fn stage_color(stage: &Stage, remaining_ms: i64) -> &str {
    if remaining_ms <= ALERT_THRESHOLD_MS && !stage.color_alert.is_empty() {
        &stage.color_alert
    } else {
        &stage.color_primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_remaining(0), "00:00");
        assert_eq!(format_remaining(1), "00:01");
        assert_eq!(format_remaining(57_950), "00:58");
        assert_eq!(format_remaining(60_000), "01:00");
        assert_eq!(format_remaining(3_723_000), "62:03");
        assert_eq!(format_remaining(-5), "00:00");
    }

    #[test]
    fn rounds_to_nearest_half_minute() {
        assert_eq!(round_to_adjust_step(44_000), 30_000);
        assert_eq!(round_to_adjust_step(45_000), 60_000);
        assert_eq!(round_to_adjust_step(14_999), 0);
        assert_eq!(round_to_adjust_step(-1), 0);
    }

    #[test]
    fn auto_advance_policy() {
        assert_eq!(auto_advance_action(false, false), None);
        assert_eq!(auto_advance_action(true, false), Some(ControlAction::Next));
        assert_eq!(auto_advance_action(true, true), Some(ControlAction::Pause));
    }

    #[test]
    fn alert_color_near_the_end() {
        let stage = Stage {
            id: "s".to_string(),
            name: "S".to_string(),
            duration_seconds: 60,
            order_index: 0,
            color_primary: "blue".to_string(),
            color_alert: "red".to_string(),
        };
        assert_eq!(stage_color(&stage, 45_000), "blue");
        assert_eq!(stage_color(&stage, 30_000), "red");
    }
}
