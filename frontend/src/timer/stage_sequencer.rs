use super::clock_engine::ClockEngine;
use shared::Stage;

/// Ordered stages of a meeting and the one currently loaded into the clock.
///
/// Every transition goes through [`ClockEngine::load_stage`], so moving
/// between stages always leaves the timer stopped with no adjustment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageSequencer {
    stages: Vec<Stage>,
    current_index: usize,
}

impl StageSequencer {
    pub fn new(mut stages: Vec<Stage>) -> Self {
        stages.sort_by_key(|stage| stage.order_index);
        Self {
            stages,
            current_index: 0,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages.get(self.current_index)
    }

    pub fn is_last(&self) -> bool {
        self.stages.is_empty() || self.current_index + 1 >= self.stages.len()
    }

    pub fn is_first(&self) -> bool {
        self.current_index == 0
    }

    pub fn next(&mut self, engine: &mut ClockEngine) -> bool {
        if self.is_last() {
            return false;
        }
        self.current_index += 1;
        self.load_current(engine);
        true
    }

    pub fn prev(&mut self, engine: &mut ClockEngine) -> bool {
        if self.is_first() {
            return false;
        }
        self.current_index -= 1;
        self.load_current(engine);
        true
    }

    /// Reload the active stage's nominal duration (used by RESET too).
    pub fn load_current(&self, engine: &mut ClockEngine) {
        match self.current_stage() {
            Some(stage) => engine.load_stage(&stage.id, stage.duration_ms()),
            None => engine.load_stage("", 0),
        }
    }

    /// Replace the stage list. Re-renders hand over identical lists all the
    /// time; only a real change (length, or any id/duration) rewinds to the
    /// first stage.
    pub fn on_stages_replaced(&mut self, new_stages: Vec<Stage>, engine: &mut ClockEngine) -> bool {
        let mut new_stages = new_stages;
        new_stages.sort_by_key(|stage| stage.order_index);
        if !stages_differ(&self.stages, &new_stages) {
            // Names and colors may still have been edited.
            self.stages = new_stages;
            return false;
        }
        self.stages = new_stages;
        self.current_index = 0;
        self.load_current(engine);
        true
    }

    /// Take a stage list while keeping the clock as it is, positioned on
    /// `stage_id` if present. Used when a restored or received state arrives
    /// before the stage list does.
    pub fn adopt(&mut self, new_stages: Vec<Stage>, stage_id: &str) -> bool {
        let mut new_stages = new_stages;
        new_stages.sort_by_key(|stage| stage.order_index);
        match new_stages.iter().position(|stage| stage.id == stage_id) {
            Some(index) => {
                self.stages = new_stages;
                self.current_index = index;
                true
            }
            None => false,
        }
    }

    /// Align the index with a snapshot without touching the clock. The index
    /// never points past the list; an empty list stays at 0.
    pub fn sync_to(&mut self, stage_index: usize, stage_id: &str) {
        self.current_index = match self.stages.iter().position(|stage| stage.id == stage_id) {
            Some(index) => index,
            None => stage_index.min(self.stages.len().saturating_sub(1)),
        };
    }
}

fn stages_differ(current: &[Stage], incoming: &[Stage]) -> bool {
    current.len() != incoming.len()
        || current
            .iter()
            .zip(incoming)
            .any(|(a, b)| a.id != b.id || a.duration_seconds != b.duration_seconds)
}
