pub mod clock_engine;
pub mod presentation;
pub mod stage_sequencer;

pub use clock_engine::{compute_remaining, rebase_snapshot, ClockEngine, ControlOutcome};
pub use stage_sequencer::StageSequencer;
