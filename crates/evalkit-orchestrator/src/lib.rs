//! Pure Run state machine (§4.6) and deterministic scenario sampling
//! (§4.6, §8 property 2). Nothing in this crate performs I/O: it takes a
//! state and an event and returns a new state plus the commands a caller
//! should act on, the same shape this codebase uses for its other
//! reducers.

pub mod reducer;
pub mod sampling;

pub use reducer::{reduce, RunCommand, RunEvent, RunState};
pub use sampling::sample_scenarios;

use evalkit_types::ProgressCounters;

/// Completion fraction in `[0, 1]`, `0.0` for an empty total.
pub fn completion_percentage(progress: &ProgressCounters) -> f64 {
    if progress.total == 0 {
        0.0
    } else {
        (progress.completed + progress.failed) as f64 / progress.total as f64
    }
}
