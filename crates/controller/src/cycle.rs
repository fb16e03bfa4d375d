//! Per-iteration result shared by the background loops. A loop driver logs
//! the outcome and always proceeds to its next tick.

use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Everything the cycle attempted succeeded.
    Ok,
    /// Part of the cycle failed; the store holds the degraded result.
    Degraded(String),
    /// The cycle could not run at all.
    Failed(String),
}

impl CycleOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn log(&self, task: &'static str) {
        match self {
            Self::Ok => debug!(task, "cycle ok"),
            Self::Degraded(why) => warn!(task, reason = %why, "cycle degraded"),
            Self::Failed(why) => error!(task, reason = %why, "cycle failed"),
        }
    }
}

/// Fold a sequence of partial failures into one outcome.
pub fn degraded_if_any(problems: Vec<String>) -> CycleOutcome {
    if problems.is_empty() {
        CycleOutcome::Ok
    } else {
        CycleOutcome::Degraded(problems.join("; "))
    }
}
