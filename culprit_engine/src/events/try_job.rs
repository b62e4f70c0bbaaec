//! Try-job lifecycle events for an analysis.

use serde::{Deserialize, Serialize};

/// Events that move an analysis through its try-job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TryJobEvent {
    /// Need for verification was decided.
    Evaluated { needed: bool },
    /// The scheduler accepted the request.
    Scheduled { try_job_id: String },
    /// The try-job build started.
    Started,
    /// A verdict was reached (culprit found or inconclusive).
    Completed,
    /// The failure did not reproduce.
    FlakeDetected,
    /// The try job could not be scheduled or ended abnormally.
    Failed { reason: String },
}

/// Try-job lifecycle of one (build, kind) analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TryJobPhase {
    #[default]
    NotNeeded,
    Needed,
    Scheduled,
    Running,
    Completed,
    Flaky,
    Error,
}

impl TryJobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TryJobPhase::Completed | TryJobPhase::Flaky | TryJobPhase::Error
        )
    }

    /// Applies an event, returning whether the transition was legal.
    /// Illegal events leave the phase unchanged.
    pub fn apply(&mut self, event: &TryJobEvent) -> bool {
        use TryJobPhase::*;

        let next = match (*self, event) {
            (NotNeeded | Needed | Error, TryJobEvent::Evaluated { needed }) => {
                if *needed {
                    Needed
                } else {
                    NotNeeded
                }
            }
            (Needed, TryJobEvent::Scheduled { .. }) => Scheduled,
            (Scheduled, TryJobEvent::Started) => Running,
            (Scheduled | Running, TryJobEvent::Completed) => Completed,
            (Scheduled | Running, TryJobEvent::FlakeDetected) => Flaky,
            (Needed | Scheduled | Running, TryJobEvent::Failed { .. }) => Error,
            _ => return false,
        };
        *self = next;
        true
    }
}
