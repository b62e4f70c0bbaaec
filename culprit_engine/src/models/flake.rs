//! Flake occurrences and their windowed aggregate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Gerrit CL id recorded for occurrences that are not tied to a CL.
pub const NO_CL: i64 = 0;

/// How a flaky behavior was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlakeType {
    /// CQ rejected a CL, then passed it on retry.
    CqFalseRejection,
    /// Failed with the patch, passed on the retry with the patch.
    RetryWithPatch,
    /// Failed and passed within the same CQ attempt, invisible to the author.
    CqHiddenFlake,
    /// Failing step on a continuous builder.
    CiFailedStep,
}

impl FlakeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlakeType::CqFalseRejection => "cq_false_rejection",
            FlakeType::RetryWithPatch => "retry_with_patch",
            FlakeType::CqHiddenFlake => "cq_hidden_flake",
            FlakeType::CiFailedStep => "ci_failed_step",
        }
    }
}

impl fmt::Display for FlakeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed flake. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeOccurrence {
    pub flake_type: FlakeType,
    pub build_id: i64,
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub test_name: String,
    pub time_happened: DateTime<Utc>,
    /// [`NO_CL`] when the occurrence is not tied to a CL.
    #[serde(default)]
    pub gerrit_cl_id: i64,
}

impl FlakeOccurrence {
    pub fn has_cl(&self) -> bool {
        self.gerrit_cl_id != NO_CL
    }
}

/// Counts for one flake type within the aggregation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeTypeCount {
    pub occurrence_count: i64,
    /// Distinct CLs impacted, or `-1` when the type's occurrences carry no CL.
    pub impacted_cl_count: i64,
}

impl FlakeTypeCount {
    /// Contribution of this type to the ranking score: distinct impacted CLs
    /// times `weight`.
    ///
    /// Types without CLs (CI failed steps) report `-1` impacted CLs, and the
    /// plain product would subtract from the score. Those types count their
    /// occurrences instead, so each CI failure adds `weight`.
    pub fn score(&self, weight: i64) -> i64 {
        if self.impacted_cl_count < 0 {
            self.occurrence_count * weight
        } else {
            self.impacted_cl_count * weight
        }
    }
}

/// Recomputed from scratch on every aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeAggregate {
    pub counts: BTreeMap<FlakeType, FlakeTypeCount>,
    pub score: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub last_occurred_time: Option<DateTime<Utc>>,
}

impl FlakeAggregate {
    pub fn occurrence_count(&self, flake_type: FlakeType) -> i64 {
        self.counts
            .get(&flake_type)
            .map(|c| c.occurrence_count)
            .unwrap_or(0)
    }

    pub fn impacted_cl_count(&self, flake_type: FlakeType) -> i64 {
        self.counts
            .get(&flake_type)
            .map(|c| c.impacted_cl_count)
            .unwrap_or(0)
    }
}
