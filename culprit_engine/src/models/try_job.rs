//! Try jobs: bisection builds used to confirm or narrow a culprit.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::build::BuildKey;
use super::failure::FailureKind;

/// At most one non-terminal try job exists per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TryJobKey {
    pub build: BuildKey,
    pub kind: FailureKind,
}

impl TryJobKey {
    pub fn new(build: BuildKey, kind: FailureKind) -> Self {
        Self { build, kind }
    }
}

impl fmt::Display for TryJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.build, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TryJobStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl TryJobStatus {
    pub const TERMINAL: [TryJobStatus; 2] = [TryJobStatus::Completed, TryJobStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            TryJobStatus::Pending => "pending",
            TryJobStatus::Running => "running",
            TryJobStatus::Completed => "completed",
            TryJobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TryJobStatus::Pending),
            "running" => Some(TryJobStatus::Running),
            "completed" => Some(TryJobStatus::Completed),
            "error" => Some(TryJobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Revisions and targets a try job bisects over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJobRange {
    pub good_revision: String,
    pub bad_revision: String,
    /// Compile targets to build (compile try jobs).
    #[serde(default)]
    pub compile_targets: Vec<String>,
    /// Tests to rerun per step (test try jobs).
    #[serde(default)]
    pub tests: BTreeMap<String, Vec<String>>,
}

/// Outcome reported for one step at one tested revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: String,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

/// Result at one tested revision. Compile try jobs report a single status;
/// test try jobs report per-step outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionResult {
    pub revision: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepOutcome>,
}

pub const STATUS_PASSED: &str = "passed";
pub const STATUS_FAILED: &str = "failed";

/// Report produced by a completed try job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJobReport {
    /// Tested revisions in commit order, oldest first.
    #[serde(default)]
    pub result: Vec<RevisionResult>,
    #[serde(default)]
    pub culprit: Option<String>,
    /// Per-failure culprits (`step/test` → revision) for test try jobs.
    #[serde(default)]
    pub culprits: BTreeMap<String, String>,
    #[serde(default)]
    pub good_revision: Option<String>,
    #[serde(default)]
    pub bad_revision: Option<String>,
    #[serde(default)]
    pub sub_ranges: Vec<(String, String)>,
}

impl TryJobReport {
    pub fn result_at(&self, revision: &str) -> Option<&RevisionResult> {
        self.result.iter().find(|r| r.revision == revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJob {
    pub key: TryJobKey,
    /// Bumped every time a terminal job is revived for another attempt.
    pub attempt: u32,
    pub status: TryJobStatus,
    #[serde(default)]
    pub try_job_ids: Vec<String>,
    #[serde(default)]
    pub range: Option<TryJobRange>,
    #[serde(default)]
    pub suspected_revisions: Vec<String>,
    #[serde(default)]
    pub results: Vec<TryJobReport>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_seconds: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TryJob {
    pub fn new(key: TryJobKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            attempt: 1,
            status: TryJobStatus::Pending,
            try_job_ids: Vec::new(),
            range: None,
            suspected_revisions: Vec::new(),
            results: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            elapsed_seconds: None,
            error: None,
        }
    }

    /// A claim whose trigger never landed: still PENDING without a scheduler
    /// id after `timeout`. The claimant most likely died mid-schedule.
    pub fn is_stale_claim(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == TryJobStatus::Pending
            && self.try_job_ids.is_empty()
            && now - self.created_at >= timeout
    }

    /// Resets a terminal job or a stale claim for a new attempt, keeping its
    /// history.
    pub fn revive(&mut self, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = TryJobStatus::Pending;
        self.created_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.elapsed_seconds = None;
        self.error = None;
    }

    pub fn latest_report(&self) -> Option<&TryJobReport> {
        self.results.last()
    }
}

/// Result of the atomic revive-or-create against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryJobClaim {
    Created(TryJob),
    Revived(TryJob),
    /// A non-terminal job already exists; nothing was written.
    InFlight(TryJob),
}

impl TryJobClaim {
    pub fn try_job(&self) -> &TryJob {
        match self {
            TryJobClaim::Created(job) | TryJobClaim::Revived(job) | TryJobClaim::InFlight(job) => {
                job
            }
        }
    }

    pub fn into_try_job(self) -> TryJob {
        match self {
            TryJobClaim::Created(job) | TryJobClaim::Revived(job) | TryJobClaim::InFlight(job) => {
                job
            }
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TryJobClaim::InFlight(_))
    }
}

/// Completion result of an external try-job build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalResult {
    Success,
    Failure,
    InfraFailure,
    Canceled,
}

/// Status of a try-job build as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalTryJobStatus {
    Scheduled,
    Started {
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
    },
    Completed {
        result: ExternalResult,
        #[serde(default)]
        report: Option<TryJobReport>,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revive_bumps_attempt_and_clears_terminal_state() {
        let now = Utc::now();
        let key = TryJobKey::new(BuildKey::new("chromium", "linux", 120), FailureKind::Compile);
        let mut job = TryJob::new(key, now);
        job.status = TryJobStatus::Error;
        job.error = Some("rejected".into());
        job.try_job_ids.push("8001".into());
        job.revive(now);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.status, TryJobStatus::Pending);
        assert!(job.error.is_none());
        assert_eq!(job.try_job_ids, vec!["8001".to_string()]);
    }

    #[test]
    fn external_status_deserializes_tagged() {
        let status: ExternalTryJobStatus =
            serde_json::from_str(r#"{"status":"COMPLETED","result":"INFRA_FAILURE"}"#).unwrap();
        assert!(matches!(
            status,
            ExternalTryJobStatus::Completed {
                result: ExternalResult::InfraFailure,
                report: None,
                ..
            }
        ));
    }
}
