//! Persisted state of one failure analysis.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::build::BuildKey;
use super::failure::{FailedStep, FailureKind};
use super::suspect::{Culprit, SuspectedCl};
use crate::events::try_job::TryJobPhase;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AnalysisKey {
    pub build: BuildKey,
    pub kind: FailureKind,
}

impl AnalysisKey {
    pub fn new(build: BuildKey, kind: FailureKind) -> Self {
        Self { build, kind }
    }
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.build, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisResultStatus {
    Found,
    NotFound,
    Flaky,
}

/// Suspects of one failed step, with the test-level suspects behind them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSuspects {
    pub step_name: String,
    pub suspects: Vec<SuspectedCl>,
    #[serde(default)]
    pub tests: BTreeMap<String, Vec<SuspectedCl>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub key: AnalysisKey,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub result: Option<AnalysisResultStatus>,
    #[serde(default)]
    pub failed_steps: Vec<FailedStep>,
    #[serde(default)]
    pub step_suspects: Vec<StepSuspects>,
    /// Ranked, one entry per revision.
    #[serde(default)]
    pub suspected_cls: Vec<SuspectedCl>,
    #[serde(default)]
    pub failure_group_id: Option<Uuid>,
    #[serde(default)]
    pub failure_group_build_id: Option<i64>,
    #[serde(default)]
    pub try_job_phase: TryJobPhase,
    #[serde(default)]
    pub culprits: Vec<Culprit>,
    #[serde(default)]
    pub flaky: bool,
    /// Cleared for flaky failures so downstream auto-revert stays off.
    #[serde(default = "default_true")]
    pub auto_action_allowed: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Analysis {
    pub fn new(key: AnalysisKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: AnalysisStatus::Pending,
            result: None,
            failed_steps: Vec::new(),
            step_suspects: Vec::new(),
            suspected_cls: Vec::new(),
            failure_group_id: None,
            failure_group_build_id: None,
            try_job_phase: TryJobPhase::NotNeeded,
            culprits: Vec::new(),
            flaky: false,
            auto_action_allowed: true,
            error: None,
            start_time: now,
            end_time: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = AnalysisStatus::Error;
        self.error = Some(reason.into());
        self.end_time = Some(now);
    }

    pub fn step(&self, step_name: &str) -> Option<&FailedStep> {
        self.failed_steps.iter().find(|s| s.step_name == step_name)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AnalysisStatus::Completed | AnalysisStatus::Error)
    }

    /// Whether a finished try job already folded its verdict in.
    pub fn has_try_job_verdict(&self) -> bool {
        matches!(self.try_job_phase, TryJobPhase::Completed | TryJobPhase::Flaky)
    }

    /// Copies a previous run's try-job verdict onto a fresh analysis.
    pub fn carry_verdict(&mut self, previous: &Analysis) {
        self.try_job_phase = previous.try_job_phase;
        self.result = previous.result;
        self.culprits = previous.culprits.clone();
        self.flaky = previous.flaky;
        self.auto_action_allowed = previous.auto_action_allowed;
    }
}
