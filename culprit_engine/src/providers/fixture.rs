//! Static, in-memory providers backed by recorded data.
//!
//! Used to replay recorded build histories offline and as collaborators in
//! tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{BuildHistoryProvider, ChangeLogProvider, DepsExtractor, TryJobRequest, TryJobScheduler};
use crate::error::{ProviderError, SchedulerError};
use crate::models::build::Build;
use crate::models::change_log::{ChangeLog, DepsInfo};
use crate::models::failure::StepLogs;
use crate::models::try_job::ExternalTryJobStatus;

/// Recorded history of one failure: builds, change logs in commit order,
/// dependency rolls and the failing build's step logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureData {
    #[serde(default)]
    pub builds: Vec<Build>,
    /// Oldest commit first.
    #[serde(default)]
    pub change_logs: Vec<ChangeLog>,
    #[serde(default)]
    pub deps: DepsInfo,
    /// Step logs of the build under analysis.
    #[serde(default)]
    pub logs: StepLogs,
}

#[derive(Debug, Default)]
pub struct StaticBuildHistory {
    builds: BTreeMap<(String, String, i64), Build>,
}

impl StaticBuildHistory {
    pub fn new(builds: impl IntoIterator<Item = Build>) -> Self {
        let builds = builds
            .into_iter()
            .map(|b| ((b.project.clone(), b.builder.clone(), b.build_number), b))
            .collect();
        Self { builds }
    }
}

#[async_trait]
impl BuildHistoryProvider for StaticBuildHistory {
    async fn get_build(
        &self,
        project: &str,
        builder: &str,
        build_number: i64,
    ) -> Result<Option<Build>, ProviderError> {
        Ok(self
            .builds
            .get(&(project.to_string(), builder.to_string(), build_number))
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct StaticChangeLogs {
    ordered: Vec<ChangeLog>,
}

impl StaticChangeLogs {
    pub fn new(ordered: impl IntoIterator<Item = ChangeLog>) -> Self {
        Self {
            ordered: ordered.into_iter().collect(),
        }
    }

    fn position(&self, revision: &str) -> Option<usize> {
        self.ordered.iter().position(|c| c.revision == revision)
    }
}

#[async_trait]
impl ChangeLogProvider for StaticChangeLogs {
    async fn pull_change_logs(
        &self,
        from_revision: Option<&str>,
        to_revision: &str,
    ) -> Result<BTreeMap<String, ChangeLog>, ProviderError> {
        let Some(end) = self.position(to_revision) else {
            tracing::warn!(to_revision, "Revision not in recorded change logs");
            return Ok(BTreeMap::new());
        };
        let start = from_revision
            .and_then(|rev| self.position(rev))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        Ok(self
            .ordered
            .iter()
            .take(end + 1)
            .skip(start)
            .map(|c| (c.revision.clone(), c.clone()))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct StaticDeps {
    rolls: DepsInfo,
}

impl StaticDeps {
    pub fn new(rolls: DepsInfo) -> Self {
        Self { rolls }
    }
}

#[async_trait]
impl DepsExtractor for StaticDeps {
    async fn extract_deps_info(
        &self,
        _build: &Build,
        change_logs: &BTreeMap<String, ChangeLog>,
    ) -> Result<DepsInfo, ProviderError> {
        Ok(self
            .rolls
            .iter()
            .filter(|(revision, _)| change_logs.contains_key(*revision))
            .map(|(revision, rolls)| (revision.clone(), rolls.clone()))
            .collect())
    }
}

/// Scheduler that records requests instead of submitting them.
///
/// Can be told to reject every request, and serves statuses set with
/// [`RecordingScheduler::set_status`].
#[derive(Debug)]
pub struct RecordingScheduler {
    next_id: AtomicU64,
    reject_with: Option<String>,
    requests: Mutex<Vec<TryJobRequest>>,
    statuses: Mutex<BTreeMap<String, ExternalTryJobStatus>>,
}

impl Default for RecordingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(8_000_000),
            reject_with: None,
            requests: Mutex::new(Vec::new()),
            statuses: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_with: Some(reason.into()),
            ..Self::new()
        }
    }

    pub async fn requests(&self) -> Vec<TryJobRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn set_status(&self, try_job_id: &str, status: ExternalTryJobStatus) {
        self.statuses
            .lock()
            .await
            .insert(try_job_id.to_string(), status);
    }
}

#[async_trait]
impl TryJobScheduler for RecordingScheduler {
    async fn trigger(&self, request: &TryJobRequest) -> Result<String, SchedulerError> {
        if let Some(reason) = &self.reject_with {
            return Err(SchedulerError::Rejected(reason.clone()));
        }
        self.requests.lock().await.push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(builder = %request.builder, try_job_id = id, "Recorded try-job request");
        Ok(id.to_string())
    }

    async fn get_status(&self, try_job_id: &str) -> Result<ExternalTryJobStatus, SchedulerError> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(try_job_id)
            .cloned()
            .unwrap_or(ExternalTryJobStatus::Scheduled))
    }
}
