//! External collaborators: build history, change logs, dependency rolls and
//! the try-job scheduler.
//!
//! Transport is the implementor's business; the engine only sees these
//! request/response traits.

pub mod fixture;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, SchedulerError};
use crate::models::build::Build;
use crate::models::change_log::{ChangeLog, DepsInfo};
use crate::models::try_job::ExternalTryJobStatus;

#[async_trait]
pub trait BuildHistoryProvider: Send + Sync {
    /// `Ok(None)` when the build does not exist.
    async fn get_build(
        &self,
        project: &str,
        builder: &str,
        build_number: i64,
    ) -> Result<Option<Build>, ProviderError>;
}

/// Newest-first walk over builds strictly older than `before`, fetched one at
/// a time. Every build number visited counts against `max_count`, so the walk
/// terminates even across gaps in the history.
pub struct PreviousBuilds<'a> {
    provider: &'a dyn BuildHistoryProvider,
    project: &'a str,
    builder: &'a str,
    next_number: i64,
    remaining: usize,
}

impl<'a> PreviousBuilds<'a> {
    pub fn new(
        provider: &'a dyn BuildHistoryProvider,
        project: &'a str,
        builder: &'a str,
        before: i64,
        max_count: usize,
    ) -> Self {
        Self {
            provider,
            project,
            builder,
            next_number: before - 1,
            remaining: max_count,
        }
    }

    pub async fn next(&mut self) -> Result<Option<Build>, ProviderError> {
        while self.remaining > 0 && self.next_number >= 0 {
            let number = self.next_number;
            self.next_number -= 1;
            self.remaining -= 1;
            if let Some(build) = self
                .provider
                .get_build(self.project, self.builder, number)
                .await?
            {
                return Ok(Some(build));
            }
            tracing::debug!(
                project = self.project,
                builder = self.builder,
                build_number = number,
                "No build recorded, skipping"
            );
        }
        Ok(None)
    }
}

/// Convenience constructor matching the provider contract.
pub fn iterate_previous_builds<'a>(
    provider: &'a dyn BuildHistoryProvider,
    project: &'a str,
    builder: &'a str,
    before: i64,
    max_count: usize,
) -> PreviousBuilds<'a> {
    PreviousBuilds::new(provider, project, builder, before, max_count)
}

#[async_trait]
pub trait ChangeLogProvider: Send + Sync {
    /// Change logs of commits after `from_revision` up to and including
    /// `to_revision`, keyed by revision. `None` pulls as far back as the
    /// provider knows.
    async fn pull_change_logs(
        &self,
        from_revision: Option<&str>,
        to_revision: &str,
    ) -> Result<BTreeMap<String, ChangeLog>, ProviderError>;
}

#[async_trait]
pub trait DepsExtractor: Send + Sync {
    async fn extract_deps_info(
        &self,
        build: &Build,
        change_logs: &BTreeMap<String, ChangeLog>,
    ) -> Result<DepsInfo, ProviderError>;
}

/// Extractor for builds without pinned dependencies.
pub struct NoDeps;

#[async_trait]
impl DepsExtractor for NoDeps {
    async fn extract_deps_info(
        &self,
        _build: &Build,
        _change_logs: &BTreeMap<String, ChangeLog>,
    ) -> Result<DepsInfo, ProviderError> {
        Ok(DepsInfo::new())
    }
}

/// Named cache mounted into the try-job bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryJobRequest {
    pub builder: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub cache: CacheSpec,
    pub dimensions: Vec<Dimension>,
}

#[async_trait]
pub trait TryJobScheduler: Send + Sync {
    /// Submits a try job, returning the scheduler's build id.
    async fn trigger(&self, request: &TryJobRequest) -> Result<String, SchedulerError>;

    async fn get_status(&self, try_job_id: &str) -> Result<ExternalTryJobStatus, SchedulerError>;
}
