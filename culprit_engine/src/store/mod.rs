//! Persistence for analyses, failure groups, try jobs and flake aggregates.
//!
//! The engine needs get, create and update per entity plus one atomic
//! compare-and-create for try jobs. [`memory::MemoryStore`] serves tests and
//! offline replays; [`postgres::PgStore`] is the production backend.

pub mod memory;
pub mod migration;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::models::analysis::{Analysis, AnalysisKey};
use crate::models::failure::FailureKind;
use crate::models::flake::FlakeAggregate;
use crate::models::group::{FailureGroup, FailureSignature};
use crate::models::try_job::{TryJob, TryJobClaim, TryJobKey};

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn get_analysis(&self, key: &AnalysisKey) -> Result<Option<Analysis>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if the key is taken.
    async fn create_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if the analysis was never created.
    async fn update_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;

    /// Groups of `project` and `kind` whose signature equals `signature`.
    async fn find_failure_groups(
        &self,
        project: &str,
        kind: FailureKind,
        signature: &FailureSignature,
    ) -> Result<Vec<FailureGroup>, StoreError>;

    async fn create_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError>;

    async fn update_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError>;

    async fn get_try_job(&self, key: &TryJobKey) -> Result<Option<TryJob>, StoreError>;

    /// Looks a try job up by any scheduler build id it has carried.
    async fn find_try_job_by_id(&self, try_job_id: &str) -> Result<Option<TryJob>, StoreError>;

    /// Atomic revive-or-create: creates a pending job when none exists,
    /// revives a terminal one or a claim stale for `stale_after`, and leaves
    /// any other non-terminal job untouched.
    async fn claim_try_job(
        &self,
        key: &TryJobKey,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<TryJobClaim, StoreError>;

    async fn update_try_job(&self, job: &TryJob) -> Result<(), StoreError>;

    async fn get_flake_aggregate(&self, flake_key: &str)
        -> Result<Option<FlakeAggregate>, StoreError>;

    /// Overwrites whatever aggregate was stored under `flake_key`.
    async fn put_flake_aggregate(
        &self,
        flake_key: &str,
        aggregate: &FlakeAggregate,
    ) -> Result<(), StoreError>;
}
