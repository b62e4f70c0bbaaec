//! In-memory store. A single mutex serializes every operation, which makes
//! the try-job claim atomic.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::AnalysisStore;
use crate::error::StoreError;
use crate::models::analysis::{Analysis, AnalysisKey};
use crate::models::failure::FailureKind;
use crate::models::flake::FlakeAggregate;
use crate::models::group::{FailureGroup, FailureSignature};
use crate::models::try_job::{TryJob, TryJobClaim, TryJobKey};

#[derive(Default)]
struct Inner {
    analyses: BTreeMap<AnalysisKey, Analysis>,
    groups: Vec<FailureGroup>,
    try_jobs: BTreeMap<TryJobKey, TryJob>,
    try_job_ids: HashMap<String, TryJobKey>,
    flakes: BTreeMap<String, FlakeAggregate>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn failure_groups(&self) -> Vec<FailureGroup> {
        self.inner.lock().await.groups.clone()
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn get_analysis(&self, key: &AnalysisKey) -> Result<Option<Analysis>, StoreError> {
        Ok(self.inner.lock().await.analyses.get(key).cloned())
    }

    async fn create_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.analyses.contains_key(&analysis.key) {
            return Err(StoreError::AlreadyExists {
                entity: "analysis",
                key: analysis.key.to_string(),
            });
        }
        inner
            .analyses
            .insert(analysis.key.clone(), analysis.clone());
        Ok(())
    }

    async fn update_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.analyses.get_mut(&analysis.key) {
            Some(existing) => {
                *existing = analysis.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "analysis",
                key: analysis.key.to_string(),
            }),
        }
    }

    async fn find_failure_groups(
        &self,
        project: &str,
        kind: FailureKind,
        signature: &FailureSignature,
    ) -> Result<Vec<FailureGroup>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .groups
            .iter()
            .filter(|g| g.project == project && g.kind == kind && &g.output_nodes == signature)
            .cloned()
            .collect())
    }

    async fn create_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.groups.iter().any(|g| g.id == group.id) {
            return Err(StoreError::AlreadyExists {
                entity: "failure group",
                key: group.id.to_string(),
            });
        }
        inner.groups.push(group.clone());
        Ok(())
    }

    async fn update_failure_group(&self, group: &FailureGroup) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let id: Uuid = group.id;
        match inner.groups.iter_mut().find(|g| g.id == id) {
            Some(existing) => {
                *existing = group.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "failure group",
                key: id.to_string(),
            }),
        }
    }

    async fn get_try_job(&self, key: &TryJobKey) -> Result<Option<TryJob>, StoreError> {
        Ok(self.inner.lock().await.try_jobs.get(key).cloned())
    }

    async fn find_try_job_by_id(&self, try_job_id: &str) -> Result<Option<TryJob>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .try_job_ids
            .get(try_job_id)
            .and_then(|key| inner.try_jobs.get(key))
            .cloned())
    }

    async fn claim_try_job(
        &self,
        key: &TryJobKey,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<TryJobClaim, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.try_jobs.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let job = entry.get_mut();
                if !job.status.is_terminal() && !job.is_stale_claim(now, stale_after) {
                    return Ok(TryJobClaim::InFlight(job.clone()));
                }
                job.revive(now);
                Ok(TryJobClaim::Revived(job.clone()))
            }
            Entry::Vacant(entry) => {
                let job = TryJob::new(key.clone(), now);
                entry.insert(job.clone());
                Ok(TryJobClaim::Created(job))
            }
        }
    }

    async fn update_try_job(&self, job: &TryJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.try_jobs.contains_key(&job.key) {
            return Err(StoreError::NotFound {
                entity: "try job",
                key: job.key.to_string(),
            });
        }
        for id in &job.try_job_ids {
            inner.try_job_ids.insert(id.clone(), job.key.clone());
        }
        inner.try_jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn get_flake_aggregate(
        &self,
        flake_key: &str,
    ) -> Result<Option<FlakeAggregate>, StoreError> {
        Ok(self.inner.lock().await.flakes.get(flake_key).cloned())
    }

    async fn put_flake_aggregate(
        &self,
        flake_key: &str,
        aggregate: &FlakeAggregate,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .flakes
            .insert(flake_key.to_string(), aggregate.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::BuildKey;
    use crate::models::try_job::TryJobStatus;

    fn key() -> TryJobKey {
        TryJobKey::new(BuildKey::new("chromium", "linux", 120), FailureKind::Compile)
    }

    fn timeout() -> Duration {
        Duration::minutes(10)
    }

    #[tokio::test]
    async fn claim_creates_then_reports_in_flight() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.claim_try_job(&key(), now, timeout()).await.unwrap();
        assert!(matches!(first, TryJobClaim::Created(_)));
        let second = store.claim_try_job(&key(), now, timeout()).await.unwrap();
        assert!(second.is_in_flight());
        assert_eq!(second.try_job().attempt, 1);
    }

    #[tokio::test]
    async fn claim_revives_terminal_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut job = store.claim_try_job(&key(), now, timeout()).await.unwrap().into_try_job();
        job.status = TryJobStatus::Error;
        store.update_try_job(&job).await.unwrap();

        let claim = store.claim_try_job(&key(), now, timeout()).await.unwrap();
        assert!(matches!(claim, TryJobClaim::Revived(_)));
        assert_eq!(claim.try_job().attempt, 2);
        assert_eq!(claim.try_job().status, TryJobStatus::Pending);
    }

    #[tokio::test]
    async fn stale_claim_without_id_is_revived() {
        let store = MemoryStore::new();
        let then = Utc::now();
        store.claim_try_job(&key(), then, timeout()).await.unwrap();

        let soon = store
            .claim_try_job(&key(), then + Duration::minutes(1), timeout())
            .await
            .unwrap();
        assert!(soon.is_in_flight());

        let later = store
            .claim_try_job(&key(), then + Duration::minutes(11), timeout())
            .await
            .unwrap();
        assert!(matches!(later, TryJobClaim::Revived(_)));
        assert_eq!(later.try_job().attempt, 2);
    }

    #[tokio::test]
    async fn triggered_job_is_never_stale() {
        let store = MemoryStore::new();
        let then = Utc::now();
        let mut job = store
            .claim_try_job(&key(), then, timeout())
            .await
            .unwrap()
            .into_try_job();
        job.try_job_ids.push("8000001".into());
        store.update_try_job(&job).await.unwrap();
        let claim = store
            .claim_try_job(&key(), then + Duration::hours(5), timeout())
            .await
            .unwrap();
        assert!(claim.is_in_flight());
    }

    #[tokio::test]
    async fn concurrent_claims_create_exactly_once() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_try_job(&key(), now, timeout()).await.unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), TryJobClaim::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn try_job_is_found_by_scheduler_id() {
        let store = MemoryStore::new();
        let mut job = store
            .claim_try_job(&key(), Utc::now(), timeout())
            .await
            .unwrap()
            .into_try_job();
        job.try_job_ids.push("8000001".into());
        store.update_try_job(&job).await.unwrap();
        let found = store.find_try_job_by_id("8000001").await.unwrap();
        assert_eq!(found.map(|j| j.key), Some(key()));
        assert!(store.find_try_job_by_id("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_analysis_fails() {
        let store = MemoryStore::new();
        let analysis = Analysis::new(
            AnalysisKey::new(BuildKey::new("chromium", "linux", 1), FailureKind::Test),
            Utc::now(),
        );
        assert!(matches!(
            store.update_analysis(&analysis).await,
            Err(StoreError::NotFound { .. })
        ));
        store.create_analysis(&analysis).await.unwrap();
        assert!(matches!(
            store.create_analysis(&analysis).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }
}
