//! Try-job bisection: deciding when to verify a failure, scheduling the try
//! job, tracking its status and reading a culprit out of its report.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::AnalysisError;
use crate::metrics;
use crate::models::build::Build;
use crate::models::failure::{FailedStep, FailureKind, FailureSignal, FailureSignals};
use crate::models::suspect::SuspectedCl;
use crate::models::try_job::{
    ExternalResult, ExternalTryJobStatus, TryJob, TryJobClaim, TryJobKey, TryJobRange,
    TryJobReport, TryJobStatus, STATUS_FAILED, STATUS_PASSED,
};
use crate::providers::{CacheSpec, Dimension, TryJobRequest, TryJobScheduler};
use crate::store::AnalysisStore;

/// A try job is only worth it for a failure that is new in a finished build.
pub fn needs_try_job(build: &Build, step: &FailedStep) -> bool {
    build.is_completed() && step.supported && step.is_new_failure()
}

/// Revisions and targets for a try job covering `steps`.
///
/// The good revision is the one of the oldest last pass among the steps, so
/// the range covers every step.
pub fn compute_try_job_range(
    config: &EngineConfig,
    kind: FailureKind,
    current: &Build,
    steps: &[&FailedStep],
    builds: &BTreeMap<i64, Build>,
    signals: &FailureSignals,
) -> Result<TryJobRange, AnalysisError> {
    let mut last_pass: Option<i64> = None;
    for step in steps {
        let Some(pass) = step.last_pass else {
            return Err(AnalysisError::NoGoodRevision {
                step: step.step_name.clone(),
            });
        };
        last_pass = Some(last_pass.map_or(pass, |p| p.min(pass)));
    }
    let good_build = last_pass.and_then(|n| builds.get(&n)).ok_or_else(|| {
        AnalysisError::NoGoodRevision {
            step: steps
                .first()
                .map(|s| s.step_name.clone())
                .unwrap_or_default(),
        }
    })?;

    let mut range = TryJobRange {
        good_revision: good_build.revision.clone(),
        bad_revision: current.revision.clone(),
        compile_targets: Vec::new(),
        tests: BTreeMap::new(),
    };
    match kind {
        FailureKind::Compile => {
            let strict = config.uses_strict_regex(&current.project);
            let mut targets = BTreeSet::new();
            for step in steps {
                if let Some(signal) = signals.get(&step.step_name) {
                    targets.extend(compile_targets(config, strict, &signal.signal));
                }
            }
            range.compile_targets = targets.into_iter().collect();
        }
        FailureKind::Test => {
            for step in steps {
                range.tests.insert(
                    step.step_name.clone(),
                    step.tests.keys().cloned().collect(),
                );
            }
        }
    }
    Ok(range)
}

fn compile_targets(
    config: &EngineConfig,
    strict: bool,
    signal: &FailureSignal,
) -> Vec<String> {
    if config.use_ninja_output_log && !signal.failed_output_nodes.is_empty() {
        return signal.failed_output_nodes.iter().cloned().collect();
    }
    signal
        .failed_targets
        .iter()
        .filter(|t| t.source.is_none() || strict)
        .map(|t| t.target.clone())
        .collect()
}

/// Named cache shared by every try job of one builder.
pub fn cache_name(project: &str, builder: &str) -> String {
    let digest = Sha256::digest(format!("{project}/{builder}").as_bytes());
    format!("builder_{}", hex::encode(digest))
}

fn build_request(
    config: &EngineConfig,
    key: &TryJobKey,
    range: &TryJobRange,
    suspected_revisions: &[String],
) -> TryJobRequest {
    let build = &key.build;
    let mut properties = BTreeMap::from([
        ("good_revision".to_string(), json!(range.good_revision)),
        ("bad_revision".to_string(), json!(range.bad_revision)),
        ("target_project".to_string(), json!(build.project)),
        ("target_builder".to_string(), json!(build.builder)),
        ("referenced_build_number".to_string(), json!(build.build_number)),
        ("suspected_revisions".to_string(), json!(suspected_revisions)),
    ]);
    match key.kind {
        FailureKind::Compile => {
            properties.insert("compile_targets".into(), json!(range.compile_targets));
        }
        FailureKind::Test => {
            properties.insert("tests".into(), json!(range.tests));
        }
    }
    TryJobRequest {
        builder: build.builder.clone(),
        properties,
        cache: CacheSpec {
            name: cache_name(&build.project, &build.builder),
            path: "builder".into(),
        },
        dimensions: vec![
            Dimension {
                key: "pool".into(),
                value: config.try_job_pool.clone(),
            },
            Dimension {
                key: "builder".into(),
                value: build.builder.clone(),
            },
        ],
    }
}

/// Creates or revives the try job for `key` and triggers it.
///
/// A job already in flight is returned unchanged without touching the
/// scheduler, unless it is a claim that never got a scheduler id within the
/// claim timeout. A rejected request leaves the job in ERROR so a later call can
/// revive it.
pub async fn schedule_try_job(
    store: &dyn AnalysisStore,
    scheduler: &dyn TryJobScheduler,
    config: &EngineConfig,
    key: &TryJobKey,
    range: TryJobRange,
    suspects: &[SuspectedCl],
    now: DateTime<Utc>,
) -> Result<TryJob, AnalysisError> {
    let mut job = match store
        .claim_try_job(key, now, config.try_job_claim_timeout())
        .await?
    {
        TryJobClaim::InFlight(job) => {
            tracing::info!(
                try_job = %key,
                attempt = job.attempt,
                status = job.status.as_str(),
                "Try job already in flight"
            );
            return Ok(job);
        }
        TryJobClaim::Created(job) | TryJobClaim::Revived(job) => job,
    };

    job.suspected_revisions = suspects
        .iter()
        .take(config.max_suspects_for_try_job)
        .map(|s| s.revision.clone())
        .collect();
    let request = build_request(config, key, &range, &job.suspected_revisions);
    job.range = Some(range);

    match scheduler.trigger(&request).await {
        Ok(try_job_id) => {
            tracing::info!(
                try_job = %key,
                attempt = job.attempt,
                try_job_id = %try_job_id,
                "Try job triggered"
            );
            job.try_job_ids.push(try_job_id);
            store.update_try_job(&job).await?;
            metrics::try_job_status_changed(job.status.as_str());
            Ok(job)
        }
        Err(source) => {
            tracing::warn!(try_job = %key, error = %source, "Try-job trigger rejected");
            job.status = TryJobStatus::Error;
            job.error = Some(source.to_string());
            job.completed_at = Some(now);
            store.update_try_job(&job).await?;
            metrics::try_job_status_changed(job.status.as_str());
            Err(AnalysisError::TryJobScheduling {
                try_job: key.to_string(),
                source,
            })
        }
    }
}

/// Outcome of feeding a scheduler status into a try job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryJobUpdate {
    Updated(TryJob),
    /// The job was already terminal, or the status belongs to an earlier
    /// attempt.
    Ignored(TryJob),
}

impl TryJobUpdate {
    pub fn try_job(&self) -> &TryJob {
        match self {
            TryJobUpdate::Updated(job) | TryJobUpdate::Ignored(job) => job,
        }
    }
}

pub async fn on_try_job_update(
    store: &dyn AnalysisStore,
    try_job_id: &str,
    status: &ExternalTryJobStatus,
    now: DateTime<Utc>,
) -> Result<TryJobUpdate, AnalysisError> {
    let Some(mut job) = store.find_try_job_by_id(try_job_id).await? else {
        return Err(AnalysisError::UnknownTryJob {
            try_job_id: try_job_id.to_string(),
        });
    };
    if job.status.is_terminal() || job.try_job_ids.last().map(String::as_str) != Some(try_job_id)
    {
        tracing::debug!(
            try_job = %job.key,
            try_job_id,
            status = job.status.as_str(),
            "Ignoring update for finished or superseded try job"
        );
        return Ok(TryJobUpdate::Ignored(job));
    }

    match status {
        ExternalTryJobStatus::Scheduled => {
            job.status = TryJobStatus::Pending;
        }
        ExternalTryJobStatus::Started { start_time } => {
            job.status = TryJobStatus::Running;
            job.started_at = Some(start_time.unwrap_or(now));
        }
        ExternalTryJobStatus::Completed {
            result,
            report,
            end_time,
        } => {
            let end = end_time.unwrap_or(now);
            let start = job.started_at.unwrap_or(job.created_at);
            let elapsed = (end - start).num_seconds();
            job.completed_at = Some(end);
            job.elapsed_seconds = Some(elapsed);
            if let Some(report) = report {
                job.results.push(report.clone());
            }
            if *result == ExternalResult::Success {
                job.status = TryJobStatus::Completed;
            } else {
                job.status = TryJobStatus::Error;
                job.error = Some(format!("try job ended with {result:?}"));
            }
            metrics::try_job_duration(elapsed);
        }
    }

    store.update_try_job(&job).await?;
    metrics::try_job_status_changed(job.status.as_str());
    tracing::info!(
        try_job = %job.key,
        try_job_id,
        status = job.status.as_str(),
        "Try job updated"
    );
    Ok(TryJobUpdate::Updated(job))
}

/// What a try-job report says about the failures it reran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Culprit revision per failure (`compile`, or `step/test`). Failures the
    /// report showed to be flaky are listed separately.
    Found {
        culprits: BTreeMap<String, String>,
        flaky: BTreeSet<String>,
    },
    /// Nothing reproduced.
    Flaky { failures: BTreeSet<String> },
    Inconclusive { reason: String },
}

impl Verdict {
    pub fn culprit_revisions(&self) -> BTreeSet<&str> {
        match self {
            Verdict::Found { culprits, .. } => culprits.values().map(String::as_str).collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn is_flaky(&self) -> bool {
        matches!(self, Verdict::Flaky { .. })
    }

    fn outcome(&self) -> &'static str {
        match self {
            Verdict::Found { .. } => "found",
            Verdict::Flaky { .. } => "flaky",
            Verdict::Inconclusive { .. } => "inconclusive",
        }
    }
}

/// Reads the culprit out of a try-job report.
///
/// An explicit culprit in the report wins. Otherwise a failing good revision
/// or a passing bad revision means the failure does not reproduce, and the
/// culprit is the first failing revision right after a passing one.
pub fn identify_culprit(kind: FailureKind, report: &TryJobReport, range: &TryJobRange) -> Verdict {
    let verdict = match check_report(report) {
        Err(e) => {
            tracing::warn!(error = %e, "Treating malformed try-job report as inconclusive");
            Verdict::Inconclusive {
                reason: e.to_string(),
            }
        }
        Ok(()) => {
            let good = report.good_revision.as_deref().unwrap_or(&range.good_revision);
            let bad = report.bad_revision.as_deref().unwrap_or(&range.bad_revision);
            match kind {
                FailureKind::Compile => compile_verdict(report, good, bad),
                FailureKind::Test => test_verdict(report, range, good, bad),
            }
        }
    };
    metrics::verdict_recorded(verdict.outcome());
    verdict
}

fn check_report(report: &TryJobReport) -> Result<(), AnalysisError> {
    let mut seen = BTreeSet::new();
    for result in &report.result {
        if !seen.insert(result.revision.as_str()) {
            return Err(AnalysisError::InconsistentTryJobResult {
                reason: format!("revision {} reported twice", result.revision),
            });
        }
        let statuses = result
            .status
            .iter()
            .chain(result.steps.values().map(|s| &s.status));
        for status in statuses {
            if status != STATUS_PASSED && status != STATUS_FAILED {
                return Err(AnalysisError::InconsistentTryJobResult {
                    reason: format!("unknown status {status} at {}", result.revision),
                });
            }
        }
    }
    if let Some(culprit) = &report.culprit {
        if !report.result.is_empty() && report.result_at(culprit).is_none() {
            return Err(AnalysisError::InconsistentTryJobResult {
                reason: format!("culprit {culprit} was not tested"),
            });
        }
    }
    Ok(())
}

enum Located {
    Culprit(String),
    Flaky,
    Undecided,
}

/// `outcomes` is in commit order; `Some(true)` means the failure reproduced.
fn locate(outcomes: &[(&str, Option<bool>)], good: &str, bad: &str) -> Located {
    let at = |rev: &str| outcomes.iter().find(|(r, _)| *r == rev).and_then(|(_, o)| *o);
    if at(good) == Some(true) || at(bad) == Some(false) {
        return Located::Flaky;
    }
    outcomes
        .windows(2)
        .find(|w| w[0].1 == Some(false) && w[1].1 == Some(true))
        .map(|w| Located::Culprit(w[1].0.to_string()))
        .unwrap_or(Located::Undecided)
}

fn compile_verdict(report: &TryJobReport, good: &str, bad: &str) -> Verdict {
    let failure = FailureKind::Compile.as_str().to_string();
    if let Some(culprit) = &report.culprit {
        return Verdict::Found {
            culprits: BTreeMap::from([(failure, culprit.clone())]),
            flaky: BTreeSet::new(),
        };
    }
    let outcomes: Vec<_> = report
        .result
        .iter()
        .map(|r| {
            let failed = r.status.as_deref().map(|s| s == STATUS_FAILED);
            (r.revision.as_str(), failed)
        })
        .collect();
    match locate(&outcomes, good, bad) {
        Located::Culprit(revision) => Verdict::Found {
            culprits: BTreeMap::from([(failure, revision)]),
            flaky: BTreeSet::new(),
        },
        Located::Flaky => Verdict::Flaky {
            failures: BTreeSet::from([failure]),
        },
        Located::Undecided => Verdict::Inconclusive {
            reason: "no failing revision follows a passing one".into(),
        },
    }
}

fn test_verdict(report: &TryJobReport, range: &TryJobRange, good: &str, bad: &str) -> Verdict {
    let mut culprits = report.culprits.clone();
    let mut flaky = BTreeSet::new();

    for (step, tests) in &range.tests {
        for test in tests {
            let failure = format!("{step}/{test}");
            if culprits.contains_key(&failure) {
                continue;
            }
            let outcomes: Vec<_> = report
                .result
                .iter()
                .map(|r| {
                    let failed = r
                        .steps
                        .get(step)
                        .filter(|o| o.valid)
                        .map(|o| o.failures.iter().any(|f| f == test));
                    (r.revision.as_str(), failed)
                })
                .collect();
            match locate(&outcomes, good, bad) {
                Located::Culprit(revision) => {
                    culprits.insert(failure, revision);
                }
                Located::Flaky => {
                    flaky.insert(failure);
                }
                Located::Undecided => {}
            }
        }
    }

    if !culprits.is_empty() {
        Verdict::Found { culprits, flaky }
    } else if !flaky.is_empty() {
        Verdict::Flaky { failures: flaky }
    } else {
        Verdict::Inconclusive {
            reason: "no test reproduced between the good and bad revisions".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::SchedulerError;
    use crate::models::build::{BuildKey, BuildResult};
    use crate::models::failure::{FailedTarget, StepSignal};
    use crate::models::try_job::{RevisionResult, StepOutcome};
    use crate::providers::fixture::RecordingScheduler;
    use crate::store::memory::MemoryStore;
    use crate::testing::{build, failed_build};

    fn key() -> TryJobKey {
        TryJobKey::new(BuildKey::new("chromium", "linux-rel", 120), FailureKind::Compile)
    }

    fn range() -> TryJobRange {
        TryJobRange {
            good_revision: "r118".into(),
            bad_revision: "r120".into(),
            compile_targets: vec!["obj/base/foo.o".into()],
            tests: BTreeMap::new(),
        }
    }

    fn rev(revision: &str, status: &str) -> RevisionResult {
        RevisionResult {
            revision: revision.into(),
            status: Some(status.into()),
            steps: BTreeMap::new(),
        }
    }

    #[test]
    fn try_job_needed_only_for_new_failures_in_complete_builds() {
        let current = failed_build(120, &["compile"]);
        let new_step = FailedStep::new("compile", 120, true);
        assert!(needs_try_job(&current, &new_step));

        let mut tracked = new_step.clone();
        tracked.first_failure = 119;
        assert!(!needs_try_job(&current, &tracked));

        let running = build(120, BuildResult::Running);
        assert!(!needs_try_job(&running, &new_step));
    }

    #[test]
    fn range_requires_a_last_pass() {
        let current = failed_build(120, &["compile"]);
        let step = FailedStep::new("compile", 120, true);
        let err = compute_try_job_range(
            &EngineConfig::default(),
            FailureKind::Compile,
            &current,
            &[&step],
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::NoGoodRevision { .. }));
    }

    #[test]
    fn compile_targets_follow_ninja_toggle_and_strict_regex() {
        let current = failed_build(120, &["compile"]);
        let mut step = FailedStep::new("compile", 120, true);
        step.last_pass = Some(118);
        let builds = BTreeMap::from([(118, build(118, BuildResult::Success))]);
        let mut signal = FailureSignal::default();
        signal.failed_output_nodes.insert("obj/base/foo.o".into());
        signal.failed_targets = vec![
            FailedTarget {
                source: Some("base/foo.cc".into()),
                target: "obj/base/foo.o".into(),
            },
            FailedTarget {
                source: None,
                target: "chrome".into(),
            },
        ];
        let signals = BTreeMap::from([(
            "compile".to_string(),
            StepSignal {
                signal,
                tests: BTreeMap::new(),
            },
        )]);

        let compute = |config: &EngineConfig| {
            compute_try_job_range(config, FailureKind::Compile, &current, &[&step], &builds, &signals)
                .unwrap()
        };

        let r = compute(&EngineConfig::default());
        assert_eq!(r.good_revision, "r118");
        assert_eq!(r.bad_revision, "r120");
        assert_eq!(r.compile_targets, vec!["obj/base/foo.o"]);

        let no_ninja = EngineConfig {
            use_ninja_output_log: false,
            ..EngineConfig::default()
        };
        assert_eq!(compute(&no_ninja).compile_targets, vec!["chrome"]);

        let mut strict = no_ninja.clone();
        strict.strict_regex_projects.insert("chromium".into());
        assert_eq!(compute(&strict).compile_targets, vec!["chrome", "obj/base/foo.o"]);
    }

    #[test]
    fn cache_name_is_stable_per_builder() {
        let a = cache_name("chromium", "linux-rel");
        assert!(a.starts_with("builder_"));
        assert_eq!(a.len(), "builder_".len() + 64);
        assert_eq!(a, cache_name("chromium", "linux-rel"));
        assert_ne!(a, cache_name("chromium", "mac-rel"));
    }

    #[tokio::test]
    async fn scheduling_twice_triggers_once() {
        let store = MemoryStore::new();
        let scheduler = RecordingScheduler::new();
        let config = EngineConfig::default();
        let now = Utc::now();

        let first = schedule_try_job(&store, &scheduler, &config, &key(), range(), &[], now)
            .await
            .unwrap();
        let second = schedule_try_job(&store, &scheduler, &config, &key(), range(), &[], now)
            .await
            .unwrap();

        assert_eq!(first.try_job_ids, vec!["8000001".to_string()]);
        assert_eq!(second, first);
        let requests = scheduler.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].properties["good_revision"], json!("r118"));
        assert_eq!(requests[0].dimensions[0].value, config.try_job_pool);
    }

    #[tokio::test]
    async fn abandoned_claim_is_triggered_after_timeout() {
        let store = MemoryStore::new();
        let scheduler = RecordingScheduler::new();
        let config = EngineConfig::default();
        let claimed_at = Utc::now();
        store
            .claim_try_job(&key(), claimed_at, config.try_job_claim_timeout())
            .await
            .unwrap();

        let early = schedule_try_job(&store, &scheduler, &config, &key(), range(), &[], claimed_at)
            .await
            .unwrap();
        assert!(early.try_job_ids.is_empty());
        assert!(scheduler.requests().await.is_empty());

        let later = claimed_at + config.try_job_claim_timeout() + chrono::Duration::seconds(1);
        let job = schedule_try_job(&store, &scheduler, &config, &key(), range(), &[], later)
            .await
            .unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.try_job_ids, vec!["8000001".to_string()]);
        assert_eq!(scheduler.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_scheduling_triggers_once() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler::new());
        let config = Arc::new(EngineConfig::default());
        let mut handles = Vec::new();
        for _ in 0..6 {
            let (store, scheduler, config) = (store.clone(), scheduler.clone(), config.clone());
            handles.push(tokio::spawn(async move {
                schedule_try_job(&*store, &*scheduler, &config, &key(), range(), &[], Utc::now())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(scheduler.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_trigger_marks_error_and_retry_revives() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let now = Utc::now();

        let rejecting = RecordingScheduler::rejecting("no capacity");
        let err = schedule_try_job(&store, &rejecting, &config, &key(), range(), &[], now)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            AnalysisError::TryJobScheduling {
                source: SchedulerError::Rejected(_),
                ..
            }
        ));
        let stored = store.get_try_job(&key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TryJobStatus::Error);

        let accepting = RecordingScheduler::new();
        let job = schedule_try_job(&store, &accepting, &config, &key(), range(), &[], now)
            .await
            .unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.status, TryJobStatus::Pending);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn status_updates_drive_the_job_to_completion() {
        let store = MemoryStore::new();
        let scheduler = RecordingScheduler::new();
        let now = Utc::now();
        let job = schedule_try_job(&store, &scheduler, &EngineConfig::default(), &key(), range(), &[], now)
            .await
            .unwrap();
        let id = job.try_job_ids[0].clone();

        let started = on_try_job_update(&store, &id, &ExternalTryJobStatus::Started { start_time: Some(now) }, now)
            .await
            .unwrap();
        assert_eq!(started.try_job().status, TryJobStatus::Running);

        let report = TryJobReport {
            culprit: Some("r120".into()),
            ..TryJobReport::default()
        };
        let done = on_try_job_update(
            &store,
            &id,
            &ExternalTryJobStatus::Completed {
                result: ExternalResult::Success,
                report: Some(report),
                end_time: Some(now + chrono::Duration::seconds(90)),
            },
            now,
        )
        .await
        .unwrap();
        let job = done.try_job();
        assert_eq!(job.status, TryJobStatus::Completed);
        assert_eq!(job.elapsed_seconds, Some(90));
        assert_eq!(job.results.len(), 1);

        let late = on_try_job_update(&store, &id, &ExternalTryJobStatus::Started { start_time: None }, now)
            .await
            .unwrap();
        assert!(matches!(late, TryJobUpdate::Ignored(_)));
        assert_eq!(late.try_job().status, TryJobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_build_marks_job_error_and_unknown_ids_are_rejected() {
        let store = MemoryStore::new();
        let scheduler = RecordingScheduler::new();
        let now = Utc::now();
        let job = schedule_try_job(&store, &scheduler, &EngineConfig::default(), &key(), range(), &[], now)
            .await
            .unwrap();
        let update = on_try_job_update(
            &store,
            &job.try_job_ids[0],
            &ExternalTryJobStatus::Completed {
                result: ExternalResult::InfraFailure,
                report: None,
                end_time: None,
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(update.try_job().status, TryJobStatus::Error);

        let err = on_try_job_update(&store, "404", &ExternalTryJobStatus::Scheduled, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownTryJob { .. }));
    }

    #[test]
    fn first_failure_after_a_pass_is_the_culprit() {
        let report = TryJobReport {
            result: vec![rev("r119", STATUS_PASSED), rev("r120", STATUS_FAILED)],
            ..TryJobReport::default()
        };
        let verdict = identify_culprit(FailureKind::Compile, &report, &range());
        assert_eq!(verdict.culprit_revisions(), BTreeSet::from(["r120"]));
    }

    #[test]
    fn failing_good_revision_is_flaky() {
        let report = TryJobReport {
            result: vec![rev("r118", STATUS_FAILED), rev("r120", STATUS_FAILED)],
            ..TryJobReport::default()
        };
        let verdict = identify_culprit(FailureKind::Compile, &report, &range());
        assert!(verdict.is_flaky());
        assert!(verdict.culprit_revisions().is_empty());
    }

    #[test]
    fn passing_bad_revision_is_flaky() {
        let report = TryJobReport {
            result: vec![rev("r119", STATUS_PASSED), rev("r120", STATUS_PASSED)],
            ..TryJobReport::default()
        };
        assert!(identify_culprit(FailureKind::Compile, &report, &range()).is_flaky());
    }

    #[test]
    fn explicit_culprit_wins() {
        let report = TryJobReport {
            result: vec![rev("r119", STATUS_FAILED), rev("r120", STATUS_FAILED)],
            culprit: Some("r119".into()),
            ..TryJobReport::default()
        };
        let verdict = identify_culprit(FailureKind::Compile, &report, &range());
        assert_eq!(verdict.culprit_revisions(), BTreeSet::from(["r119"]));
    }

    #[test]
    fn malformed_report_is_inconclusive() {
        let report = TryJobReport {
            result: vec![rev("r119", STATUS_PASSED), rev("r119", STATUS_FAILED)],
            ..TryJobReport::default()
        };
        assert!(matches!(
            identify_culprit(FailureKind::Compile, &report, &range()),
            Verdict::Inconclusive { .. }
        ));
        let report = TryJobReport {
            result: vec![rev("r120", "exploded")],
            ..TryJobReport::default()
        };
        assert!(matches!(
            identify_culprit(FailureKind::Compile, &report, &range()),
            Verdict::Inconclusive { .. }
        ));
    }

    #[test]
    fn test_reports_are_read_per_test() {
        let mut test_range = range();
        test_range.compile_targets.clear();
        test_range.tests = BTreeMap::from([(
            "browser_tests".to_string(),
            vec!["A.Real".to_string(), "A.Flaky".to_string()],
        )]);
        let outcome = |failures: &[&str]| RevisionResult {
            revision: String::new(),
            status: None,
            steps: BTreeMap::from([(
                "browser_tests".to_string(),
                StepOutcome {
                    status: if failures.is_empty() { STATUS_PASSED } else { STATUS_FAILED }.into(),
                    failures: failures.iter().map(|f| f.to_string()).collect(),
                    valid: true,
                },
            )]),
        };
        let report = TryJobReport {
            result: vec![
                RevisionResult {
                    revision: "r119".into(),
                    ..outcome(&[])
                },
                RevisionResult {
                    revision: "r120".into(),
                    ..outcome(&["A.Real"])
                },
            ],
            ..TryJobReport::default()
        };
        match identify_culprit(FailureKind::Test, &report, &test_range) {
            Verdict::Found { culprits, flaky } => {
                assert_eq!(culprits["browser_tests/A.Real"], "r120");
                assert!(flaky.contains("browser_tests/A.Flaky"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }
}
