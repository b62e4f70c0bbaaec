//! The analysis pipeline: regression range, heuristic suspects, grouping and
//! try-job verification for one failed build.
//!
//! Compile and test failures share the pipeline; what differs between them
//! lives behind [`FailureStrategy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::error::{AnalysisError, StoreError};
use crate::events::try_job::TryJobEvent;
use crate::metrics;
use crate::models::analysis::{Analysis, AnalysisKey, AnalysisResultStatus, AnalysisStatus};
use crate::models::build::{Build, BuildKey};
use crate::models::failure::{FailedStep, FailureKind, FailureSignals, StepLogs};
use crate::models::group::{CommitRef, FailureSignature};
use crate::models::suspect::{Culprit, CulpritSource};
use crate::models::try_job::{ExternalTryJobStatus, TryJob, TryJobKey, TryJobStatus};
use crate::providers::{BuildHistoryProvider, ChangeLogProvider, DepsExtractor, TryJobScheduler};
use crate::services::grouping::{find_or_create_group, GroupContext};
use crate::services::heuristic::{score_suspects, ChangeScorer, FileOverlapScorer, ScoringInput};
use crate::services::regression_range::{find_regression_range, initial_failed_steps};
use crate::services::signal::extract_signals;
use crate::services::try_job_controller::{
    compute_try_job_range, identify_culprit, needs_try_job, on_try_job_update, schedule_try_job,
    TryJobUpdate, Verdict,
};
use crate::store::AnalysisStore;

/// What differs between compile and test analyses.
pub trait FailureStrategy: Send + Sync {
    /// Whether a failed step belongs to this kind of analysis.
    fn handles_step(&self, config: &EngineConfig, step_name: &str) -> bool;

    /// Identifies the failure for grouping.
    fn signature(&self, steps: &[FailedStep], signals: &FailureSignals) -> FailureSignature;

    /// Steps one try job should verify.
    fn try_job_steps<'a>(&self, build: &Build, steps: &'a [FailedStep]) -> Vec<&'a FailedStep>;
}

pub struct CompileStrategy;

impl FailureStrategy for CompileStrategy {
    fn handles_step(&self, config: &EngineConfig, step_name: &str) -> bool {
        config.is_compile_step(step_name)
    }

    fn signature(&self, steps: &[FailedStep], signals: &FailureSignals) -> FailureSignature {
        FailureSignature::new(
            steps
                .iter()
                .filter_map(|s| signals.get(&s.step_name))
                .flat_map(|s| s.signal.failed_output_nodes.iter().cloned()),
        )
    }

    /// A build compiles once, so only the first new compile failure is
    /// bisected.
    fn try_job_steps<'a>(&self, build: &Build, steps: &'a [FailedStep]) -> Vec<&'a FailedStep> {
        steps
            .iter()
            .find(|s| needs_try_job(build, s))
            .into_iter()
            .collect()
    }
}

pub struct TestStrategy;

impl FailureStrategy for TestStrategy {
    fn handles_step(&self, config: &EngineConfig, step_name: &str) -> bool {
        !config.is_compile_step(step_name)
    }

    fn signature(&self, steps: &[FailedStep], _signals: &FailureSignals) -> FailureSignature {
        FailureSignature::new(steps.iter().filter(|s| s.supported).flat_map(|s| {
            s.tests
                .keys()
                .map(move |test| format!("{}/{}", s.step_name, test))
        }))
    }

    /// Every new step failure with known failing tests goes into one try job.
    fn try_job_steps<'a>(&self, build: &Build, steps: &'a [FailedStep]) -> Vec<&'a FailedStep> {
        steps
            .iter()
            .filter(|s| needs_try_job(build, s) && !s.tests.is_empty())
            .collect()
    }
}

pub fn strategy_for(kind: FailureKind) -> Arc<dyn FailureStrategy> {
    match kind {
        FailureKind::Compile => Arc::new(CompileStrategy),
        FailureKind::Test => Arc::new(TestStrategy),
    }
}

/// Result of [`FailureAnalyzer::analyze_failure`].
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: Analysis,
    pub try_job: Option<TryJob>,
}

/// Result of [`FailureAnalyzer::on_try_job_update`].
#[derive(Debug, Clone)]
pub struct TryJobOutcome {
    pub update: TryJobUpdate,
    pub verdict: Option<Verdict>,
    pub analysis: Option<Analysis>,
}

pub struct FailureAnalyzer {
    config: EngineConfig,
    history: Arc<dyn BuildHistoryProvider>,
    change_logs: Arc<dyn ChangeLogProvider>,
    deps: Arc<dyn DepsExtractor>,
    scheduler: Arc<dyn TryJobScheduler>,
    store: Arc<dyn AnalysisStore>,
    scorer: Arc<dyn ChangeScorer>,
}

impl FailureAnalyzer {
    pub fn new(
        config: EngineConfig,
        history: Arc<dyn BuildHistoryProvider>,
        change_logs: Arc<dyn ChangeLogProvider>,
        deps: Arc<dyn DepsExtractor>,
        scheduler: Arc<dyn TryJobScheduler>,
        store: Arc<dyn AnalysisStore>,
    ) -> Self {
        let scorer = Arc::new(FileOverlapScorer::new(config.hint_weights.clone()));
        Self {
            config,
            history,
            change_logs,
            deps,
            scheduler,
            store,
            scorer,
        }
    }

    /// Replaces the default file-overlap scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn ChangeScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Runs the full pipeline for one failed build and persists the analysis
    /// after every stage.
    ///
    /// The heuristic result is persisted before a try job is attempted, so a
    /// scheduling error leaves a usable COMPLETED analysis behind.
    pub async fn analyze_failure(
        &self,
        kind: FailureKind,
        build_key: &BuildKey,
        logs: &StepLogs,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let strategy = strategy_for(kind);
        let now = Utc::now();
        let key = AnalysisKey::new(build_key.clone(), kind);
        let mut analysis = Analysis::new(key.clone(), now);
        let verified = match self.store.get_analysis(&key).await? {
            Some(previous) if previous.has_try_job_verdict() => {
                analysis.carry_verdict(&previous);
                true
            }
            _ => false,
        };
        analysis.status = AnalysisStatus::Running;
        self.save(&analysis, true).await?;

        tracing::info!(build = %build_key, kind = %kind, "Analyzing failure");

        let build = match self
            .history
            .get_build(&build_key.project, &build_key.builder, build_key.build_number)
            .await
        {
            Ok(Some(build)) => build,
            Ok(None) => {
                let err = AnalysisError::MissingBuildData {
                    build: build_key.to_string(),
                };
                return Err(self.abort(analysis, err).await);
            }
            Err(e) => return Err(self.abort(analysis, e.into()).await),
        };

        let steps = initial_failed_steps(&self.config, &build, |name| {
            strategy.handles_step(&self.config, name)
        });
        if steps.is_empty() {
            let reason = AnalysisError::UnsupportedFailureType {
                build: build_key.to_string(),
                reason: format!("no failed {kind} steps"),
            };
            tracing::info!(build = %build_key, reason = %reason, "Nothing to analyze");
            analysis.status = AnalysisStatus::Completed;
            analysis.result = Some(AnalysisResultStatus::NotFound);
            analysis.end_time = Some(Utc::now());
            self.save(&analysis, false).await?;
            metrics::analysis_finished(kind.as_str(), "not_found");
            return Ok(AnalysisOutcome {
                analysis,
                try_job: None,
            });
        }

        let range = find_regression_range(self.history.as_ref(), &self.config, &build, steps).await;
        analysis.failed_steps = range.failed_steps.clone();
        self.save(&analysis, false).await?;

        let from_revision = range
            .failed_steps
            .iter()
            .filter(|s| s.supported)
            .map(|s| s.last_pass.unwrap_or(s.first_failure - 1))
            .min()
            .and_then(|n| range.builds.get(&n))
            .map(|b| b.revision.clone());
        let change_logs = match self
            .change_logs
            .pull_change_logs(from_revision.as_deref(), &build.revision)
            .await
        {
            Ok(logs) => logs,
            Err(e) => return Err(self.abort(analysis, e.into()).await),
        };
        let deps_info = match self.deps.extract_deps_info(&build, &change_logs).await {
            Ok(deps) => deps,
            Err(e) => return Err(self.abort(analysis, e.into()).await),
        };

        let signals = extract_signals(kind, logs);
        let scored = score_suspects(
            self.scorer.as_ref(),
            &ScoringInput {
                failed_steps: &range.failed_steps,
                builds: &range.builds,
                change_logs: &change_logs,
                deps_info: &deps_info,
                signals: &signals,
            },
        );
        metrics::suspects_found(kind.as_str(), scored.suspects.len());
        tracing::info!(
            build = %build_key,
            suspects = scored.suspects.len(),
            top = ?scored.suspects.first().map(|s| &s.revision),
            "Heuristic analysis finished"
        );
        analysis.step_suspects = scored.steps;
        analysis.suspected_cls = scored.suspects;

        let signature = strategy.signature(&range.failed_steps, &signals);
        let membership = match regression_window(&range.failed_steps, &range.builds) {
            Some((last_passed, first_failed)) => {
                let ctx = GroupContext {
                    build: &build,
                    kind,
                    last_passed,
                    first_failed,
                };
                match find_or_create_group(self.store.as_ref(), &signature, &ctx, now).await {
                    Ok(membership) => membership,
                    Err(e) => {
                        tracing::warn!(build = %build_key, error = %e, "Grouping failed, continuing");
                        None
                    }
                }
            }
            None => None,
        };
        if let Some(m) = &membership {
            analysis.failure_group_id = Some(m.group.id);
            analysis.failure_group_build_id = m.group.representative_build_id;
        }

        analysis.status = AnalysisStatus::Completed;
        if !verified {
            analysis.result = Some(if analysis.suspected_cls.is_empty() {
                AnalysisResultStatus::NotFound
            } else {
                AnalysisResultStatus::Found
            });
        }
        analysis.end_time = Some(Utc::now());
        self.save(&analysis, false).await?;
        metrics::analysis_finished(kind.as_str(), AnalysisStatus::Completed.as_str());

        if verified {
            tracing::info!(
                build = %build_key,
                phase = ?analysis.try_job_phase,
                "Try-job verdict already recorded, not rescheduling"
            );
            let try_job = self
                .store
                .get_try_job(&TryJobKey::new(build_key.clone(), kind))
                .await?;
            return Ok(AnalysisOutcome { analysis, try_job });
        }

        let joined_group = membership.as_ref().is_some_and(|m| !m.is_new);
        let try_job_steps = if joined_group {
            Vec::new()
        } else {
            strategy.try_job_steps(&build, &range.failed_steps)
        };
        analysis.try_job_phase.apply(&TryJobEvent::Evaluated {
            needed: !try_job_steps.is_empty(),
        });
        if try_job_steps.is_empty() {
            if joined_group {
                tracing::info!(build = %build_key, "Grouped with an earlier failure, no try job");
            }
            self.save(&analysis, false).await?;
            return Ok(AnalysisOutcome {
                analysis,
                try_job: None,
            });
        }

        let try_job_range = match compute_try_job_range(
            &self.config,
            kind,
            &build,
            &try_job_steps,
            &range.builds,
            &signals,
        ) {
            Ok(r) => r,
            Err(e @ AnalysisError::NoGoodRevision { .. }) => {
                tracing::info!(build = %build_key, reason = %e, "No try job without a good revision");
                analysis
                    .try_job_phase
                    .apply(&TryJobEvent::Evaluated { needed: false });
                self.save(&analysis, false).await?;
                return Ok(AnalysisOutcome {
                    analysis,
                    try_job: None,
                });
            }
            Err(e) => return Err(e),
        };

        let try_job_key = TryJobKey::new(build_key.clone(), kind);
        match schedule_try_job(
            self.store.as_ref(),
            self.scheduler.as_ref(),
            &self.config,
            &try_job_key,
            try_job_range,
            &analysis.suspected_cls,
            now,
        )
        .await
        {
            Ok(job) => {
                if let Some(id) = job.try_job_ids.last() {
                    analysis.try_job_phase.apply(&TryJobEvent::Scheduled {
                        try_job_id: id.clone(),
                    });
                }
                if job.status == TryJobStatus::Running {
                    analysis.try_job_phase.apply(&TryJobEvent::Started);
                }
                self.save(&analysis, false).await?;
                Ok(AnalysisOutcome {
                    analysis,
                    try_job: Some(job),
                })
            }
            Err(e) => {
                analysis.try_job_phase.apply(&TryJobEvent::Failed {
                    reason: e.to_string(),
                });
                self.save(&analysis, false).await?;
                Err(e)
            }
        }
    }

    /// Feeds a scheduler status into the try job and, once it finishes,
    /// folds the verdict into the owning analysis.
    pub async fn on_try_job_update(
        &self,
        try_job_id: &str,
        status: &ExternalTryJobStatus,
    ) -> Result<TryJobOutcome, AnalysisError> {
        let now = Utc::now();
        let update = on_try_job_update(self.store.as_ref(), try_job_id, status, now).await?;
        if matches!(update, TryJobUpdate::Ignored(_)) {
            return Ok(TryJobOutcome {
                update,
                verdict: None,
                analysis: None,
            });
        }
        let job = update.try_job().clone();

        let key = AnalysisKey::new(job.key.build.clone(), job.key.kind);
        let Some(mut analysis) = self.store.get_analysis(&key).await? else {
            tracing::warn!(try_job = %job.key, "Try job has no analysis to update");
            return Ok(TryJobOutcome {
                update,
                verdict: None,
                analysis: None,
            });
        };

        let mut verdict = None;
        match job.status {
            TryJobStatus::Pending => {}
            TryJobStatus::Running => {
                analysis.try_job_phase.apply(&TryJobEvent::Started);
            }
            TryJobStatus::Error => {
                analysis.try_job_phase.apply(&TryJobEvent::Failed {
                    reason: job.error.clone().unwrap_or_default(),
                });
            }
            TryJobStatus::Completed => {
                let v = match (job.latest_report(), &job.range) {
                    (Some(report), Some(range)) => identify_culprit(job.key.kind, report, range),
                    _ => Verdict::Inconclusive {
                        reason: "try job finished without a report".into(),
                    },
                };
                apply_verdict(&mut analysis, &v, now);
                verdict = Some(v);
            }
        }
        self.save(&analysis, false).await?;

        Ok(TryJobOutcome {
            update,
            verdict,
            analysis: Some(analysis),
        })
    }

    /// Asks the scheduler where a try job stands and applies the answer.
    pub async fn poll_try_job(&self, try_job_id: &str) -> Result<TryJobOutcome, AnalysisError> {
        let status = self.scheduler.get_status(try_job_id).await.map_err(|source| {
            AnalysisError::TryJobScheduling {
                try_job: try_job_id.to_string(),
                source,
            }
        })?;
        self.on_try_job_update(try_job_id, &status).await
    }

    async fn save(&self, analysis: &Analysis, first: bool) -> Result<(), AnalysisError> {
        if first {
            match self.store.create_analysis(analysis).await {
                Err(StoreError::AlreadyExists { .. }) => {
                    self.store.update_analysis(analysis).await?
                }
                other => other?,
            }
        } else {
            self.store.update_analysis(analysis).await?;
        }
        Ok(())
    }

    /// Marks the analysis ERROR and hands back the error that caused it.
    async fn abort(&self, mut analysis: Analysis, err: AnalysisError) -> AnalysisError {
        tracing::warn!(analysis = %analysis.key, error = %err, "Analysis aborted");
        analysis.fail(err.to_string(), Utc::now());
        if let Err(e) = self.save(&analysis, false).await {
            tracing::error!(analysis = %analysis.key, error = %e, "Failed to persist aborted analysis");
        }
        metrics::analysis_finished(analysis.key.kind.as_str(), AnalysisStatus::Error.as_str());
        err
    }
}

/// Regression window of the first supported step, as commits.
fn regression_window(
    steps: &[FailedStep],
    builds: &BTreeMap<i64, Build>,
) -> Option<(Option<CommitRef>, CommitRef)> {
    let step = steps.iter().find(|s| s.supported)?;
    let commit = |b: &Build| CommitRef::new(&b.revision, b.commit_position);
    let first_failed = builds.get(&step.first_failure).map(commit)?;
    let last_passed = step.last_pass.and_then(|n| builds.get(&n)).map(commit);
    Some((last_passed, first_failed))
}

fn apply_verdict(analysis: &mut Analysis, verdict: &Verdict, now: DateTime<Utc>) {
    match verdict {
        Verdict::Found { culprits, .. } => {
            let mut found: Vec<Culprit> = Vec::new();
            for (failure, revision) in culprits {
                if let Some(existing) = found.iter_mut().find(|c| &c.revision == revision) {
                    existing.failures.push(failure.clone());
                    continue;
                }
                let suspect = analysis
                    .suspected_cls
                    .iter()
                    .find(|s| &s.revision == revision);
                found.push(Culprit {
                    repo_name: suspect
                        .map(|s| s.repo_name.clone())
                        .unwrap_or_else(|| analysis.key.build.project.clone()),
                    revision: revision.clone(),
                    commit_position: suspect.and_then(|s| s.commit_position),
                    source: CulpritSource::TryJob,
                    failures: vec![failure.clone()],
                });
            }
            tracing::info!(
                analysis = %analysis.key,
                culprits = ?found.iter().map(|c| &c.revision).collect::<Vec<_>>(),
                "Try job confirmed culprit"
            );
            analysis.culprits = found;
            analysis.result = Some(AnalysisResultStatus::Found);
            analysis.try_job_phase.apply(&TryJobEvent::Completed);
        }
        Verdict::Flaky { failures } => {
            tracing::info!(analysis = %analysis.key, ?failures, "Failure did not reproduce");
            analysis.flaky = true;
            analysis.auto_action_allowed = false;
            analysis.result = Some(AnalysisResultStatus::Flaky);
            analysis.try_job_phase.apply(&TryJobEvent::FlakeDetected);
        }
        Verdict::Inconclusive { reason } => {
            tracing::info!(analysis = %analysis.key, reason = %reason, "Try job was inconclusive");
            analysis.try_job_phase.apply(&TryJobEvent::Completed);
        }
    }
    analysis.end_time = Some(now);
}
