//! Metrics for culprit-finding observability.
//!
//! Recorded through the `metrics` facade; the binary decides which recorder
//! (if any) is installed.

use metrics::{counter, histogram};

/// Record an analysis reaching a final status.
pub fn analysis_finished(kind: &str, status: &str) {
    counter!("culprit_analyses_total", "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record suspects produced by the heuristic scorer.
pub fn suspects_found(kind: &str, count: usize) {
    counter!("culprit_suspects_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Record whether a failure joined an existing group or started a new one.
pub fn failure_grouped(outcome: &str) {
    counter!("culprit_failure_groups_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a try-job state transition.
pub fn try_job_status_changed(status: &str) {
    counter!("culprit_try_jobs_total", "status" => status.to_string()).increment(1);
}

/// Record wall time of a finished try job.
pub fn try_job_duration(seconds: i64) {
    histogram!("culprit_try_job_duration_seconds").record(seconds.max(0) as f64);
}

/// Record the verdict drawn from a try-job report.
pub fn verdict_recorded(outcome: &str) {
    counter!("culprit_verdicts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a flake aggregation run.
pub fn flake_aggregated(in_window: usize) {
    counter!("culprit_flake_aggregations_total").increment(1);
    histogram!("culprit_flake_window_occurrences").record(in_window as f64);
}
