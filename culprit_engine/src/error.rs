//! Error taxonomy for the culprit-finding engine.
//!
//! Missing required input aborts only the analysis at hand. Failures of
//! external services come back as typed values the orchestrator can retry;
//! nothing here panics.

use thiserror::Error;

/// Failure talking to an external collaborator (build history, change logs,
/// dependency extraction).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    #[error("{service} returned malformed data: {reason}")]
    Malformed { service: &'static str, reason: String },
}

impl ProviderError {
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            service,
            reason: reason.into(),
        }
    }
}

/// The try-job scheduler refused or failed a request.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("try-job request rejected: {0}")]
    Rejected(String),

    #[error("try-job scheduler unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("stored {entity} could not be decoded: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The current build could not be retrieved. The analysis is marked
    /// ERROR and not retried by the engine.
    #[error("build data missing for {build}")]
    MissingBuildData { build: String },

    /// The build failed in a way this engine does not analyze. Callers
    /// record the analysis as not found rather than failed.
    #[error("unsupported failure type for {build}: {reason}")]
    UnsupportedFailureType { build: String, reason: String },

    /// No last known pass, so there is nothing to bisect from.
    #[error("no good revision for step {step}")]
    NoGoodRevision { step: String },

    #[error("try-job scheduling failed for {try_job}: {source}")]
    TryJobScheduling {
        try_job: String,
        #[source]
        source: SchedulerError,
    },

    #[error("inconsistent try-job result: {reason}")]
    InconsistentTryJobResult { reason: String },

    #[error("unknown try job {try_job_id}")]
    UnknownTryJob { try_job_id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnalysisError {
    /// Whether an orchestrator may retry the failed call unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::TryJobScheduling { .. } => true,
            AnalysisError::Provider(ProviderError::Unavailable { .. }) => true,
            AnalysisError::Store(StoreError::Backend(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduling_errors_are_retryable() {
        let err = AnalysisError::TryJobScheduling {
            try_job: "chromium/linux/120#compile".into(),
            source: SchedulerError::Rejected("quota".into()),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn missing_input_is_not_retryable() {
        let err = AnalysisError::MissingBuildData {
            build: "chromium/linux/120".into(),
        };
        assert!(!err.is_retryable());
        assert!(!AnalysisError::NoGoodRevision {
            step: "compile".into()
        }
        .is_retryable());
    }
}
