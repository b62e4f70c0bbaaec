//! Culprit finding for CI failures.
//!
//! Given a failed build, narrows the regression range over earlier builds,
//! scores the commits in that range against signals pulled from the failure
//! logs, groups the failure with matching failures on other builders and
//! verifies the top suspects with a bisecting try job. Flake occurrences are
//! ranked separately by [`services::flake_aggregator`].
//!
//! External systems (build history, source control, the try-job scheduler)
//! sit behind the traits in [`providers`]; state lives behind
//! [`store::AnalysisStore`].

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod services;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::AnalysisError;
pub use services::analysis::{AnalysisOutcome, FailureAnalyzer, TryJobOutcome};
