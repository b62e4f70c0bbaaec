//! Culprit-finding services. Each stage is usable on its own;
//! [`analysis::FailureAnalyzer`] runs them in order for one failed build.

pub mod analysis;
pub mod flake_aggregator;
pub mod grouping;
pub mod heuristic;
pub mod regression_range;
pub mod signal;
pub mod try_job_controller;
