//! Lifecycle events for analyses.
//!
//! Phases only move through [`try_job::TryJobPhase::apply`], so a persisted
//! analysis never records an illegal transition.

pub mod try_job;
