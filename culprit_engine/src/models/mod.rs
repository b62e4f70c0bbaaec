//! Culprit-finding data models. Plain data, no persistence concerns.

pub mod analysis;
pub mod build;
pub mod change_log;
pub mod failure;
pub mod flake;
pub mod group;
pub mod suspect;
pub mod try_job;
