//! Builders shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::build::{Build, BuildResult};
use crate::models::change_log::{ChangeLog, FileChange};

pub const PROJECT: &str = "chromium";
pub const BUILDER: &str = "linux-rel";

/// Build `n` at revision `r{n}` blaming the single commit `r{n}`.
pub fn build(n: i64, result: BuildResult) -> Build {
    Build {
        project: PROJECT.into(),
        bucket: "ci".into(),
        builder: BUILDER.into(),
        build_number: n,
        build_id: Some(8_900_000 + n),
        result,
        revision: format!("r{n}"),
        commit_position: Some(n),
        blame_list: vec![format!("r{n}")],
        failed_steps: BTreeSet::new(),
        passed_steps: BTreeSet::new(),
        failed_tests: BTreeMap::new(),
        start_time: None,
    }
}

pub fn failed_build(n: i64, failed: &[&str]) -> Build {
    let mut b = build(n, BuildResult::Failure);
    b.failed_steps = failed.iter().map(|s| s.to_string()).collect();
    b
}

pub fn change_log(revision: &str, files: Vec<FileChange>) -> ChangeLog {
    ChangeLog {
        revision: revision.into(),
        commit_position: revision.trim_start_matches('r').parse().ok(),
        author: "dev@chromium.org".into(),
        touched_files: files,
        repo_name: "chromium".into(),
    }
}
