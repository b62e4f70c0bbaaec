//! Build records as reported by the build-history service.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one build of one builder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildKey {
    pub project: String,
    pub builder: String,
    pub build_number: i64,
}

impl BuildKey {
    pub fn new(project: impl Into<String>, builder: impl Into<String>, build_number: i64) -> Self {
        Self {
            project: project.into(),
            builder: builder.into(),
            build_number,
        }
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.builder, self.build_number)
    }
}

/// Overall outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    InfraFailure,
    Canceled,
    Running,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Failure => "FAILURE",
            BuildResult::InfraFailure => "INFRA_FAILURE",
            BuildResult::Canceled => "CANCELED",
            BuildResult::Running => "RUNNING",
        }
    }
}

/// A recorded build. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub project: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub builder: String,
    pub build_number: i64,
    #[serde(default)]
    pub build_id: Option<i64>,
    pub result: BuildResult,
    /// Commit the build checked out.
    pub revision: String,
    #[serde(default)]
    pub commit_position: Option<i64>,
    /// Commits new to this build, oldest first.
    #[serde(default)]
    pub blame_list: Vec<String>,
    #[serde(default)]
    pub failed_steps: BTreeSet<String>,
    #[serde(default)]
    pub passed_steps: BTreeSet<String>,
    /// Failing tests per step. A missing entry means the test list is unknown,
    /// not that no test failed.
    #[serde(default)]
    pub failed_tests: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

fn default_bucket() -> String {
    "ci".to_string()
}

impl Build {
    pub fn key(&self) -> BuildKey {
        BuildKey::new(&self.project, &self.builder, self.build_number)
    }

    pub fn is_completed(&self) -> bool {
        self.result != BuildResult::Running
    }

    pub fn step_failed(&self, step_name: &str) -> bool {
        self.failed_steps.contains(step_name)
    }

    pub fn step_passed(&self, step_name: &str) -> bool {
        self.passed_steps.contains(step_name)
    }

    /// Failing tests of `step_name`, if the build reported them.
    pub fn failed_tests_of(&self, step_name: &str) -> Option<&BTreeSet<String>> {
        self.failed_tests.get(step_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_key_display() {
        let key = BuildKey::new("chromium", "linux-rel", 120);
        assert_eq!(key.to_string(), "chromium/linux-rel/120");
    }

    #[test]
    fn build_deserializes_with_defaults() {
        let build: Build = serde_json::from_str(
            r#"{"project":"chromium","builder":"linux-rel","build_number":7,
                "result":"INFRA_FAILURE","revision":"r7"}"#,
        )
        .unwrap();
        assert_eq!(build.result, BuildResult::InfraFailure);
        assert_eq!(build.bucket, "ci");
        assert!(build.blame_list.is_empty());
        assert!(build.failed_tests_of("browser_tests").is_none());
        assert!(build.is_completed());
    }
}
