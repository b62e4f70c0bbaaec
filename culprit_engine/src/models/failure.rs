//! Failed steps, failed tests and the signals extracted from their logs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which family of failure an analysis handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Compile,
    Test,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Compile => "compile",
            FailureKind::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compile" => Some(FailureKind::Compile),
            "test" => Some(FailureKind::Test),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regression range of a single failing test inside a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub current_failure: i64,
    pub first_failure: i64,
    pub last_pass: Option<i64>,
}

impl TestFailure {
    pub fn new(test_name: impl Into<String>, current_failure: i64) -> Self {
        Self {
            test_name: test_name.into(),
            current_failure,
            first_failure: current_failure,
            last_pass: None,
        }
    }
}

/// Regression range of a failing step.
///
/// `last_pass` only ever tightens towards the true boundary and
/// `first_failure` only ever decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_name: String,
    pub current_failure: i64,
    pub first_failure: i64,
    pub last_pass: Option<i64>,
    pub supported: bool,
    #[serde(default)]
    pub tests: BTreeMap<String, TestFailure>,
}

impl FailedStep {
    pub fn new(step_name: impl Into<String>, current_failure: i64, supported: bool) -> Self {
        Self {
            step_name: step_name.into(),
            current_failure,
            first_failure: current_failure,
            last_pass: None,
            supported,
            tests: BTreeMap::new(),
        }
    }

    pub fn with_tests<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for test in tests {
            let test = test.into();
            self.tests
                .insert(test.clone(), TestFailure::new(test, self.current_failure));
        }
        self
    }

    /// Whether this failure first showed up in the current build.
    pub fn is_new_failure(&self) -> bool {
        self.first_failure == self.current_failure
    }

    /// Inclusive range of build numbers whose blame lists may hold the culprit.
    pub fn suspect_build_range(&self) -> std::ops::RangeInclusive<i64> {
        suspect_range(self.last_pass, self.first_failure, self.current_failure)
    }
}

impl TestFailure {
    pub fn suspect_build_range(&self) -> std::ops::RangeInclusive<i64> {
        suspect_range(self.last_pass, self.first_failure, self.current_failure)
    }
}

fn suspect_range(
    last_pass: Option<i64>,
    first_failure: i64,
    current_failure: i64,
) -> std::ops::RangeInclusive<i64> {
    let start = match last_pass {
        Some(pass) => pass + 1,
        None => first_failure,
    };
    start..=current_failure
}

/// One target that failed to build, with the source it compiled (if any).
///
/// Link failures have no source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailedTarget {
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
}

/// Evidence extracted from a failure log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    /// Paths mentioned in the log with the line numbers they were cited at.
    #[serde(default)]
    pub files: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    pub keywords: BTreeMap<String, u32>,
    #[serde(default)]
    pub failed_output_nodes: BTreeSet<String>,
    #[serde(default)]
    pub failed_targets: Vec<FailedTarget>,
}

impl FailureSignal {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.keywords.is_empty()
            && self.failed_output_nodes.is_empty()
            && self.failed_targets.is_empty()
    }

    pub fn add_file(&mut self, path: impl Into<String>, line: Option<u32>) {
        let lines = self.files.entry(path.into()).or_default();
        if let Some(line) = line {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
    }

    pub fn add_keyword(&mut self, keyword: impl Into<String>) {
        *self.keywords.entry(keyword.into()).or_insert(0) += 1;
    }

    /// Folds another signal into this one.
    pub fn merge(&mut self, other: &FailureSignal) {
        for (path, lines) in &other.files {
            let entry = self.files.entry(path.clone()).or_default();
            for line in lines {
                if !entry.contains(line) {
                    entry.push(*line);
                }
            }
        }
        for (keyword, count) in &other.keywords {
            *self.keywords.entry(keyword.clone()).or_insert(0) += count;
        }
        self.failed_output_nodes
            .extend(other.failed_output_nodes.iter().cloned());
        for target in &other.failed_targets {
            if !self.failed_targets.contains(target) {
                self.failed_targets.push(target.clone());
            }
        }
    }
}

/// Signal of one failed step plus per-test signals, when the step ran tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSignal {
    pub signal: FailureSignal,
    #[serde(default)]
    pub tests: BTreeMap<String, FailureSignal>,
}

impl StepSignal {
    pub fn is_empty(&self) -> bool {
        self.signal.is_empty() && self.tests.values().all(FailureSignal::is_empty)
    }
}

/// Signals of every failed step in a build, keyed by step name.
pub type FailureSignals = BTreeMap<String, StepSignal>;

/// Raw log of one failed step, plus per-test logs when the step ran tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub tests: BTreeMap<String, String>,
}

pub type StepLogs = BTreeMap<String, StepLog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspect_range_starts_after_last_pass() {
        let mut step = FailedStep::new("compile", 120, true);
        step.first_failure = 119;
        step.last_pass = Some(118);
        assert_eq!(step.suspect_build_range(), 119..=120);
    }

    #[test]
    fn suspect_range_without_last_pass_starts_at_first_failure() {
        let mut step = FailedStep::new("compile", 120, true);
        step.first_failure = 112;
        assert_eq!(step.suspect_build_range(), 112..=120);
    }

    #[test]
    fn merge_deduplicates_lines_and_targets() {
        let mut a = FailureSignal::default();
        a.add_file("base/foo.cc", Some(10));
        a.failed_targets.push(FailedTarget {
            source: None,
            target: "chrome".into(),
        });
        let mut b = FailureSignal::default();
        b.add_file("base/foo.cc", Some(10));
        b.add_file("base/foo.cc", Some(12));
        b.failed_targets.push(FailedTarget {
            source: None,
            target: "chrome".into(),
        });
        a.merge(&b);
        assert_eq!(a.files["base/foo.cc"], vec![10, 12]);
        assert_eq!(a.failed_targets.len(), 1);
    }

    #[test]
    fn failure_kind_parse_is_case_insensitive() {
        assert_eq!(FailureKind::parse("COMPILE"), Some(FailureKind::Compile));
        assert_eq!(FailureKind::parse("test"), Some(FailureKind::Test));
        assert_eq!(FailureKind::parse("lint"), None);
    }
}
