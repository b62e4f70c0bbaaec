//! Suspected CLs produced by the heuristic scorer and confirmed culprits.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A (step, test) pair a suspect is blamed for. `test` is `None` for
/// step-level attribution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailureRef {
    pub step_name: String,
    #[serde(default)]
    pub test_name: Option<String>,
}

impl FailureRef {
    pub fn step(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            test_name: None,
        }
    }

    pub fn test(step_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            test_name: Some(test_name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectedCl {
    pub repo_name: String,
    pub revision: String,
    #[serde(default)]
    pub commit_position: Option<i64>,
    /// Build whose blame list introduced the commit.
    pub build_number: i64,
    pub score: u32,
    /// Reason → weight contributed to `score`.
    #[serde(default)]
    pub hints: BTreeMap<String, u32>,
    #[serde(default)]
    pub failures: Vec<FailureRef>,
}

impl SuspectedCl {
    /// Ranking order: score descending, then newer commit, then revision.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.commit_position.cmp(&self.commit_position))
            .then_with(|| self.revision.cmp(&other.revision))
    }

    pub fn add_failure(&mut self, failure: FailureRef) {
        if !self.failures.contains(&failure) {
            self.failures.push(failure);
            self.failures.sort();
        }
    }
}

/// Sorts suspects into ranking order.
pub fn rank_suspects(suspects: &mut [SuspectedCl]) {
    suspects.sort_by(SuspectedCl::rank_cmp);
}

/// How a culprit was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CulpritSource {
    Heuristic,
    TryJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Culprit {
    pub repo_name: String,
    pub revision: String,
    #[serde(default)]
    pub commit_position: Option<i64>,
    pub source: CulpritSource,
    #[serde(default)]
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suspect(revision: &str, score: u32, position: Option<i64>) -> SuspectedCl {
        SuspectedCl {
            repo_name: "chromium".into(),
            revision: revision.into(),
            commit_position: position,
            build_number: 1,
            score,
            hints: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    #[test]
    fn ranking_prefers_score_then_newer_commit() {
        let mut suspects = vec![
            suspect("a", 2, Some(10)),
            suspect("b", 5, Some(9)),
            suspect("c", 2, Some(11)),
        ];
        rank_suspects(&mut suspects);
        let order: Vec<_> = suspects.iter().map(|s| s.revision.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn add_failure_keeps_unique_sorted_refs() {
        let mut s = suspect("a", 1, None);
        s.add_failure(FailureRef::test("browser_tests", "B.Test"));
        s.add_failure(FailureRef::step("browser_tests"));
        s.add_failure(FailureRef::step("browser_tests"));
        assert_eq!(s.failures.len(), 2);
        assert_eq!(s.failures[0], FailureRef::step("browser_tests"));
    }
}
