//! Failure groups: one record per root cause seen across builders.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::build::BuildKey;
use super::failure::FailureKind;

/// Sorted, deduplicated identifiers of what failed: output nodes for compile
/// failures, `step/test` names for test failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureSignature(BTreeSet<String>);

impl FailureSignature {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            nodes
                .into_iter()
                .map(Into::into)
                .filter(|n: &String| !n.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.0
    }
}

/// A commit bounding a regression window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub revision: String,
    #[serde(default)]
    pub commit_position: Option<i64>,
}

impl CommitRef {
    pub fn new(revision: impl Into<String>, commit_position: Option<i64>) -> Self {
        Self {
            revision: revision.into(),
            commit_position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureGroup {
    pub id: Uuid,
    /// Source project the regression window refers to.
    pub project: String,
    pub bucket: String,
    pub kind: FailureKind,
    pub representative_build: BuildKey,
    #[serde(default)]
    pub representative_build_id: Option<i64>,
    #[serde(default)]
    pub last_passed_commit: Option<CommitRef>,
    pub first_failed_commit: CommitRef,
    pub output_nodes: FailureSignature,
    #[serde(default)]
    pub member_failure_keys: Vec<BuildKey>,
    pub created_at: DateTime<Utc>,
}

impl FailureGroup {
    /// Whether the regression window `(last_passed, first_failed]` of this
    /// group intersects the given one.
    ///
    /// Falls back to comparing first-failed revisions when commit positions
    /// are unavailable.
    pub fn overlaps(&self, last_passed: Option<&CommitRef>, first_failed: &CommitRef) -> bool {
        let ours = window(self.last_passed_commit.as_ref(), &self.first_failed_commit);
        let theirs = window(last_passed, first_failed);
        match (ours, theirs) {
            (Some((a_lo, a_hi)), Some((b_lo, b_hi))) => a_lo < b_hi && b_lo < a_hi,
            _ => self.first_failed_commit.revision == first_failed.revision,
        }
    }

    pub fn add_member(&mut self, key: BuildKey) -> bool {
        if self.member_failure_keys.contains(&key) {
            return false;
        }
        self.member_failure_keys.push(key);
        true
    }
}

/// Half-open window of commit positions; an unknown last pass extends the
/// window one commit below the first failure.
fn window(last_passed: Option<&CommitRef>, first_failed: &CommitRef) -> Option<(i64, i64)> {
    let hi = first_failed.commit_position?;
    let lo = match last_passed {
        Some(commit) => commit.commit_position?,
        None => hi - 1,
    };
    Some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(lo: i64, hi: i64) -> FailureGroup {
        FailureGroup {
            id: Uuid::new_v4(),
            project: "chromium/src".into(),
            bucket: "ci".into(),
            kind: FailureKind::Compile,
            representative_build: BuildKey::new("chromium", "linux", 1),
            representative_build_id: Some(8_000_001),
            last_passed_commit: Some(CommitRef::new(format!("r{lo}"), Some(lo))),
            first_failed_commit: CommitRef::new(format!("r{hi}"), Some(hi)),
            output_nodes: FailureSignature::new(["foo.o"]),
            member_failure_keys: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn signature_is_sorted_and_deduplicated() {
        let sig = FailureSignature::new(["b.o", "a.o", "b.o", ""]);
        let nodes: Vec<_> = sig.nodes().iter().cloned().collect();
        assert_eq!(nodes, vec!["a.o", "b.o"]);
    }

    #[test]
    fn windows_overlap_when_intervals_intersect() {
        let g = group(100, 105);
        let lp = CommitRef::new("r103", Some(103));
        assert!(g.overlaps(Some(&lp), &CommitRef::new("r108", Some(108))));
        let lp = CommitRef::new("r105", Some(105));
        assert!(!g.overlaps(Some(&lp), &CommitRef::new("r110", Some(110))));
    }

    #[test]
    fn overlap_without_positions_compares_first_failed_revision() {
        let g = group(100, 105);
        assert!(g.overlaps(None, &CommitRef::new("r105", None)));
        assert!(!g.overlaps(None, &CommitRef::new("r104", None)));
    }
}
