//! Commits in a regression range and the dependency pins they moved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Rename,
    Copy,
}

/// One file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub change_type: ChangeType,
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub new_path: Option<String>,
}

impl FileChange {
    pub fn modified(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            change_type: ChangeType::Modify,
            old_path: Some(path.clone()),
            new_path: Some(path),
        }
    }

    pub fn added(path: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Add,
            old_path: None,
            new_path: Some(path.into()),
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Delete,
            old_path: Some(path.into()),
            new_path: None,
        }
    }

    /// The path that identifies this change: the new path unless the file
    /// was deleted.
    pub fn path(&self) -> Option<&str> {
        match self.change_type {
            ChangeType::Delete => self.old_path.as_deref(),
            _ => self.new_path.as_deref().or(self.old_path.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub revision: String,
    #[serde(default)]
    pub commit_position: Option<i64>,
    pub author: String,
    #[serde(default)]
    pub touched_files: Vec<FileChange>,
    pub repo_name: String,
}

/// A dependency whose pinned revision moved in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRoll {
    /// Checkout path of the dependency, e.g. `third_party/skia`.
    pub dep_path: String,
    pub repo_url: String,
    #[serde(default)]
    pub old_revision: Option<String>,
    pub new_revision: String,
}

/// Dependency rolls keyed by the revision that made them.
pub type DepsInfo = BTreeMap<String, Vec<DependencyRoll>>;
