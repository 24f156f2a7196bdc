//! Version-control client abstraction.
//!
//! The pipeline only needs six operations against an already-initialized
//! working tree. [`crate::git::GitCli`] implements them over the `git`
//! executable; [`crate::fakes::MemoryVcs`] implements them in memory.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Result;

/// Working-tree status. Paths are relative to the repository root, `/`-separated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    /// Index differs from `HEAD`, staged deletions included.
    pub staged: Vec<String>,
    /// Worktree differs from the index.
    pub modified: Vec<String>,
    /// Removed from the worktree but not yet from the index.
    pub deleted: Vec<String>,
    pub untracked: Vec<String>,
}

impl RepoStatus {
    /// Every path with pending changes, deduplicated and sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        self.staged
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .chain(&self.untracked)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.untracked.is_empty()
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        let hit = |list: &Vec<String>| list.iter().any(|p| p == path);
        hit(&self.staged) || hit(&self.modified) || hit(&self.deleted) || hit(&self.untracked)
    }

    /// True when staging `path` would change the index.
    pub fn has_unstaged_change(&self, path: &str) -> bool {
        let hit = |list: &Vec<String>| list.iter().any(|p| p == path);
        hit(&self.modified) || hit(&self.deleted) || hit(&self.untracked)
    }
}

/// Operations against one working tree.
///
/// Implementations must be safe to share across tasks; callers serialize
/// mutating calls (`add`, `commit`, `push`, `pull`) per repository.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn is_repository(&self) -> Result<bool>;

    async fn status(&self) -> Result<RepoStatus>;

    /// Stage `paths` (relative to the root), including deletions.
    async fn add(&self, paths: &[String]) -> Result<()>;

    /// Commit the index and return the new commit id.
    async fn commit(&self, message: &str) -> Result<String>;

    async fn push(&self) -> Result<()>;

    async fn pull(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_paths_dedupes_across_lists() {
        let status = RepoStatus {
            staged: vec!["a.md".into(), "b.md".into()],
            modified: vec!["b.md".into()],
            deleted: vec!["c.md".into()],
            untracked: vec!["a.md".into(), "d.md".into()],
        };
        assert_eq!(status.changed_paths(), vec!["a.md", "b.md", "c.md", "d.md"]);
        assert!(status.is_dirty("c.md"));
        assert!(!status.is_dirty("e.md"));
        assert!(!status.is_clean());
        assert!(RepoStatus::default().is_clean());
    }

    #[test]
    fn staged_only_path_has_nothing_left_to_add() {
        let status = RepoStatus {
            staged: vec!["a.md".into(), "b.md".into()],
            modified: vec!["b.md".into()],
            deleted: vec!["c.md".into()],
            untracked: vec!["d.md".into()],
        };
        assert!(status.is_dirty("a.md"));
        assert!(!status.has_unstaged_change("a.md"));
        assert!(status.has_unstaged_change("b.md"));
        assert!(status.has_unstaged_change("c.md"));
        assert!(status.has_unstaged_change("d.md"));
        assert!(!status.has_unstaged_change("e.md"));
    }
}
