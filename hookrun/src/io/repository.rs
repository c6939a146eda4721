//! Version-control operations the engine depends on.
//!
//! The [`Repository`] trait decouples hook orchestration from `git`. The
//! production implementation is [`crate::io::git::Git`]; tests use an
//! in-memory fake.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

/// Path -> content fingerprint of every changed or untracked file.
pub type Changeset = BTreeMap<String, String>;

/// Paths whose fingerprint differs between two changesets.
pub fn changed_paths(before: &Changeset, after: &Changeset) -> Vec<String> {
    let mut paths: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|path| before.get(*path) != after.get(*path))
        .cloned()
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// In-progress repository operations, used by skip/only conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoState {
    /// Current branch, `None` on a detached HEAD.
    pub branch: Option<String>,
    pub merging: bool,
    pub rebasing: bool,
    /// HEAD is a merge commit.
    pub merge_commit: bool,
}

pub trait Repository: Send + Sync {
    /// Repository root; jobs resolve paths against it.
    fn root(&self) -> &Path;

    fn staged_files(&self) -> Result<Vec<String>>;
    fn staged_files_with_deleted(&self) -> Result<Vec<String>>;
    fn push_files(&self) -> Result<Vec<String>>;
    fn all_files(&self) -> Result<Vec<String>>;

    /// Run `command` in the job root and keep the output lines naming existing
    /// files under it. Paths come back repository-relative.
    fn files_by_command(&self, command: &str, root: Option<&str>) -> Result<Vec<String>>;

    /// Files with both staged and unstaged modifications.
    fn partially_staged_files(&self) -> Result<Vec<String>>;
    /// Back up unstaged changes of `files` (patch + stash entry).
    fn save_unstaged(&self, files: &[String]) -> Result<()>;
    /// Drop unstaged changes of `files` from the worktree.
    fn hide_unstaged(&self, files: &[String]) -> Result<()>;
    fn restore_unstaged(&self) -> Result<()>;
    /// Discard the backup: the stash entry and any patch left behind.
    fn drop_unstaged_stash(&self) -> Result<()>;

    fn changeset(&self) -> Result<Changeset>;
    fn add_files(&self, files: &[String]) -> Result<()>;

    fn state(&self) -> Result<RepoState>;
    /// Run a condition command through the shell; true on exit status 0.
    fn command_succeeds(&self, command: &str) -> Result<bool>;
    fn lfs_available(&self) -> bool;
}
