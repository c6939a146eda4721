//! Evaluation of `skip` / `only` conditions against repository state.

use std::sync::OnceLock;

use globset::Glob;
use tracing::{debug, warn};

use crate::core::types::{Condition, ConditionItem, RepoOperation};
use crate::io::repository::{RepoState, Repository};

/// Checks conditions for one hook run. Repository state is queried at most once.
pub struct SkipChecker<'a> {
    repo: &'a dyn Repository,
    state: OnceLock<Option<RepoState>>,
}

impl<'a> SkipChecker<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self {
            repo,
            state: OnceLock::new(),
        }
    }

    /// True when `skip` holds or `only` is set and does not hold.
    pub fn should_skip(&self, skip: Option<&Condition>, only: Option<&Condition>) -> bool {
        if skip.is_some_and(|cond| self.holds(cond)) {
            return true;
        }
        only.is_some_and(|cond| !self.holds(cond))
    }

    fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Flag(value) => *value,
            Condition::Any(items) => items.iter().any(|item| self.item_holds(item)),
        }
    }

    fn item_holds(&self, item: &ConditionItem) -> bool {
        match item {
            ConditionItem::Operation(op) => self.state().is_some_and(|state| match op {
                RepoOperation::Merge => state.merging,
                RepoOperation::MergeCommit => state.merge_commit,
                RepoOperation::Rebase => state.rebasing,
            }),
            ConditionItem::Ref { branch } => self
                .state()
                .and_then(|state| state.branch.as_deref())
                .is_some_and(|current| ref_matches(branch, current)),
            ConditionItem::Run { run } => match self.repo.command_succeeds(run) {
                Ok(success) => {
                    debug!(command = %run, success, "condition command");
                    success
                }
                Err(err) => {
                    warn!(command = %run, err = %err, "condition command failed to run");
                    false
                }
            },
        }
    }

    fn state(&self) -> Option<&RepoState> {
        self.state
            .get_or_init(|| match self.repo.state() {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!(err = %err, "could not read repository state");
                    None
                }
            })
            .as_ref()
    }
}

/// Exact branch name, or a glob such as `release/*`.
fn ref_matches(pattern: &str, branch: &str) -> bool {
    if pattern == branch {
        return true;
    }
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(branch),
        Err(err) => {
            warn!(pattern, err = %err, "invalid ref pattern");
            false
        }
    }
}
