//! Execution context inherited down a job tree.
//!
//! A [`Scope`] is a plain value: entering a group produces a new scope via
//! [`Scope::derive`] and never touches the parent. The only state shared
//! between copies is the [`FailureFlag`].

use std::collections::{BTreeMap, BTreeSet};

use crate::core::signal::FailureFlag;
use crate::core::types::{ExcludeSpec, Group, Job, Mode};

const NAME_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub mode: Mode,
    pub glob: Vec<String>,
    pub tags: Vec<String>,
    pub exclude: ExcludeSpec,
    /// Path prefix jobs run under, relative to the repository root.
    pub root: Option<String>,
    /// Names of the enclosing groups, outermost first.
    pub names: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// When non-empty, only leaf jobs with these names run.
    pub only_jobs: BTreeSet<String>,
    /// When non-empty, only leaf jobs carrying one of these tags run.
    pub only_tags: BTreeSet<String>,
    pub failed: FailureFlag,
}

impl Scope {
    /// Scope for the children of `group`, which is declared by `job`.
    pub fn derive(&self, job: &Job, group: &Group) -> Scope {
        let mut child = self.clone();
        if let Some(mode) = group.mode() {
            child.mode = mode;
        }
        if let Some(root) = &job.root {
            child.root = Some(root.clone());
        }
        child.glob.extend(job.glob.iter().cloned());
        child.tags.extend(job.tags.iter().cloned());
        child.exclude = self.exclude.merged_with(&job.exclude);
        // Selecting a group by name selects everything inside it.
        if !self.only_jobs.is_empty() && self.only_jobs.contains(&job.name) {
            child.only_jobs.clear();
        }
        child
            .env
            .extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        child.names.push(job.display_name().to_string());
        child
    }

    /// Full display path of `job` inside this scope.
    pub fn display_name(&self, job: &Job) -> String {
        let mut parts: Vec<&str> = self.names.iter().map(String::as_str).collect();
        parts.push(job.display_name());
        parts.join(NAME_SEPARATOR)
    }

    /// Environment for a leaf job: inherited values shadowed by the job's own.
    pub fn env_for(&self, job: &Job) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Whether the only-jobs / only-tags selections admit this leaf job.
    pub fn selects_leaf(&self, job: &Job) -> bool {
        if !self.only_jobs.is_empty() && !self.only_jobs.contains(&job.name) {
            return false;
        }
        if self.only_tags.is_empty() {
            return true;
        }
        self.tags
            .iter()
            .chain(job.tags.iter())
            .any(|tag| self.only_tags.contains(tag))
    }
}
