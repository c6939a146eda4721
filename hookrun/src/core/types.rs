//! Job tree data model shared by the engine.
//!
//! These types are built once by the configuration loader and treated as
//! read-only while a hook runs. They must stay free of I/O.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Glob dialect used when matching `glob` and list-shaped `exclude` patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobDialect {
    /// Wildcards match across `/` (`*.rb` matches `lib/a.rb`).
    #[default]
    Loose,
    /// `*` stops at `/`; only `**` crosses directory boundaries.
    Doublestar,
}

/// Exclude rule carried by jobs and scopes.
///
/// List excludes are globs; a single string is a regular expression. The two
/// shapes merge differently when a scope is derived (see [`ExcludeSpec::merged_with`]).
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(untagged)]
pub enum ExcludeSpec {
    #[default]
    #[serde(skip)]
    NoOverride,
    Globs(Vec<String>),
    Pattern(String),
}

impl ExcludeSpec {
    /// Merge a child exclude into an inherited one.
    ///
    /// - child absent: inherited value is kept
    /// - child list + inherited list: concatenated
    /// - child list + inherited non-list: child replaces
    /// - child pattern: always replaces
    pub fn merged_with(&self, child: &ExcludeSpec) -> ExcludeSpec {
        match (self, child) {
            (_, ExcludeSpec::NoOverride) => self.clone(),
            (ExcludeSpec::Globs(parent), ExcludeSpec::Globs(extra)) => {
                let mut globs = parent.clone();
                globs.extend(extra.iter().cloned());
                ExcludeSpec::Globs(globs)
            }
            (_, ExcludeSpec::Globs(extra)) => ExcludeSpec::Globs(extra.clone()),
            (_, ExcludeSpec::Pattern(pattern)) => ExcludeSpec::Pattern(pattern.clone()),
        }
    }
}

/// Repository operation referenced by skip/only conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoOperation {
    Merge,
    MergeCommit,
    Rebase,
}

/// One entry of a skip/only condition list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConditionItem {
    Operation(RepoOperation),
    Ref {
        #[serde(rename = "ref")]
        branch: String,
    },
    Run {
        run: String,
    },
}

/// `skip` / `only` value: a literal boolean or a list of conditions (any may hold).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Flag(bool),
    Any(Vec<ConditionItem>),
}

/// When post-run working tree changes turn into a hook error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailOnChanges {
    #[default]
    Never,
    Always,
    /// Only when the `CI` environment variable is set.
    Ci,
}

impl FailOnChanges {
    pub fn enabled(self, ci: bool) -> bool {
        match self {
            FailOnChanges::Never => false,
            FailOnChanges::Always => true,
            FailOnChanges::Ci => ci,
        }
    }
}

/// A named unit of work: a `run` command, a `script`, or a nested `group`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Job {
    pub name: String,
    pub run: Option<String>,
    pub script: Option<String>,
    /// Prefix for script invocations (e.g. `bash`).
    pub runner: Option<String>,
    pub group: Option<Group>,
    pub root: Option<String>,
    pub glob: Vec<String>,
    pub exclude: ExcludeSpec,
    pub tags: Vec<String>,
    pub skip: Option<Condition>,
    pub only: Option<Condition>,
    pub env: BTreeMap<String, String>,
    /// Shell command whose output feeds `{files}`.
    pub files: Option<String>,
    pub file_types: Vec<String>,
    pub interactive: bool,
    pub use_stdin: bool,
    pub stage_fixed: bool,
    pub fail_text: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Job {
    /// Name used in results and logs; falls back to the command when unnamed.
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            return &self.name;
        }
        self.run
            .as_deref()
            .or(self.script.as_deref())
            .unwrap_or("group")
    }
}

/// An ordered list of jobs plus a concurrency mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Group {
    pub parallel: Option<bool>,
    pub piped: Option<bool>,
    pub jobs: Vec<Job>,
}

impl Group {
    /// The group's own mode, or `None` to inherit the enclosing one.
    pub fn mode(&self) -> Option<Mode> {
        mode_from_flags(self.parallel, self.piped)
    }

    pub fn has_conflicting_mode(&self) -> bool {
        self.parallel == Some(true) && self.piped == Some(true)
    }
}

/// How a group's children are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Sequential,
    Parallel,
    /// Sequential; remaining siblings are skipped once anything failed.
    Piped,
}

fn mode_from_flags(parallel: Option<bool>, piped: Option<bool>) -> Option<Mode> {
    match (parallel, piped) {
        (Some(true), _) => Some(Mode::Parallel),
        (_, Some(true)) => Some(Mode::Piped),
        (None, None) => None,
        _ => Some(Mode::Sequential),
    }
}

/// Jobs configured for one hook name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hook {
    pub parallel: bool,
    pub piped: bool,
    pub jobs: Vec<Job>,
    pub exclude_tags: Vec<String>,
    /// Hook-wide files command for jobs without their own.
    pub files: Option<String>,
    pub skip: Option<Condition>,
    pub only: Option<Condition>,
    pub fail_on_changes: FailOnChanges,
}

impl Hook {
    pub fn mode(&self) -> Mode {
        mode_from_flags(Some(self.parallel), Some(self.piped)).unwrap_or_default()
    }
}
