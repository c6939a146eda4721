//! Hook lifecycle: everything around one evaluation of a hook's job tree.
//!
//! Order of operations:
//!
//! 1. hook-level `skip` / `only`
//! 2. `git lfs <hook>` for hooks git-lfs also installs
//! 3. stash and hide unstaged parts of partially staged files
//! 4. changeset snapshot (when failing on changes)
//! 5. job tree evaluation
//! 6. second snapshot, then restore of the stashed changes
//!
//! Repository stash operations never overlap with job execution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::command::BuildContext;
use crate::core::hooks;
use crate::core::replacer::shell_escape;
use crate::core::result::{JobResult, any_failed};
use crate::core::scope::Scope;
use crate::core::signal::{CancelToken, FailureFlag};
use crate::core::types::{FailOnChanges, Hook};
use crate::io::config::EngineSettings;
use crate::io::executor::{CachedStdin, ExecRequest, Executor};
use crate::io::process::StdinMode;
use crate::io::repository::{Changeset, Repository, changed_paths};
use crate::run::{Evaluator, Indicator};
use crate::skip::SkipChecker;

/// Marker files that make git-lfs mandatory.
const LFS_MARKERS: [&str; 2] = [".lfs-required", ".lfsconfig"];

/// Caller-level knobs for one hook run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Arguments git passed to the hook.
    pub git_args: Vec<String>,
    /// Extra `{name}` template values.
    pub templates: BTreeMap<String, String>,
    /// Run jobs even when no files match.
    pub force: bool,
    /// Stream job output live.
    pub follow: bool,
    pub no_stash: bool,
    pub exclude_tags: Vec<String>,
    pub only_jobs: Vec<String>,
    pub only_tags: Vec<String>,
    /// Overrides the hook's `fail_on_changes`.
    pub fail_on_changes: Option<FailOnChanges>,
    pub cancel: CancelToken,
    /// The hook's own standard input.
    pub stdin: Arc<CachedStdin>,
}

/// Conditions that abort a hook run as a whole.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("files were modified by a hook: {}", .paths.join(", "))]
    FilesModified { paths: Vec<String> },
    #[error("git-lfs is required but was not found in PATH")]
    LfsRequired,
    #[error("git lfs {hook} failed")]
    LfsFailed { hook: String },
    #[error("hook run was cancelled")]
    Cancelled,
}

/// Results of every top-level job plus the hook-level error, if any.
#[derive(Debug, Default)]
pub struct HookOutcome {
    pub results: Vec<JobResult>,
    pub error: Option<HookError>,
}

impl HookOutcome {
    fn aborted(error: HookError) -> Self {
        Self {
            results: Vec::new(),
            error: Some(error),
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some() || any_failed(&self.results)
    }
}

/// Collaborators for running hooks in one repository.
#[derive(Clone, Copy)]
pub struct Runner<'a> {
    pub repo: &'a dyn Repository,
    pub executor: &'a dyn Executor,
    pub settings: &'a EngineSettings,
    pub indicator: &'a dyn Indicator,
}

impl Runner<'_> {
    /// Run every job of `hook`. Job failures are results, never errors.
    #[instrument(skip_all, fields(hook = hook_name, jobs = hook.jobs.len()))]
    pub fn run_all(&self, hook_name: &str, hook: &Hook, opts: &RunOptions) -> HookOutcome {
        let skips = SkipChecker::new(self.repo);
        if skips.should_skip(hook.skip.as_ref(), hook.only.as_ref()) {
            info!("hook skipped by condition");
            return HookOutcome::default();
        }

        if hooks::is_lfs_hook(hook_name)
            && let Err(err) = self.run_lfs(hook_name, opts)
        {
            return HookOutcome::aborted(err);
        }

        let stashed = self.stash_unstaged(hook_name, opts);

        let ci = std::env::var_os("CI").is_some();
        let detect_changes = opts
            .fail_on_changes
            .unwrap_or(hook.fail_on_changes)
            .enabled(ci);
        let before = detect_changes.then(|| self.changeset()).flatten();

        let results = self.evaluate(hook_name, hook, opts, &skips);

        let after = before.as_ref().and_then(|_| self.changeset());
        if stashed {
            self.restore_unstaged();
        }

        let error = if opts.cancel.is_cancelled() {
            Some(HookError::Cancelled)
        } else {
            match (&before, &after) {
                (Some(before), Some(after)) => {
                    let paths = changed_paths(before, after);
                    (!paths.is_empty()).then_some(HookError::FilesModified { paths })
                }
                _ => None,
            }
        };
        HookOutcome { results, error }
    }

    fn evaluate(
        &self,
        hook_name: &str,
        hook: &Hook,
        opts: &RunOptions,
        skips: &SkipChecker<'_>,
    ) -> Vec<JobResult> {
        let ctx = BuildContext {
            hook_name,
            repo: self.repo,
            settings: self.settings,
            git_args: &opts.git_args,
            templates: &opts.templates,
            force: opts.force,
            hook_files: hook.files.as_deref(),
        };
        let exclude_tags: BTreeSet<String> = hook
            .exclude_tags
            .iter()
            .chain(&opts.exclude_tags)
            .cloned()
            .collect();
        let scope = Scope {
            mode: hook.mode(),
            only_jobs: opts.only_jobs.iter().cloned().collect(),
            only_tags: opts.only_tags.iter().cloned().collect(),
            failed: FailureFlag::default(),
            ..Scope::default()
        };
        let evaluator = Evaluator::new(
            ctx,
            self.executor,
            skips,
            exclude_tags,
            opts.follow,
            &opts.stdin,
            opts.cancel.clone(),
            self.indicator,
        );
        evaluator.run_jobs(&scope, &hook.jobs)
    }

    fn run_lfs(&self, hook_name: &str, opts: &RunOptions) -> Result<(), HookError> {
        let root = self.repo.root();
        let required = LFS_MARKERS.iter().any(|marker| root.join(marker).exists());

        if !self.repo.lfs_available() {
            if required {
                return Err(HookError::LfsRequired);
            }
            debug!("git-lfs not installed, skipping lfs hook");
            return Ok(());
        }

        let mut command = format!("git lfs {hook_name}");
        for arg in &opts.git_args {
            command.push(' ');
            command.push_str(&shell_escape(arg));
        }
        let stdin = if hook_name == hooks::PRE_PUSH {
            match opts.stdin.bytes() {
                Ok(bytes) => StdinMode::Bytes(bytes),
                Err(err) => {
                    warn!(err = %err, "could not read hook stdin for git lfs");
                    StdinMode::Null
                }
            }
        } else {
            StdinMode::Null
        };
        let request = ExecRequest {
            name: "git lfs".to_string(),
            commands: vec![command],
            root: root.to_path_buf(),
            env: BTreeMap::new(),
            stdin,
            interactive: false,
            follow: opts.follow,
            timeout: None,
            cancel: opts.cancel.clone(),
        };
        let succeeded = match self.executor.execute(&request) {
            Ok(succeeded) => succeeded,
            Err(err) => {
                warn!(err = %err, "git lfs could not run");
                false
            }
        };
        if !succeeded && required {
            return Err(HookError::LfsFailed {
                hook: hook_name.to_string(),
            });
        }
        if !succeeded {
            warn!(hook = hook_name, "git lfs failed, continuing");
        }
        Ok(())
    }

    /// Save and hide unstaged changes of partially staged files. True if hidden.
    fn stash_unstaged(&self, hook_name: &str, opts: &RunOptions) -> bool {
        if !hooks::uses_staged_files(hook_name) || opts.no_stash || self.settings.no_stash {
            return false;
        }
        let files = match self.repo.partially_staged_files() {
            Ok(files) => files,
            Err(err) => {
                warn!(err = %err, "could not list partially staged files");
                return false;
            }
        };
        if files.is_empty() {
            return false;
        }
        info!(count = files.len(), "stashing unstaged changes");
        if let Err(err) = self.repo.save_unstaged(&files) {
            warn!(err = %err, "could not save unstaged changes, leaving them in place");
            return false;
        }
        if let Err(err) = self.repo.hide_unstaged(&files) {
            warn!(err = %err, "could not hide unstaged changes, discarding backup");
            if let Err(err) = self.repo.drop_unstaged_stash() {
                warn!(err = %err, "could not drop backup stash");
            }
            return false;
        }
        true
    }

    fn restore_unstaged(&self) {
        if let Err(err) = self.repo.restore_unstaged() {
            warn!(err = %err, "could not restore unstaged changes, keeping backup stash");
            return;
        }
        if let Err(err) = self.repo.drop_unstaged_stash() {
            warn!(err = %err, "could not drop backup stash");
        }
    }

    fn changeset(&self) -> Option<Changeset> {
        match self.repo.changeset() {
            Ok(changeset) => Some(changeset),
            Err(err) => {
                warn!(err = %err, "could not compute changeset");
                None
            }
        }
    }
}
