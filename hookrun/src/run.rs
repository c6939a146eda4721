//! Recursive job tree evaluation.
//!
//! Groups fan out according to their [`Mode`]: sequential and piped children
//! run in declaration order on the calling thread, parallel children get one
//! scoped thread each. Leaf errors never escape; they become [`JobResult`]s.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::command::{self, BuildContext, BuildError, BuiltCommand};
use crate::core::hooks;
use crate::core::result::JobResult;
use crate::core::scope::Scope;
use crate::core::signal::CancelToken;
use crate::core::types::{Group, Job, Mode};
use crate::io::executor::{CachedStdin, ExecRequest, Executor};
use crate::io::filter::{self, unroot};
use crate::io::process::StdinMode;
use crate::skip::SkipChecker;

pub const BROKEN_PIPE: &str = "broken pipe";
pub const CANCELLED: &str = "cancelled";
pub const COMMAND_FAILED: &str = "command failed";
pub const EXCLUDED: &str = "excluded";
pub const NOT_SELECTED: &str = "not selected";
pub const SKIPPED_BY_CONDITION: &str = "skipped by condition";

pub const BOTH_RUN_AND_SCRIPT: &str = "both run and script are set";
pub const NOTHING_TO_RUN: &str = "no run, script or group is set";
pub const GROUP_WITH_COMMAND: &str = "group cannot be combined with run or script";
pub const EMPTY_GROUP: &str = "empty group";
pub const CONFLICTING_MODE: &str = "parallel and piped are mutually exclusive";

/// Progress display that interactive jobs suspend while they own the terminal.
pub trait Indicator: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Indicator for runs without a progress display.
#[derive(Debug, Default)]
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn pause(&self) {}
    fn resume(&self) {}
}

/// Everything leaf jobs need besides their scope.
pub struct Evaluator<'a> {
    ctx: BuildContext<'a>,
    executor: &'a dyn Executor,
    skips: &'a SkipChecker<'a>,
    exclude_tags: BTreeSet<String>,
    follow: bool,
    stdin: &'a CachedStdin,
    cancel: CancelToken,
    indicator: &'a dyn Indicator,
    /// Held by interactive jobs for the duration of their execution.
    terminal: Mutex<()>,
}

impl<'a> Evaluator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: BuildContext<'a>,
        executor: &'a dyn Executor,
        skips: &'a SkipChecker<'a>,
        exclude_tags: BTreeSet<String>,
        follow: bool,
        stdin: &'a CachedStdin,
        cancel: CancelToken,
        indicator: &'a dyn Indicator,
    ) -> Self {
        Self {
            ctx,
            executor,
            skips,
            exclude_tags,
            follow,
            stdin,
            cancel,
            indicator,
            terminal: Mutex::new(()),
        }
    }

    /// Evaluate `jobs` under `scope`, one result per job.
    ///
    /// Sequential and piped results keep declaration order. Parallel results
    /// are collected in declaration order too, though completion order is not.
    pub fn run_jobs(&self, scope: &Scope, jobs: &[Job]) -> Vec<JobResult> {
        match scope.mode {
            Mode::Sequential => jobs.iter().map(|job| self.run_job(scope, job)).collect(),
            Mode::Piped => jobs
                .iter()
                .map(|job| {
                    if scope.failed.is_set() {
                        debug!(job = %scope.display_name(job), "skipping after failure");
                        return JobResult::skip(job.display_name(), BROKEN_PIPE);
                    }
                    self.run_job(scope, job)
                })
                .collect(),
            Mode::Parallel => thread::scope(|s| {
                let handles: Vec<_> = jobs
                    .iter()
                    .map(|job| s.spawn(move || self.run_job(scope, job)))
                    .collect();
                handles
                    .into_iter()
                    .zip(jobs)
                    .map(|(handle, job)| match handle.join() {
                        Ok(result) => result,
                        Err(_) => {
                            scope.failed.set();
                            JobResult::failure(
                                job.display_name(),
                                Some("job panicked".to_string()),
                                Duration::ZERO,
                            )
                        }
                    })
                    .collect()
            }),
        }
    }

    #[instrument(skip_all, fields(job = %scope.display_name(job)))]
    fn run_job(&self, scope: &Scope, job: &Job) -> JobResult {
        let name = job.display_name();
        if self.cancel.is_cancelled() {
            return JobResult::skip(name, CANCELLED);
        }

        if let Some(text) = shape_error(job) {
            return self.fail(scope, name, text.to_string(), Duration::ZERO);
        }

        if job.tags.iter().any(|tag| self.exclude_tags.contains(tag))
            || (!job.name.is_empty() && self.exclude_tags.contains(&job.name))
        {
            info!(reason = EXCLUDED, "skip");
            return JobResult::skip(name, EXCLUDED);
        }

        if self.skips.should_skip(job.skip.as_ref(), job.only.as_ref()) {
            info!(reason = SKIPPED_BY_CONDITION, "skip");
            return JobResult::skip(name, SKIPPED_BY_CONDITION);
        }

        if let Some(group) = &job.group {
            return self.run_group(scope, job, group);
        }

        if !scope.selects_leaf(job) {
            debug!(reason = NOT_SELECTED, "skip");
            return JobResult::skip(name, NOT_SELECTED);
        }

        self.run_leaf(scope, job)
    }

    fn run_group(&self, scope: &Scope, job: &Job, group: &Group) -> JobResult {
        let name = job.display_name();
        if group.has_conflicting_mode() {
            return self.fail(scope, name, CONFLICTING_MODE.to_string(), Duration::ZERO);
        }
        if group.jobs.is_empty() {
            return self.fail(scope, name, EMPTY_GROUP.to_string(), Duration::ZERO);
        }
        let child = scope.derive(job, group);
        JobResult::group(name, self.run_jobs(&child, &group.jobs))
    }

    fn run_leaf(&self, scope: &Scope, job: &Job) -> JobResult {
        let name = job.display_name();
        let started = Instant::now();

        let built = match command::build(&self.ctx, scope, job) {
            Ok(built) => built,
            Err(BuildError::Skip(reason)) => {
                info!(reason = %reason, "skip");
                return JobResult::skip(name, reason);
            }
            Err(BuildError::Failed(err)) => {
                warn!(err = %err, "could not build command");
                return self.fail(scope, name, format!("{err:#}"), started.elapsed());
            }
        };

        let request = match self.request(scope, job, &built) {
            Ok(request) => request,
            Err(err) => return self.fail(scope, name, format!("{err:#}"), started.elapsed()),
        };

        let outcome = if job.interactive {
            let _terminal = match self.terminal.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.indicator.pause();
            let outcome = self.executor.execute(&request);
            self.indicator.resume();
            outcome
        } else {
            self.executor.execute(&request)
        };

        match outcome {
            Ok(true) => {
                if job.stage_fixed && hooks::uses_staged_files(self.ctx.hook_name) {
                    self.stage_fixed(scope, job, built.files);
                }
                JobResult::success(name, started.elapsed())
            }
            Ok(false) => {
                let text = job
                    .fail_text
                    .clone()
                    .unwrap_or_else(|| COMMAND_FAILED.to_string());
                self.fail(scope, name, text, started.elapsed())
            }
            Err(err) => {
                warn!(err = %err, "execution error");
                let text = job.fail_text.clone().unwrap_or_else(|| format!("{err:#}"));
                self.fail(scope, name, text, started.elapsed())
            }
        }
    }

    fn request(&self, scope: &Scope, job: &Job, built: &BuiltCommand) -> Result<ExecRequest> {
        let stdin = if job.interactive {
            StdinMode::Inherit
        } else if job.use_stdin {
            StdinMode::Bytes(self.stdin.bytes()?)
        } else {
            StdinMode::Null
        };
        Ok(ExecRequest {
            name: scope.display_name(job),
            commands: built.commands.clone(),
            root: self.job_root(scope, job),
            env: scope.env_for(job),
            stdin,
            interactive: job.interactive,
            follow: self.follow,
            timeout: job.timeout_secs.map(Duration::from_secs),
            cancel: self.cancel.clone(),
        })
    }

    fn job_root(&self, scope: &Scope, job: &Job) -> PathBuf {
        let root = self.ctx.repo.root();
        match job.root.as_deref().or(scope.root.as_deref()) {
            Some(sub) if !sub.is_empty() => root.join(sub),
            _ => root.to_path_buf(),
        }
    }

    /// Re-add the files a successful job may have fixed.
    fn stage_fixed(&self, scope: &Scope, job: &Job, files: Vec<String>) {
        let spec = command::filter_spec(&self.ctx, scope, job);
        let files = if files.is_empty() {
            match self.ctx.repo.staged_files() {
                Ok(staged) => filter::apply(&spec, staged, self.ctx.repo.root()),
                Err(err) => {
                    warn!(err = %err, "could not list staged files to re-stage");
                    return;
                }
            }
        } else {
            files
        };
        let files: Vec<String> = files
            .iter()
            .map(|file| unroot(spec.root.as_deref(), file))
            .collect();
        if files.is_empty() {
            return;
        }
        debug!(count = files.len(), "staging fixed files");
        if let Err(err) = self.ctx.repo.add_files(&files) {
            warn!(err = %err, "could not stage fixed files");
        }
    }

    fn fail(&self, scope: &Scope, name: &str, text: String, duration: Duration) -> JobResult {
        scope.failed.set();
        let text = (!text.is_empty()).then_some(text);
        JobResult::failure(name, text, duration)
    }
}

/// Exactly one of run, script and group must be set.
fn shape_error(job: &Job) -> Option<&'static str> {
    match (job.run.is_some(), job.script.is_some(), job.group.is_some()) {
        (true, true, _) => Some(BOTH_RUN_AND_SCRIPT),
        (false, false, false) => Some(NOTHING_TO_RUN),
        (_, _, true) if job.run.is_some() || job.script.is_some() => Some(GROUP_WITH_COMMAND),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::Status;
    use crate::core::types::Group;
    use crate::io::config::EngineSettings;
    use crate::test_support::{FakeRepository, ScriptedExecutor, group_job, run_job};
    use std::collections::BTreeMap;

    struct Harness {
        repo: FakeRepository,
        executor: ScriptedExecutor,
        settings: EngineSettings,
        templates: BTreeMap<String, String>,
        stdin: CachedStdin,
    }

    impl Harness {
        fn new(repo: FakeRepository) -> Self {
            Self {
                repo,
                executor: ScriptedExecutor::new(),
                settings: EngineSettings::default(),
                templates: BTreeMap::new(),
                stdin: CachedStdin::from_bytes(b"input".to_vec()),
            }
        }

        fn run(&self, hook: &str, scope: &Scope, jobs: &[Job]) -> Vec<JobResult> {
            let ctx = BuildContext {
                hook_name: hook,
                repo: &self.repo,
                settings: &self.settings,
                git_args: &[],
                templates: &self.templates,
                force: false,
                hook_files: None,
            };
            let skips = SkipChecker::new(&self.repo);
            let evaluator = Evaluator::new(
                ctx,
                &self.executor,
                &skips,
                BTreeSet::from(["slow".to_string()]),
                false,
                &self.stdin,
                CancelToken::default(),
                &NoIndicator,
            );
            evaluator.run_jobs(scope, jobs)
        }
    }

    #[test]
    fn invalid_shapes_fail_without_executing() {
        let harness = Harness::new(FakeRepository::new());
        let both = Job {
            script: Some("x.sh".to_string()),
            ..run_job("both", "x")
        };
        let none = Job {
            name: "none".to_string(),
            ..Job::default()
        };
        let empty = group_job("empty", Group::default());
        let scope = Scope::default();
        let results = harness.run("post-merge", &scope, &[both, none, empty]);

        let texts: Vec<_> = results.iter().map(|r| r.text.as_deref()).collect();
        assert_eq!(
            texts,
            vec![Some(BOTH_RUN_AND_SCRIPT), Some(NOTHING_TO_RUN), Some(EMPTY_GROUP)]
        );
        assert!(results.iter().all(JobResult::is_failure));
        assert!(harness.executor.requests().is_empty());
        assert!(scope.failed.is_set());
    }

    #[test]
    fn excluded_tags_and_names_skip() {
        let harness = Harness::new(FakeRepository::new());
        let tagged = Job {
            tags: vec!["slow".to_string()],
            ..run_job("a", "a")
        };
        let named = run_job("slow", "b");
        let results = harness.run("post-merge", &Scope::default(), &[tagged, named]);
        assert!(results.iter().all(|r| r.text.as_deref() == Some(EXCLUDED)));
        assert!(harness.executor.requests().is_empty());
    }

    #[test]
    fn executor_failure_uses_fail_text_and_sets_flag() {
        let harness = Harness::new(FakeRepository::new());
        harness.executor.fail("lint");
        let job = Job {
            fail_text: Some("run make fmt".to_string()),
            ..run_job("lint", "make lint")
        };
        let scope = Scope::default();
        let results = harness.run("post-merge", &scope, &[job]);
        assert_eq!(results[0].status, Status::Failure);
        assert_eq!(results[0].text.as_deref(), Some("run make fmt"));
        assert!(scope.failed.is_set());
    }

    #[test]
    fn failure_without_fail_text_still_explains_itself() {
        let harness = Harness::new(FakeRepository::new());
        harness.executor.fail("lint");
        let job = run_job("lint", "make lint");
        let results = harness.run("post-merge", &Scope::default(), &[job]);
        assert_eq!(results[0].status, Status::Failure);
        assert_eq!(results[0].text.as_deref(), Some(COMMAND_FAILED));
    }

    #[test]
    fn request_carries_env_root_stdin_and_timeout() {
        let harness = Harness::new(FakeRepository::new().with_root("/repo"));
        let job = Job {
            root: Some("api".to_string()),
            use_stdin: true,
            timeout_secs: Some(5),
            env: BTreeMap::from([("B".to_string(), "job".to_string())]),
            ..run_job("gen", "make gen")
        };
        let scope = Scope {
            env: BTreeMap::from([("A".to_string(), "scope".to_string())]),
            names: vec!["outer".to_string()],
            ..Scope::default()
        };
        harness.run("post-checkout", &scope, &[job]);

        let requests = harness.executor.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.name, "outer > gen");
        assert_eq!(request.root, PathBuf::from("/repo/api"));
        assert_eq!(request.env["A"], "scope");
        assert_eq!(request.env["B"], "job");
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        match &request.stdin {
            StdinMode::Bytes(bytes) => assert_eq!(bytes.as_slice(), b"input"),
            other => panic!("unexpected stdin {other:?}"),
        }
    }

    #[test]
    fn interactive_jobs_get_the_terminal() {
        let harness = Harness::new(FakeRepository::new());
        let job = Job {
            interactive: true,
            ..run_job("ask", "read answer")
        };
        harness.run("post-merge", &Scope::default(), &[job]);
        let requests = harness.executor.requests();
        assert!(requests[0].interactive);
        assert!(matches!(requests[0].stdin, StdinMode::Inherit));
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let harness = Harness::new(FakeRepository::new());
        let ctx = BuildContext {
            hook_name: "post-merge",
            repo: &harness.repo,
            settings: &harness.settings,
            git_args: &[],
            templates: &harness.templates,
            force: false,
            hook_files: None,
        };
        let skips = SkipChecker::new(&harness.repo);
        let cancel = CancelToken::default();
        cancel.cancel();
        let evaluator = Evaluator::new(
            ctx,
            &harness.executor,
            &skips,
            BTreeSet::new(),
            false,
            &harness.stdin,
            cancel,
            &NoIndicator,
        );
        let results = evaluator.run_jobs(&Scope::default(), &[run_job("a", "a")]);
        assert_eq!(results[0].text.as_deref(), Some(CANCELLED));
        assert!(harness.executor.requests().is_empty());
    }
}
