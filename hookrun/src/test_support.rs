//! Test-only collaborators and builders.
//!
//! [`FakeRepository`] and [`ScriptedExecutor`] stand in for git and the
//! shell; [`TestRepo`] is a real repository in a temp directory for tests
//! that exercise [`crate::io::git::Git`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::types::{Group, Job};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::repository::{Changeset, RepoState, Repository};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// In-memory repository with canned file lists that records every call.
#[derive(Debug)]
pub struct FakeRepository {
    root: PathBuf,
    staged: Vec<String>,
    staged_with_deleted: Option<Vec<String>>,
    push: Vec<String>,
    all: Vec<String>,
    command_files: BTreeMap<String, Vec<String>>,
    command_status: BTreeMap<String, bool>,
    partially_staged: Vec<String>,
    state: RepoState,
    lfs: bool,
    fail_save: bool,
    fail_hide: bool,
    changesets: Mutex<VecDeque<Changeset>>,
    calls: Mutex<Vec<String>>,
    added: Mutex<Vec<String>>,
}

impl Default for FakeRepository {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            staged: Vec::new(),
            staged_with_deleted: None,
            push: Vec::new(),
            all: Vec::new(),
            command_files: BTreeMap::new(),
            command_status: BTreeMap::new(),
            partially_staged: Vec::new(),
            state: RepoState::default(),
            lfs: false,
            fail_save: false,
            fail_hide: false,
            changesets: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_staged(mut self, files: &[&str]) -> Self {
        self.staged = strings(files);
        self
    }

    pub fn with_staged_with_deleted(mut self, files: &[&str]) -> Self {
        self.staged_with_deleted = Some(strings(files));
        self
    }

    pub fn with_push(mut self, files: &[&str]) -> Self {
        self.push = strings(files);
        self
    }

    pub fn with_all(mut self, files: &[&str]) -> Self {
        self.all = strings(files);
        self
    }

    pub fn with_command_files(mut self, command: &str, files: &[&str]) -> Self {
        self.command_files.insert(command.to_string(), strings(files));
        self
    }

    pub fn with_command_status(mut self, command: &str, success: bool) -> Self {
        self.command_status.insert(command.to_string(), success);
        self
    }

    pub fn with_partially_staged(mut self, files: &[&str]) -> Self {
        self.partially_staged = strings(files);
        self
    }

    pub fn with_state(mut self, state: RepoState) -> Self {
        self.state = state;
        self
    }

    pub fn with_lfs(mut self, available: bool) -> Self {
        self.lfs = available;
        self
    }

    pub fn failing_save(mut self) -> Self {
        self.fail_save = true;
        self
    }

    pub fn failing_hide(mut self) -> Self {
        self.fail_hide = true;
        self
    }

    /// Changesets returned by successive `changeset` calls; empty afterwards.
    pub fn with_changesets(self, changesets: Vec<Changeset>) -> Self {
        *self.changesets.lock().expect("changesets lock") = changesets.into();
        self
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls().iter().filter(|call| *call == name).count()
    }

    /// Files passed to `add_files`, across all calls.
    pub fn added(&self) -> Vec<String> {
        self.added.lock().expect("added lock").clone()
    }

    fn record(&self, name: &str) {
        self.calls.lock().expect("calls lock").push(name.to_string());
    }
}

impl Repository for FakeRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn staged_files(&self) -> Result<Vec<String>> {
        self.record("staged_files");
        Ok(self.staged.clone())
    }

    fn staged_files_with_deleted(&self) -> Result<Vec<String>> {
        self.record("staged_files_with_deleted");
        Ok(self
            .staged_with_deleted
            .clone()
            .unwrap_or_else(|| self.staged.clone()))
    }

    fn push_files(&self) -> Result<Vec<String>> {
        self.record("push_files");
        Ok(self.push.clone())
    }

    fn all_files(&self) -> Result<Vec<String>> {
        self.record("all_files");
        Ok(self.all.clone())
    }

    /// Canned output is relative to `root`, like a command run inside it.
    fn files_by_command(&self, command: &str, root: Option<&str>) -> Result<Vec<String>> {
        self.record("files_by_command");
        let files = self
            .command_files
            .get(command)
            .ok_or_else(|| anyhow!("unknown files command `{command}`"))?;
        let root = root.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty());
        Ok(files
            .iter()
            .map(|file| match root {
                Some(root) => format!("{root}/{file}"),
                None => file.clone(),
            })
            .collect())
    }

    fn partially_staged_files(&self) -> Result<Vec<String>> {
        self.record("partially_staged_files");
        Ok(self.partially_staged.clone())
    }

    fn save_unstaged(&self, _files: &[String]) -> Result<()> {
        self.record("save_unstaged");
        if self.fail_save {
            return Err(anyhow!("save failed"));
        }
        Ok(())
    }

    fn hide_unstaged(&self, _files: &[String]) -> Result<()> {
        self.record("hide_unstaged");
        if self.fail_hide {
            return Err(anyhow!("hide failed"));
        }
        Ok(())
    }

    fn restore_unstaged(&self) -> Result<()> {
        self.record("restore_unstaged");
        Ok(())
    }

    fn drop_unstaged_stash(&self) -> Result<()> {
        self.record("drop_unstaged_stash");
        Ok(())
    }

    fn changeset(&self) -> Result<Changeset> {
        self.record("changeset");
        Ok(self
            .changesets
            .lock()
            .expect("changesets lock")
            .pop_front()
            .unwrap_or_default())
    }

    fn add_files(&self, files: &[String]) -> Result<()> {
        self.record("add_files");
        self.added
            .lock()
            .expect("added lock")
            .extend(files.iter().cloned());
        Ok(())
    }

    fn state(&self) -> Result<RepoState> {
        self.record("state");
        Ok(self.state.clone())
    }

    fn command_succeeds(&self, command: &str) -> Result<bool> {
        self.record("command_succeeds");
        Ok(self.command_status.get(command).copied().unwrap_or(false))
    }

    fn lfs_available(&self) -> bool {
        self.lfs
    }
}

/// Executor returning scripted outcomes keyed by job name.
///
/// Jobs are matched by the last segment of the request name, so nested jobs
/// are addressed by their own name. Unscripted jobs succeed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failing: Mutex<BTreeSet<String>>,
    erroring: Mutex<BTreeSet<String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
    requests: Mutex<Vec<ExecRequest>>,
    /// Executions running right now, and the maximum seen.
    running: Mutex<(usize, usize)>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Ok(false)` for this job.
    pub fn fail(&self, name: &str) {
        self.failing.lock().expect("lock").insert(name.to_string());
    }

    /// Report `Err` for this job.
    pub fn error(&self, name: &str) {
        self.erroring.lock().expect("lock").insert(name.to_string());
    }

    pub fn delay(&self, name: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("lock")
            .insert(name.to_string(), delay);
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().expect("lock").clone()
    }

    /// Leaf names of executed jobs, in start order.
    pub fn executed(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|request| leaf_name(&request.name).to_string())
            .collect()
    }

    /// Highest number of jobs that were executing at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.running.lock().expect("lock").1
    }
}

fn leaf_name(name: &str) -> &str {
    name.rsplit(" > ").next().unwrap_or(name)
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<bool> {
        let name = leaf_name(&request.name).to_string();
        self.requests.lock().expect("lock").push(request.clone());
        {
            let mut running = self.running.lock().expect("lock");
            running.0 += 1;
            running.1 = running.1.max(running.0);
        }
        let delay = self.delays.lock().expect("lock").get(&name).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.running.lock().expect("lock").0 -= 1;

        if self.erroring.lock().expect("lock").contains(&name) {
            return Err(anyhow!("spawn {name}: scripted error"));
        }
        Ok(!self.failing.lock().expect("lock").contains(&name))
    }
}

/// Real git repository in a temp directory, on branch `main`.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "hookrun@example.com"])?;
        repo.git(&["config", "user.name", "hookrun"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }
}

pub fn run_job(name: &str, run: &str) -> Job {
    Job {
        name: name.to_string(),
        run: Some(run.to_string()),
        ..Job::default()
    }
}

pub fn script_job(name: &str, script: &str) -> Job {
    Job {
        name: name.to_string(),
        script: Some(script.to_string()),
        ..Job::default()
    }
}

pub fn group_job(name: &str, group: Group) -> Job {
    Job {
        name: name.to_string(),
        group: Some(group),
        ..Job::default()
    }
}

pub fn sequential(jobs: Vec<Job>) -> Group {
    Group {
        jobs,
        ..Group::default()
    }
}

pub fn parallel(jobs: Vec<Job>) -> Group {
    Group {
        parallel: Some(true),
        jobs,
        ..Group::default()
    }
}

pub fn piped(jobs: Vec<Job>) -> Group {
    Group {
        piped: Some(true),
        jobs,
        ..Group::default()
    }
}
