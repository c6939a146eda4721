//! Git adapter backing the [`Repository`] trait.
//!
//! Every operation is a `git` subprocess run from the repository root, so the
//! engine sees exactly what the user's git would.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::io::process::shell_command;
use crate::io::repository::{Changeset, RepoState, Repository};

const STASH_MESSAGE: &str = "hookrun auto backup";
const UNSTAGED_PATCH: &str = "hookrun-unstaged.patch";
const DELETED: &str = "deleted";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    /// Staged and unstaged modifications on the same path.
    fn is_partially_staged(&self) -> bool {
        let mut code = self.code.chars();
        let (Some(index), Some(worktree)) = (code.next(), code.next()) else {
            return false;
        };
        !matches!(index, ' ' | '?') && !matches!(worktree, ' ' | '?')
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Locate the repository containing `dir`.
    pub fn discover(dir: &Path) -> Result<Self> {
        let at = Self::new(dir);
        let top = at.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(Self::new(top.trim()))
    }

    /// Current branch name, `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            debug!("detached HEAD");
            return Ok(None);
        }
        Ok(Some(name))
    }

    /// Get status entries (including untracked) in NUL-separated porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_status_z(&out)
    }

    fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-dir"])?;
        Ok(self.workdir.join(out.trim()))
    }

    fn patch_path(&self) -> Result<PathBuf> {
        Ok(self.git_dir()?.join("info").join(UNSTAGED_PATCH))
    }

    /// Paths from a `-z` listing command.
    fn name_only(&self, args: &[&str]) -> Result<Vec<String>> {
        let out = self.run_capture(args)?;
        Ok(split_nul(&out))
    }

    fn ref_exists(&self, name: &str) -> Result<bool> {
        let status = self.run(&["rev-parse", "-q", "--verify", name])?.status;
        Ok(status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn run_with_paths(&self, args: &[&str], paths: &[String]) -> Result<Output> {
        let mut all: Vec<&str> = args.to_vec();
        all.push("--");
        all.extend(paths.iter().map(String::as_str));
        self.run_checked(&all)
    }
}

impl Repository for Git {
    fn root(&self) -> &Path {
        &self.workdir
    }

    fn staged_files(&self) -> Result<Vec<String>> {
        self.name_only(&["diff", "-z", "--name-only", "--cached", "--diff-filter=ACMR"])
    }

    fn staged_files_with_deleted(&self) -> Result<Vec<String>> {
        self.name_only(&["diff", "-z", "--name-only", "--cached", "--diff-filter=ACMRD"])
    }

    fn push_files(&self) -> Result<Vec<String>> {
        for upstream in ["@{push}", "@{upstream}"] {
            match self.name_only(&["diff", "-z", "--name-only", "HEAD", upstream]) {
                Ok(files) => return Ok(files),
                Err(err) => debug!(upstream, err = %err, "no push target"),
            }
        }
        Ok(Vec::new())
    }

    fn all_files(&self) -> Result<Vec<String>> {
        self.name_only(&["ls-files", "-z", "--cached"])
    }

    #[instrument(skip_all, fields(command, root))]
    fn files_by_command(&self, command: &str, root: Option<&str>) -> Result<Vec<String>> {
        let root = root.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty());
        let dir = match root {
            Some(root) => self.workdir.join(root),
            None => self.workdir.clone(),
        };
        let output = shell_command(command)?
            .current_dir(&dir)
            .output()
            .with_context(|| format!("spawn files command `{command}`"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("files command `{command}` failed: {}", stderr.trim()));
        }
        Ok(split_lines(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|file| {
                let file = file.strip_prefix("./").unwrap_or(&file).to_string();
                match root {
                    Some(root) => format!("{root}/{file}"),
                    None => file,
                }
            })
            .filter(|file| {
                fs::symlink_metadata(self.workdir.join(file))
                    .map(|meta| !meta.is_dir())
                    .unwrap_or(false)
            })
            .collect())
    }

    fn partially_staged_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(StatusEntry::is_partially_staged)
            .map(|entry| entry.path)
            .collect())
    }

    #[instrument(skip_all, fields(count = files.len()))]
    fn save_unstaged(&self, files: &[String]) -> Result<()> {
        let patch = self.run_with_paths(
            &[
                "diff",
                "--binary",
                "--unified=0",
                "--no-color",
                "--no-ext-diff",
                "--patch",
            ],
            files,
        )?;
        let path = self.patch_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, &patch.stdout).with_context(|| format!("write {}", path.display()))?;

        let hash = self.run_capture(&["stash", "create"])?;
        let hash = hash.trim();
        if hash.is_empty() {
            return Ok(());
        }
        self.run_checked(&["stash", "store", "--quiet", "--message", STASH_MESSAGE, hash])?;
        Ok(())
    }

    fn hide_unstaged(&self, files: &[String]) -> Result<()> {
        self.run_with_paths(&["checkout", "--force"], files)?;
        Ok(())
    }

    fn restore_unstaged(&self) -> Result<()> {
        let path = self.patch_path()?;
        if !path.exists() {
            return Ok(());
        }
        let path_arg = path.to_string_lossy().to_string();
        self.run_checked(&[
            "apply",
            "-v",
            "--whitespace=nowarn",
            "--recount",
            "--unidiff-zero",
            &path_arg,
        ])?;
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(())
    }

    fn drop_unstaged_stash(&self) -> Result<()> {
        let patch = self.patch_path()?;
        if patch.exists() {
            fs::remove_file(&patch).with_context(|| format!("remove {}", patch.display()))?;
        }
        let list = self.run_capture(&["stash", "list"])?;
        let Some(stash_ref) = list
            .lines()
            .find(|line| line.contains(STASH_MESSAGE))
            .and_then(|line| line.split(':').next())
        else {
            return Ok(());
        };
        self.run_checked(&["stash", "drop", "--quiet", stash_ref])?;
        Ok(())
    }

    fn changeset(&self) -> Result<Changeset> {
        let mut changeset = Changeset::new();
        for entry in self.status_porcelain()? {
            let path = self.workdir.join(&entry.path);
            let fingerprint = match fs::read(&path) {
                Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
                Err(_) if !path.exists() => DELETED.to_string(),
                Err(err) => {
                    return Err(err).with_context(|| format!("read {}", path.display()));
                }
            };
            changeset.insert(entry.path, fingerprint);
        }
        Ok(changeset)
    }

    fn add_files(&self, files: &[String]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.run_with_paths(&["add"], files)?;
        Ok(())
    }

    fn state(&self) -> Result<RepoState> {
        let git_dir = self.git_dir()?;
        Ok(RepoState {
            branch: self.current_branch()?,
            merging: git_dir.join("MERGE_HEAD").exists(),
            rebasing: git_dir.join("rebase-merge").exists()
                || git_dir.join("rebase-apply").exists(),
            merge_commit: self.ref_exists("HEAD^2")?,
        })
    }

    fn command_succeeds(&self, command: &str) -> Result<bool> {
        let status = shell_command(command)?
            .current_dir(&self.workdir)
            .status()
            .with_context(|| format!("spawn `{command}`"))?;
        Ok(status.success())
    }

    fn lfs_available(&self) -> bool {
        match which::which("git-lfs") {
            Ok(path) => {
                debug!(path = %path.display(), "found git-lfs");
                true
            }
            Err(err) => {
                warn!(err = %err, "git-lfs not found");
                false
            }
        }
    }
}

fn split_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_nul(out: &str) -> Vec<String> {
    out.split('\0')
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `git status --porcelain=v1 -z`: `XY path` records separated by NUL.
/// Renames and copies carry the original path as an extra record.
fn parse_status_z(out: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    let mut records = out.split('\0').filter(|record| !record.is_empty());
    while let Some(record) = records.next() {
        let (Some(code), Some(path)) = (record.get(..2), record.get(3..)) else {
            return Err(anyhow!("unexpected porcelain record: '{record}'"));
        };
        if code.starts_with(['R', 'C']) {
            records.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}
