//! Turns a leaf job into concrete shell commands.
//!
//! `run` jobs are expanded through the [`Replacer`] with file lists narrowed
//! by the job's filters; `script` jobs resolve to one invocation per source
//! directory containing the script.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::hooks;
use crate::core::replacer::{FileSource, Replacer, shell_escape};
use crate::core::scope::Scope;
use crate::core::types::Job;
use crate::io::config::EngineSettings;
use crate::io::filter::{self, FilterSpec};
use crate::io::repository::Repository;

pub const NO_FILES_FOR_INSPECTION: &str = "no files for inspection";
pub const NO_MATCHING_STAGED_FILES: &str = "no matching staged files";
pub const NO_MATCHING_PUSH_FILES: &str = "no matching push files";

/// Why a job produced no commands.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Deliberate non-execution; the job becomes a Skip result.
    #[error("{0}")]
    Skip(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Hook-wide inputs shared by every job of one run.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub hook_name: &'a str,
    pub repo: &'a dyn Repository,
    pub settings: &'a EngineSettings,
    pub git_args: &'a [String],
    /// Caller-supplied `{name}` values.
    pub templates: &'a BTreeMap<String, String>,
    /// Bypass the "no files" skip checks.
    pub force: bool,
    /// Hook-level files command, used when a job has none.
    pub hook_files: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltCommand {
    pub commands: Vec<String>,
    /// Files referenced by the commands, repository-relative unless re-rooted.
    pub files: Vec<String>,
}

/// Build the commands for a `run` or `script` leaf job.
#[instrument(skip_all, fields(job = %job.display_name()))]
pub fn build(ctx: &BuildContext<'_>, scope: &Scope, job: &Job) -> Result<BuiltCommand, BuildError> {
    match (&job.run, &job.script) {
        (Some(run), None) => build_run(ctx, scope, job, run),
        (None, Some(script)) => build_script(ctx, job, script),
        (Some(_), Some(_)) => Err(anyhow!("both run and script are set").into()),
        (None, None) => Err(anyhow!("no run or script is set").into()),
    }
}

/// Filters for `job` inside `scope`.
pub fn filter_spec(ctx: &BuildContext<'_>, scope: &Scope, job: &Job) -> FilterSpec {
    let mut glob = scope.glob.clone();
    glob.extend(job.glob.iter().cloned());
    FilterSpec {
        glob,
        exclude: scope.exclude.merged_with(&job.exclude),
        root: job.root.clone().or_else(|| scope.root.clone()),
        file_types: job.file_types.clone(),
        dialect: ctx.settings.dialect,
    }
}

fn build_run(
    ctx: &BuildContext<'_>,
    scope: &Scope,
    job: &Job,
    run: &str,
) -> Result<BuiltCommand, BuildError> {
    let files_command = job.files.as_deref().or(ctx.hook_files);
    validate_run(ctx.hook_name, run, files_command)?;

    let spec = filter_spec(ctx, scope, job);
    let mut replacer = Replacer::new(templates(ctx, job));
    let resolve = |source| resolve_source(ctx, &spec, files_command, source);

    replacer.discover(run, resolve)?;

    if let Some(command) = files_command
        && !run.contains(FileSource::Files.token())
        && !ctx.force
    {
        let files = filter::apply(
            &spec,
            ctx.repo.files_by_command(command, spec.root.as_deref())?,
            ctx.repo.root(),
        );
        if files.is_empty() {
            return Err(BuildError::Skip(NO_FILES_FOR_INSPECTION.to_string()));
        }
        replacer.insert_files(FileSource::Files, files);
    }

    let expansion = replacer.expand(run, ctx.settings.max_command_length);
    debug!(
        commands = expansion.commands.len(),
        files = expansion.files.len(),
        "expanded run"
    );

    if expansion.files.is_empty() && !ctx.force {
        for (applies, source, reason) in [
            (
                hooks::uses_staged_files(ctx.hook_name),
                FileSource::Staged,
                NO_MATCHING_STAGED_FILES,
            ),
            (
                hooks::uses_push_files(ctx.hook_name),
                FileSource::Push,
                NO_MATCHING_PUSH_FILES,
            ),
        ] {
            if !applies {
                continue;
            }
            let files = match replacer.resolved(source) {
                Some(files) => files.to_vec(),
                None => resolve_source(ctx, &spec, files_command, source)?,
            };
            if files.is_empty() {
                return Err(BuildError::Skip(reason.to_string()));
            }
        }
    }

    Ok(BuiltCommand {
        commands: expansion.commands,
        files: expansion.files,
    })
}

/// `{files}` needs a files command unless the hook has a natural file set.
fn validate_run(hook_name: &str, run: &str, files_command: Option<&str>) -> anyhow::Result<()> {
    if run.trim().is_empty() {
        return Err(anyhow!("run command is empty"));
    }
    if run.contains(FileSource::Files.token())
        && files_command.is_none()
        && default_source(hook_name).is_none()
    {
        return Err(anyhow!(
            "{} requires a files command for hook {hook_name}",
            FileSource::Files.token()
        ));
    }
    Ok(())
}

fn default_source(hook_name: &str) -> Option<FileSource> {
    if hooks::uses_staged_files(hook_name) {
        Some(FileSource::Staged)
    } else if hooks::uses_push_files(hook_name) {
        Some(FileSource::Push)
    } else {
        None
    }
}

fn templates(ctx: &BuildContext<'_>, job: &Job) -> BTreeMap<String, String> {
    let mut templates = ctx.templates.clone();
    templates.insert("0".to_string(), ctx.git_args.join(" "));
    for (index, arg) in ctx.git_args.iter().enumerate() {
        templates.insert((index + 1).to_string(), arg.clone());
    }
    templates.insert("job_name".to_string(), job.display_name().to_string());
    templates
}

fn resolve_source(
    ctx: &BuildContext<'_>,
    spec: &FilterSpec,
    files_command: Option<&str>,
    source: FileSource,
) -> anyhow::Result<Vec<String>> {
    let repo = ctx.repo;
    let files = match source {
        FileSource::Staged => repo.staged_files()?,
        FileSource::StagedWithDeleted => repo.staged_files_with_deleted()?,
        FileSource::Push => repo.push_files()?,
        FileSource::All => repo.all_files()?,
        FileSource::Files => match (files_command, default_source(ctx.hook_name)) {
            (Some(command), _) => repo.files_by_command(command, spec.root.as_deref())?,
            (None, Some(fallback)) => return resolve_source(ctx, spec, None, fallback),
            (None, None) => return Err(anyhow!("no files command configured")),
        },
    };
    Ok(filter::apply(spec, files, repo.root()))
}

fn build_script(
    ctx: &BuildContext<'_>,
    job: &Job,
    script: &str,
) -> Result<BuiltCommand, BuildError> {
    let mut commands = Vec::new();
    for dir in &ctx.settings.source_dirs {
        let path = ctx.repo.root().join(dir).join(ctx.hook_name).join(script);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("stat {}", path.display()))
                    .into());
            }
        };
        if !meta.is_file() {
            return Err(BuildError::Skip(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        ensure_executable(&path, &meta)?;

        let mut parts = Vec::new();
        if let Some(runner) = job.runner.as_deref().filter(|r| !r.trim().is_empty()) {
            parts.push(runner.to_string());
        }
        parts.push(shell_escape(&path.to_string_lossy()));
        parts.extend(ctx.git_args.iter().map(|arg| shell_escape(arg)));
        commands.push(parts.join(" "));
    }

    if commands.is_empty() {
        return Err(anyhow!("script does not exist: {script}").into());
    }
    Ok(BuiltCommand {
        commands,
        files: Vec::new(),
    })
}

#[cfg(unix)]
fn ensure_executable(path: &Path, meta: &fs::Metadata) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = meta.permissions();
    if perms.mode() & 0o111 != 0 {
        return Ok(());
    }
    debug!(path = %path.display(), "making script executable");
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path, _meta: &fs::Metadata) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExcludeSpec;
    use crate::test_support::{FakeRepository, run_job, script_job};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        repo: FakeRepository,
        settings: EngineSettings,
        git_args: Vec<String>,
        templates: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new(repo: FakeRepository) -> Self {
            Self {
                repo,
                settings: EngineSettings::default(),
                git_args: Vec::new(),
                templates: BTreeMap::new(),
            }
        }

        fn ctx<'a>(&'a self, hook_name: &'a str) -> BuildContext<'a> {
            BuildContext {
                hook_name,
                repo: &self.repo,
                settings: &self.settings,
                git_args: &self.git_args,
                templates: &self.templates,
                force: false,
                hook_files: None,
            }
        }
    }

    fn skip_reason(result: Result<BuiltCommand, BuildError>) -> String {
        match result {
            Err(BuildError::Skip(reason)) => reason,
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn run_substitutes_filtered_staged_files() {
        let fixture = Fixture::new(FakeRepository::new().with_staged(&["a.rb", "b.txt"]));
        let job = Job {
            glob: strings(&["*.rb"]),
            ..run_job("lint", "lint {staged_files}")
        };
        let built = build(&fixture.ctx("pre-commit"), &Scope::default(), &job).expect("build");
        assert_eq!(built.commands, vec!["lint a.rb"]);
        assert_eq!(built.files, vec!["a.rb"]);
    }

    #[test]
    fn run_skips_without_matching_staged_files() {
        let fixture = Fixture::new(FakeRepository::new().with_staged(&["b.txt"]));
        let job = Job {
            glob: strings(&["*.rb"]),
            ..run_job("lint", "lint {staged_files}")
        };
        let reason = skip_reason(build(&fixture.ctx("pre-commit"), &Scope::default(), &job));
        assert_eq!(reason, NO_MATCHING_STAGED_FILES);
    }

    #[test]
    fn plain_command_skips_on_push_hook_without_push_files() {
        let fixture = Fixture::new(FakeRepository::new());
        let job = run_job("test", "cargo test");
        let reason = skip_reason(build(&fixture.ctx("pre-push"), &Scope::default(), &job));
        assert_eq!(reason, NO_MATCHING_PUSH_FILES);
    }

    #[test]
    fn force_bypasses_no_file_skip() {
        let fixture = Fixture::new(FakeRepository::new());
        let ctx = BuildContext {
            force: true,
            ..fixture.ctx("pre-commit")
        };
        let built = build(&ctx, &Scope::default(), &run_job("lint", "lint {staged_files}"))
            .expect("build");
        assert_eq!(built.commands, vec!["lint "]);
    }

    #[test]
    fn other_hooks_run_plain_commands() {
        let fixture = Fixture::new(FakeRepository::new());
        let built = build(
            &fixture.ctx("post-checkout"),
            &Scope::default(),
            &run_job("deps", "make deps"),
        )
        .expect("build");
        assert_eq!(built.commands, vec!["make deps"]);
        assert!(built.files.is_empty());
    }

    #[test]
    fn scope_filters_and_root_apply() {
        let fixture = Fixture::new(
            FakeRepository::new().with_staged(&["api/a.rb", "api/vendor/b.rb", "web/c.rb"]),
        );
        let scope = Scope {
            glob: strings(&["*.rb"]),
            exclude: ExcludeSpec::Globs(strings(&["*vendor*"])),
            root: Some("api".to_string()),
            ..Scope::default()
        };
        let built = build(
            &fixture.ctx("pre-commit"),
            &scope,
            &run_job("lint", "lint {staged_files}"),
        )
        .expect("build");
        assert_eq!(built.commands, vec!["lint ./a.rb"]);
    }

    #[test]
    fn git_args_and_job_name_templates() {
        let mut fixture = Fixture::new(FakeRepository::new());
        fixture.git_args = strings(&["origin", "git@host:repo"]);
        fixture
            .templates
            .insert("level".to_string(), "strict".to_string());
        let job = run_job("check", "check {job_name} {1} {2} --all={0} --level={level}");
        let built = build(&fixture.ctx("post-merge"), &Scope::default(), &job).expect("build");
        assert_eq!(
            built.commands,
            vec!["check check origin git@host:repo --all=origin git@host:repo --level=strict"]
        );
    }

    #[test]
    fn files_command_feeds_files_placeholder() {
        let fixture =
            Fixture::new(FakeRepository::new().with_command_files("git ls-files", &["x.rb", "y.md"]));
        let job = Job {
            files: Some("git ls-files".to_string()),
            glob: strings(&["*.rb"]),
            ..run_job("lint", "lint {files}")
        };
        let built = build(&fixture.ctx("post-checkout"), &Scope::default(), &job).expect("build");
        assert_eq!(built.commands, vec!["lint x.rb"]);
    }

    #[test]
    fn files_command_output_is_relative_to_job_root() {
        let fixture = Fixture::new(FakeRepository::new().with_command_files("list", &["a.rb"]));
        let job = Job {
            files: Some("list".to_string()),
            root: Some("api".to_string()),
            stage_fixed: true,
            ..run_job("lint", "lint {files}")
        };
        let built = build(&fixture.ctx("post-checkout"), &Scope::default(), &job).expect("build");
        assert_eq!(built.commands, vec!["lint ./a.rb"]);
        assert_eq!(built.files, vec!["./a.rb"]);
    }

    #[test]
    fn unreferenced_files_command_skips_when_empty() {
        let fixture = Fixture::new(FakeRepository::new().with_command_files("list", &["y.md"]));
        let job = Job {
            files: Some("list".to_string()),
            glob: strings(&["*.rb"]),
            ..run_job("lint", "lint")
        };
        let reason = skip_reason(build(&fixture.ctx("post-checkout"), &Scope::default(), &job));
        assert_eq!(reason, NO_FILES_FOR_INSPECTION);
    }

    #[test]
    fn files_placeholder_defaults_to_staged_files() {
        let fixture = Fixture::new(FakeRepository::new().with_staged(&["a.rb"]));
        let built = build(
            &fixture.ctx("pre-commit"),
            &Scope::default(),
            &run_job("lint", "lint {files}"),
        )
        .expect("build");
        assert_eq!(built.commands, vec!["lint a.rb"]);
    }

    #[test]
    fn files_placeholder_without_source_fails() {
        let fixture = Fixture::new(FakeRepository::new());
        let result = build(
            &fixture.ctx("post-merge"),
            &Scope::default(),
            &run_job("lint", "lint {files}"),
        );
        assert!(matches!(result, Err(BuildError::Failed(_))));
    }

    #[test]
    fn missing_script_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(FakeRepository::new().with_root(temp.path()));
        let result = build(
            &fixture.ctx("pre-commit"),
            &Scope::default(),
            &script_job("check", "check.sh"),
        );
        match result {
            Err(BuildError::Failed(err)) => {
                assert!(err.to_string().contains("script does not exist"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn script_directory_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".hookrun/pre-commit/check.sh")).expect("mkdir");
        let fixture = Fixture::new(FakeRepository::new().with_root(temp.path()));
        let result = build(
            &fixture.ctx("pre-commit"),
            &Scope::default(),
            &script_job("check", "check.sh"),
        );
        assert!(matches!(result, Err(BuildError::Skip(_))));
    }

    #[cfg(unix)]
    #[test]
    fn script_in_every_source_dir_is_invoked_and_made_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        for dir in [".hookrun", ".hookrun-local"] {
            let hook_dir = temp.path().join(dir).join("pre-push");
            fs::create_dir_all(&hook_dir).expect("mkdir");
            fs::write(hook_dir.join("check.sh"), "#!/bin/sh\n").expect("write");
        }
        let mut fixture = Fixture::new(FakeRepository::new().with_root(temp.path()));
        fixture.git_args = strings(&["origin"]);
        let job = Job {
            runner: Some("bash".to_string()),
            ..script_job("check", "check.sh")
        };
        let built = build(&fixture.ctx("pre-push"), &Scope::default(), &job).expect("build");

        assert_eq!(built.commands.len(), 2);
        let first = temp.path().join(".hookrun/pre-push/check.sh");
        assert_eq!(
            built.commands[0],
            format!("bash {} origin", shell_escape(&first.to_string_lossy()))
        );
        let mode = fs::metadata(&first).expect("stat").permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
