//! Git hook job runner.
//!
//! `hookrun run <hook> [git args...]` loads `hookrun.toml` from the
//! repository root and runs the jobs configured for that hook.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use hookrun::core::result::{JobResult, render_summary};
use hookrun::core::signal::CancelToken;
use hookrun::core::types::FailOnChanges;
use hookrun::exit_codes;
use hookrun::hook::{HookOutcome, RunOptions, Runner};
use hookrun::io::config::{DEFAULT_CONFIG_FILE, load_config};
use hookrun::io::executor::{CachedStdin, ShellExecutor};
use hookrun::io::git::Git;
use hookrun::io::repository::Repository;
use hookrun::logging;
use hookrun::run::NoIndicator;

#[derive(Parser)]
#[command(name = "hookrun", version, about = "Run the jobs configured for a git hook")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every job configured for a hook.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Hook name, e.g. `pre-commit`.
    hook: String,

    /// Arguments git passed to the hook.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    git_args: Vec<String>,

    /// Config file, relative to the repository root.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Run jobs even when no files match.
    #[arg(short, long)]
    force: bool,

    /// Stream job output live.
    #[arg(long)]
    follow: bool,

    /// Do not stash unstaged changes of partially staged files.
    #[arg(long)]
    no_stash: bool,

    /// Only run jobs with this name (repeatable).
    #[arg(long = "job")]
    jobs: Vec<String>,

    /// Only run jobs with this tag (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Skip jobs with this tag or name (repeatable).
    #[arg(long = "exclude-tag")]
    exclude_tags: Vec<String>,

    /// Template value for `{KEY}` placeholders, as KEY=VALUE (repeatable).
    #[arg(long = "set", value_parser = parse_template)]
    templates: Vec<(String, String)>,

    /// Override the hook's fail_on_changes: never, always or ci.
    #[arg(long, value_parser = parse_fail_on_changes)]
    fail_on_changes: Option<FailOnChanges>,

    /// Print results as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    hook: &'a str,
    results: &'a [JobResult],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let cwd = std::env::current_dir().context("current dir")?;
    let git = Git::discover(&cwd).context("locate git repository")?;
    let config = load_config(&git.root().join(&args.config))?;
    let Some(hook) = config.hook(&args.hook) else {
        info!(hook = %args.hook, "no jobs configured");
        return Ok(exit_codes::OK);
    };
    let settings = config.settings();

    let cancel = CancelToken::default();
    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("register SIGINT handler")?;

    let opts = RunOptions {
        git_args: args.git_args,
        templates: args.templates.into_iter().collect::<BTreeMap<_, _>>(),
        force: args.force,
        follow: args.follow,
        no_stash: args.no_stash,
        exclude_tags: args.exclude_tags,
        only_jobs: args.jobs,
        only_tags: args.tags,
        fail_on_changes: args.fail_on_changes,
        cancel,
        stdin: Arc::new(CachedStdin::new(std::io::stdin())),
    };
    let executor = ShellExecutor::new();
    let runner = Runner {
        repo: &git,
        executor: &executor,
        settings: &settings,
        indicator: &NoIndicator,
    };
    let outcome = runner.run_all(&args.hook, hook, &opts);
    report(&args.hook, &outcome, args.json)?;

    Ok(if outcome.failed() {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    })
}

fn report(hook: &str, outcome: &HookOutcome, json: bool) -> Result<()> {
    let error = outcome.error.as_ref().map(ToString::to_string);
    if json {
        let report = Report {
            hook,
            results: &outcome.results,
            error,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize results")?
        );
        return Ok(());
    }
    if !outcome.results.is_empty() {
        println!("{}", render_summary(&outcome.results));
    }
    if let Some(error) = error {
        eprintln!("hookrun: {error}");
    }
    Ok(())
}

fn parse_template(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(anyhow!("template key must not be empty"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_fail_on_changes(raw: &str) -> Result<FailOnChanges> {
    match raw {
        "never" => Ok(FailOnChanges::Never),
        "always" => Ok(FailOnChanges::Always),
        "ci" => Ok(FailOnChanges::Ci),
        other => Err(anyhow!("expected never, always or ci, got `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_git_args() {
        let cli = Cli::parse_from(["hookrun", "run", "pre-push", "origin", "git@host:repo"]);
        let Command::Run(args) = cli.command;
        assert_eq!(args.hook, "pre-push");
        assert_eq!(args.git_args, vec!["origin", "git@host:repo"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_run_selection_flags() {
        let cli = Cli::parse_from([
            "hookrun",
            "run",
            "--force",
            "--job",
            "lint",
            "--tag",
            "fast",
            "--set",
            "level=strict",
            "--fail-on-changes",
            "always",
            "pre-commit",
        ]);
        let Command::Run(args) = cli.command;
        assert!(args.force);
        assert_eq!(args.jobs, vec!["lint"]);
        assert_eq!(args.tags, vec!["fast"]);
        assert_eq!(
            args.templates,
            vec![("level".to_string(), "strict".to_string())]
        );
        assert_eq!(args.fail_on_changes, Some(FailOnChanges::Always));
        assert_eq!(args.hook, "pre-commit");
    }

    #[test]
    fn template_requires_key_and_equals() {
        assert!(parse_template("novalue").is_err());
        assert!(parse_template("=x").is_err());
        assert_eq!(
            parse_template("a=b=c").expect("parse"),
            ("a".to_string(), "b=c".to_string())
        );
    }
}
