//! Hook configuration stored in `hookrun.toml` at the repository root.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::types::{GlobDialect, Hook};

pub const DEFAULT_CONFIG_FILE: &str = "hookrun.toml";

/// Hookrun configuration (TOML).
///
/// Engine settings live at the top level; every other table is a hook keyed
/// by its git hook name (`[pre-commit]`, `[pre-push]`, ...).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub glob_matcher: GlobDialect,

    /// Directories (relative to the repository root) searched for
    /// `<dir>/<hook>/<script>`.
    pub source_dirs: Vec<String>,

    /// Upper bound for a single expanded command. Platform default when unset.
    pub max_command_length: Option<usize>,

    /// Never stash partially staged changes.
    pub no_stash: bool,

    #[serde(flatten)]
    pub hooks: BTreeMap<String, Hook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            glob_matcher: GlobDialect::default(),
            source_dirs: vec![".hookrun".to_string(), ".hookrun-local".to_string()],
            max_command_length: None,
            no_stash: false,
            hooks: BTreeMap::new(),
        }
    }
}

/// Settings the engine needs beyond the job tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub dialect: GlobDialect,
    pub source_dirs: Vec<String>,
    pub max_command_length: usize,
    pub no_stash: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Config::default().settings()
    }
}

/// Typical command line limit of the platform shell.
pub fn default_max_command_length() -> usize {
    if cfg!(windows) { 8191 } else { 131_072 }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_command_length == Some(0) {
            return Err(anyhow!("max_command_length must be > 0"));
        }
        if self.source_dirs.is_empty() || self.source_dirs.iter().any(|d| d.trim().is_empty()) {
            return Err(anyhow!("source_dirs must be a non-empty list of directories"));
        }
        for (name, hook) in &self.hooks {
            if hook.parallel && hook.piped {
                return Err(anyhow!("hook {name}: parallel and piped are mutually exclusive"));
            }
        }
        Ok(())
    }

    pub fn hook(&self, name: &str) -> Option<&Hook> {
        self.hooks.get(name)
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            dialect: self.glob_matcher,
            source_dirs: self.source_dirs.clone(),
            max_command_length: self
                .max_command_length
                .unwrap_or_else(default_max_command_length),
            no_stash: self.no_stash,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = parse_config(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(contents).context("parse config toml")?;
    cfg.validate()?;
    Ok(cfg)
}
