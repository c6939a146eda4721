//! File filtering pipeline applied to every candidate file list.
//!
//! Stages run in a fixed order: glob include, exclude, root re-rooting, then
//! type predicates. Malformed patterns and unknown type tokens are logged and
//! ignored rather than failing the job.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use tracing::{debug, warn};

use crate::core::types::{ExcludeSpec, GlobDialect};

/// Bytes inspected when classifying text versus binary.
const SNIFF_LEN: usize = 1024;

const BOMS: [&[u8]; 5] = [
    &[0xEF, 0xBB, 0xBF],
    &[0xFE, 0xFF],
    &[0xFF, 0xFE],
    &[0x00, 0x00, 0xFE, 0xFF],
    &[0xFF, 0xFE, 0x00, 0x00],
];

/// Everything that narrows a file list for one job.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub glob: Vec<String>,
    pub exclude: ExcludeSpec,
    pub root: Option<String>,
    pub file_types: Vec<String>,
    pub dialect: GlobDialect,
}

/// Apply the full pipeline. `base` is the repository root used for stat/read.
///
/// Entries already re-rooted under `spec.root` (`./path`) are mapped back
/// first, so filtering an output again yields the same output.
pub fn apply(spec: &FilterSpec, files: Vec<String>, base: &Path) -> Vec<String> {
    let files: Vec<String> = files
        .iter()
        .map(|file| unroot(spec.root.as_deref(), file))
        .collect();
    let files = by_glob(files, &spec.glob, spec.dialect);
    let files = by_exclude(files, &spec.exclude, spec.dialect);
    let files = by_root(files, spec.root.as_deref());
    let files = by_type(files, &spec.file_types, &|file: &str| {
        base.join(unroot(spec.root.as_deref(), file))
    });
    debug!(count = files.len(), "filtered files");
    files
}

fn by_glob(files: Vec<String>, patterns: &[String], dialect: GlobDialect) -> Vec<String> {
    let Some(set) = build_globset(patterns, dialect) else {
        return files;
    };
    files.into_iter().filter(|file| set.is_match(file)).collect()
}

fn by_exclude(files: Vec<String>, exclude: &ExcludeSpec, dialect: GlobDialect) -> Vec<String> {
    match exclude {
        ExcludeSpec::NoOverride => files,
        ExcludeSpec::Globs(patterns) => {
            let Some(set) = build_globset(patterns, dialect) else {
                return files;
            };
            files.into_iter().filter(|file| !set.is_match(file)).collect()
        }
        ExcludeSpec::Pattern(pattern) => match Regex::new(pattern) {
            Ok(re) => files.into_iter().filter(|file| !re.is_match(file)).collect(),
            Err(err) => {
                warn!(pattern = %pattern, err = %err, "invalid exclude pattern, ignoring");
                files
            }
        },
    }
}

/// Case-insensitive set of the non-empty, valid patterns; `None` if there are none.
fn build_globset(patterns: &[String], dialect: GlobDialect) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0usize;
    for pattern in patterns.iter().filter(|p| !p.is_empty()) {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(dialect == GlobDialect::Doublestar)
            .build();
        match glob {
            Ok(glob) => {
                builder.add(glob);
                added += 1;
            }
            Err(err) => warn!(pattern = %pattern, err = %err, "invalid glob, ignoring"),
        }
    }
    if added == 0 {
        return None;
    }
    match builder.build() {
        Ok(set) => Some(set),
        Err(err) => {
            warn!(err = %err, "could not build glob set, ignoring");
            None
        }
    }
}

/// Keep files under `root`, rewriting the prefix to `./`.
fn by_root(files: Vec<String>, root: Option<&str>) -> Vec<String> {
    let Some(root) = root.filter(|r| !r.is_empty()) else {
        return files;
    };
    let prefix = with_trailing_slash(root);
    files
        .into_iter()
        .filter_map(|file| {
            file.strip_prefix(prefix.as_str())
                .map(|rest| format!("./{rest}"))
        })
        .collect()
}

/// Map a re-rooted `./path` back to a repository-relative path.
pub fn unroot(root: Option<&str>, file: &str) -> String {
    match (root.filter(|r| !r.is_empty()), file.strip_prefix("./")) {
        (Some(root), Some(rest)) => format!("{}{rest}", with_trailing_slash(root)),
        _ => file.to_string(),
    }
}

fn with_trailing_slash(root: &str) -> String {
    if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    }
}

/// Requested file type constraints. Flags combine with AND.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TypeMask(u8);

impl TypeMask {
    const EXECUTABLE: u8 = 1;
    const NOT_EXECUTABLE: u8 = 1 << 1;
    const SYMLINK: u8 = 1 << 2;
    const NOT_SYMLINK: u8 = 1 << 3;
    const TEXT: u8 = 1 << 4;
    const BINARY: u8 = 1 << 5;

    fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    fn needs_link_status(self) -> bool {
        self.has(Self::EXECUTABLE | Self::NOT_EXECUTABLE | Self::SYMLINK | Self::NOT_SYMLINK)
    }

    fn needs_content(self) -> bool {
        self.has(Self::TEXT | Self::BINARY)
    }
}

fn parse_types(tokens: &[String]) -> (TypeMask, Vec<String>) {
    let mut mask = TypeMask::default();
    let mut mimes = Vec::new();
    for token in tokens {
        let flag = match token.trim() {
            "executable" => TypeMask::EXECUTABLE,
            "not executable" => TypeMask::NOT_EXECUTABLE,
            "symlink" => TypeMask::SYMLINK,
            "not symlink" => TypeMask::NOT_SYMLINK,
            "text" => TypeMask::TEXT,
            "binary" => TypeMask::BINARY,
            other if other.contains('/') => {
                mimes.push(other.to_ascii_lowercase());
                continue;
            }
            other => {
                warn!(file_type = %other, "unknown file type, ignoring");
                continue;
            }
        };
        mask.0 |= flag;
    }
    (mask, mimes)
}

fn by_type(files: Vec<String>, tokens: &[String], locate: &dyn Fn(&str) -> PathBuf) -> Vec<String> {
    let (mask, mimes) = parse_types(tokens);
    if mask == TypeMask::default() && mimes.is_empty() {
        return files;
    }
    files
        .into_iter()
        .filter(|file| matches_types(&locate(file), mask, &mimes))
        .collect()
}

fn matches_types(path: &Path, mask: TypeMask, mimes: &[String]) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };

    if mask.needs_link_status() {
        let symlink = meta.file_type().is_symlink();
        let executable = is_executable(&meta);
        if mask.has(TypeMask::SYMLINK) && !symlink
            || mask.has(TypeMask::NOT_SYMLINK) && symlink
            || mask.has(TypeMask::EXECUTABLE) && !executable
            || mask.has(TypeMask::NOT_EXECUTABLE) && executable
        {
            return false;
        }
    }

    if !mask.needs_content() && mimes.is_empty() {
        return true;
    }
    if !meta.is_file() {
        return false;
    }
    let Some(text) = sniff_text(path) else {
        return false;
    };
    if mask.has(TypeMask::TEXT) && !text || mask.has(TypeMask::BINARY) && text {
        return false;
    }
    mimes.is_empty() || mime_allowed(path, text, mimes)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Read the head of `path` and classify it; `None` when unreadable.
fn sniff_text(path: &Path) -> Option<bool> {
    let file = File::open(path).ok()?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).ok()?;
    Some(is_text(&head))
}

/// Byte-order marks mean text; otherwise any control byte outside tab, newline,
/// form feed, carriage return and escape means binary.
pub fn is_text(head: &[u8]) -> bool {
    if BOMS.iter().any(|bom| head.starts_with(bom)) {
        return true;
    }
    !head
        .iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F))
}

fn mime_allowed(path: &Path, text: bool, allowed: &[String]) -> bool {
    let mime = mime_guess::from_path(path)
        .first_raw()
        .map(str::to_string)
        .unwrap_or_else(|| {
            if text {
                "text/plain".to_string()
            } else {
                "application/octet-stream".to_string()
            }
        });
    allowed.iter().any(|want| mime_matches(want, &mime))
}

fn mime_matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(kind) => mime.split('/').next() == Some(kind),
        None => pattern == mime,
    }
}
