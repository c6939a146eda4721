//! Placeholder substitution with command-length bounded chunking.
//!
//! A command such as `rubocop {staged_files}` is expanded into one or more
//! concrete commands. File lists are split across commands so each stays
//! within the caller's maximum length, and every file appears exactly once.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

/// Closed set of file lists a command can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileSource {
    Staged,
    StagedWithDeleted,
    Push,
    All,
    /// Output of the job's (or hook's) `files` command.
    Files,
}

impl FileSource {
    pub const ALL: [FileSource; 5] = [
        FileSource::Staged,
        FileSource::StagedWithDeleted,
        FileSource::Push,
        FileSource::All,
        FileSource::Files,
    ];

    pub fn token(self) -> &'static str {
        match self {
            FileSource::Staged => "{staged_files}",
            FileSource::StagedWithDeleted => "{staged_files_with_deleted}",
            FileSource::Push => "{push_files}",
            FileSource::All => "{all_files}",
            FileSource::Files => "{files}",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    Source(FileSource),
    /// Literal `{name}` template (git arguments, job name, user values).
    Template(String),
}

impl Placeholder {
    pub fn token(&self) -> String {
        match self {
            Placeholder::Source(source) => source.token().to_string(),
            Placeholder::Template(name) => format!("{{{name}}}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Substitution {
    /// Text inserted into the command, escaped for file sources.
    values: Vec<String>,
    /// Original file names, index-aligned with `values`. Empty for templates.
    files: Vec<String>,
}

impl Substitution {
    fn is_literal(&self) -> bool {
        self.files.is_empty() && !self.values.is_empty()
    }
}

/// Commands produced by [`Replacer::expand`] and the files they reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    pub commands: Vec<String>,
    /// Unescaped, deduplicated, in first-use order.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Replacer {
    templates: BTreeMap<String, String>,
    cache: BTreeMap<Placeholder, Substitution>,
}

impl Replacer {
    pub fn new(templates: BTreeMap<String, String>) -> Self {
        Self {
            templates,
            cache: BTreeMap::new(),
        }
    }

    /// Resolve every placeholder occurring in `command`.
    ///
    /// File sources go through `resolve`, at most once per source for the
    /// lifetime of the replacer.
    pub fn discover<F>(&mut self, command: &str, mut resolve: F) -> Result<()>
    where
        F: FnMut(FileSource) -> Result<Vec<String>>,
    {
        for source in FileSource::ALL {
            let placeholder = Placeholder::Source(source);
            if self.cache.contains_key(&placeholder) || !command.contains(source.token()) {
                continue;
            }
            let files = resolve(source)?;
            self.insert_files(source, files);
        }

        for (name, value) in &self.templates {
            let placeholder = Placeholder::Template(name.clone());
            if self.cache.contains_key(&placeholder) || !command.contains(&placeholder.token()) {
                continue;
            }
            if FileSource::ALL
                .iter()
                .any(|source| source.token() == placeholder.token())
            {
                continue;
            }
            self.cache.insert(
                placeholder,
                Substitution {
                    values: vec![value.clone()],
                    files: Vec::new(),
                },
            );
        }
        Ok(())
    }

    /// Cache an already resolved file list for `source`.
    pub fn insert_files(&mut self, source: FileSource, files: Vec<String>) {
        let values = files.iter().map(|file| shell_escape(file)).collect();
        self.cache
            .insert(Placeholder::Source(source), Substitution { values, files });
    }

    /// Files resolved for `source`, if it has been discovered.
    pub fn resolved(&self, source: FileSource) -> Option<&[String]> {
        self.cache
            .get(&Placeholder::Source(source))
            .map(|sub| sub.files.as_slice())
    }

    /// Expand `command` into commands no longer than `max_len` where possible.
    ///
    /// Each round takes, per placeholder, the longest prefix of its remaining
    /// files fitting the per-occurrence allotment (at least one file). Files of
    /// an exhausted placeholder substitute as empty; literal templates
    /// substitute in every round.
    pub fn expand(&self, command: &str, max_len: usize) -> Expansion {
        let active: Vec<(String, &Substitution, usize)> = self
            .cache
            .iter()
            .filter_map(|(placeholder, sub)| {
                let token = placeholder.token();
                let count = command.matches(token.as_str()).count();
                (count > 0).then_some((token, sub, count))
            })
            .collect();

        if active.is_empty() {
            return Expansion {
                commands: vec![command.to_string()],
                files: Vec::new(),
            };
        }

        let occurrences: usize = active.iter().map(|(_, _, count)| count).sum();
        let mut budget = max_len as i64;
        for (token, _, count) in &active {
            budget += (count * token.len()) as i64;
        }
        budget -= command.len() as i64;
        let allotment = budget / occurrences as i64;

        let mut offsets = vec![0usize; active.len()];
        let mut expansion = Expansion::default();
        let mut seen = BTreeSet::new();
        loop {
            let mut rendered = command.to_string();
            for (index, (token, sub, _)) in active.iter().enumerate() {
                let taken: &[String] = if sub.is_literal() {
                    &sub.values
                } else {
                    let rest = &sub.values[offsets[index]..];
                    let take = fitting_prefix(rest, allotment);
                    let start = offsets[index];
                    offsets[index] += take;
                    for file in &sub.files[start..start + take] {
                        if seen.insert(file.clone()) {
                            expansion.files.push(file.clone());
                        }
                    }
                    &sub.values[start..start + take]
                };
                rendered = substitute(&rendered, token, taken);
            }
            expansion.commands.push(rendered);

            let exhausted = active
                .iter()
                .zip(&offsets)
                .all(|((_, sub, _), offset)| sub.is_literal() || *offset >= sub.values.len());
            if exhausted {
                break;
            }
        }
        expansion
    }
}

/// Number of leading values whose space-joined length fits `allotment`.
///
/// Returns at least one for a non-empty slice so chunking always progresses.
fn fitting_prefix(values: &[String], allotment: i64) -> usize {
    let mut length = 0i64;
    for (index, value) in values.iter().enumerate() {
        length += value.len() as i64;
        if index > 0 {
            length += 1;
        }
        if length > allotment {
            return index.max(1);
        }
    }
    values.len()
}

/// Replace `token` with `items`, quoting each item when the token is quoted.
fn substitute(command: &str, token: &str, items: &[String]) -> String {
    let mut result = command.to_string();
    for quote in ['"', '\''] {
        let wrapped = format!("{quote}{token}{quote}");
        if !result.contains(&wrapped) {
            continue;
        }
        let quoted: Vec<String> = items
            .iter()
            .map(|item| format!("{quote}{}{quote}", strip_single_quotes(item)))
            .collect();
        result = result.replace(&wrapped, &quoted.join(" "));
    }
    result.replace(token, &items.join(" "))
}

fn strip_single_quotes(item: &str) -> &str {
    item.strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .unwrap_or(item)
}

/// Quote `input` for a POSIX shell, leaving plain path-like strings untouched.
pub fn shell_escape(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    if input.chars().all(|ch| {
        ch.is_ascii_alphanumeric()
            || matches!(ch, '-' | '_' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
    }) {
        return input.to_string();
    }
    let mut escaped = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}
