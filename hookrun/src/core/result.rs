//! Job outcomes and how group outcomes are derived from them.

use std::time::Duration;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Skip,
}

/// Outcome of one job or group. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub name: String,
    pub status: Status,
    /// Failure text or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobResult>,
}

impl JobResult {
    pub fn success(name: impl Into<String>, duration: Duration) -> Self {
        Self::leaf(name, Status::Success, None, duration)
    }

    pub fn failure(name: impl Into<String>, text: Option<String>, duration: Duration) -> Self {
        Self::leaf(name, Status::Failure, text, duration)
    }

    pub fn skip(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::leaf(name, Status::Skip, Some(reason.into()), Duration::ZERO)
    }

    /// Group result: status from [`aggregate_status`], duration summed over children.
    pub fn group(name: impl Into<String>, children: Vec<JobResult>) -> Self {
        let status = aggregate_status(&children);
        let duration = children.iter().map(|child| child.duration).sum();
        Self {
            name: name.into(),
            status,
            text: None,
            duration,
            children,
        }
    }

    fn leaf(
        name: impl Into<String>,
        status: Status,
        text: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            text,
            duration,
            children: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == Status::Failure
    }
}

/// Combine children in order: Failure is sticky; Skip wins over Success and,
/// once set, is not undone by a later Success.
pub fn aggregate_status(children: &[JobResult]) -> Status {
    let mut status = Status::Success;
    for child in children {
        match child.status {
            Status::Failure => status = Status::Failure,
            Status::Skip if status != Status::Failure => status = Status::Skip,
            _ => {}
        }
    }
    status
}

/// True if any result in the forest (at any depth) failed.
pub fn any_failed(results: &[JobResult]) -> bool {
    results
        .iter()
        .any(|result| result.is_failure() || any_failed(&result.children))
}

/// Render an indented one-line-per-job summary.
pub fn render_summary(results: &[JobResult]) -> String {
    let mut lines = Vec::new();
    render_inner(results, 0, &mut lines);
    lines.join("\n")
}

fn render_inner(results: &[JobResult], depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for result in results {
        let label = match result.status {
            Status::Success => "ok",
            Status::Failure => "fail",
            Status::Skip => "skip",
        };
        let mut line = format!(
            "{indent}{label:<4} {} ({:.2}s)",
            result.name,
            result.duration.as_secs_f64()
        );
        if let Some(text) = &result.text {
            line.push_str(&format!(": {text}"));
        }
        lines.push(line);
        render_inner(&result.children, depth + 1, lines);
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
