//! Append-only JSONL ledgers for executions and snapshots.
//!
//! Every pipeline stage appends one event; nothing is ever rewritten.
//! Output previews are redacted before they reach disk.

use crate::core::error::NixgateError;
use crate::core::output::compact_line;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const EXECUTIONS_LOG: &str = "executions.events.jsonl";
pub const SNAPSHOTS_LOG: &str = "snapshots.events.jsonl";

const PREVIEW_CHARS: usize = 240;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub ts: String,
    pub event_id: String,
    pub plan_id: Option<String>,
    pub op: String,
    pub verb: String,
    pub mode: String,
    pub command: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionEvent {
    pub fn new(op: &str, verb: &str, mode: &str, command: &str, status: &str) -> Self {
        Self {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            plan_id: None,
            op: op.to_string(),
            verb: verb.to_string(),
            mode: mode.to_string(),
            command: command.to_string(),
            status: status.to_string(),
            exit_code: None,
            snapshot_id: None,
            detail: None,
        }
    }

    pub fn plan(mut self, plan_id: &str) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self
    }

    pub fn exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn snapshot(mut self, snapshot_id: &str) -> Self {
        self.snapshot_id = Some(snapshot_id.to_string());
        self
    }

    /// Attach a compacted, redacted preview of free-form text.
    pub fn detail(mut self, text: &str) -> Self {
        let preview = compact_line(&redact_string(text), PREVIEW_CHARS);
        if !preview.is_empty() {
            self.detail = Some(preview);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub ts: String,
    pub event_id: String,
    pub snapshot_id: String,
    pub status: String,
    pub scope: String,
    pub generation: u64,
    pub created_at_us: u64,
    pub restore_command: String,
}

/// Writer/reader pair over the two ledgers in one state directory.
#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
}

impl Journal {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executions_path(&self) -> PathBuf {
        self.root.join(EXECUTIONS_LOG)
    }

    pub fn snapshots_path(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_LOG)
    }

    pub fn append_execution(&self, event: &ExecutionEvent) -> Result<(), NixgateError> {
        append_line(&self.executions_path(), event)
    }

    pub fn append_snapshot(&self, event: &SnapshotEvent) -> Result<(), NixgateError> {
        append_line(&self.snapshots_path(), event)
    }

    /// Best-effort execution record; a failed write never changes the outcome.
    pub fn record(&self, event: ExecutionEvent) {
        if let Err(e) = self.append_execution(&event) {
            tracing::warn!(op = %event.op, error = %e, "failed to append execution event");
        }
    }

    pub fn read_executions(&self) -> Result<Vec<ExecutionEvent>, NixgateError> {
        read_lines(&self.executions_path())
    }

    pub fn read_snapshots(&self) -> Result<Vec<SnapshotEvent>, NixgateError> {
        read_lines(&self.snapshots_path())
    }
}

fn append_line<T: Serialize>(path: &Path, event: &T) -> Result<(), NixgateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(event)?;
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, NixgateError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(ev) => events.push(ev),
            // A torn final line from a killed writer is skipped, not fatal.
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed journal line"),
        }
    }
    Ok(events)
}

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let patterns: [(&str, &'static str); 4] = [
        // GitHub tokens, as they appear in nix access-tokens errors
        (r"(ghp|gho|ghu|ghs|ghr)_[a-zA-Z0-9_]{36,255}", "[GITHUB_TOKEN_REDACTED]"),
        (r"(?i)bearer\s+[a-zA-Z0-9_\-\.]{20,}", "[BEARER_REDACTED]"),
        // user:password@ in substituter or flake URLs
        (r"(?i)([a-z][a-z0-9+.-]*://)[^\s/:@]+:[^\s/@]+@", "${1}[CREDENTIALS_REDACTED]@"),
        (
            r#"(?i)(access-tokens|netrc-file|password)\s*=\s*[^\s'"]+"#,
            "${1} = [REDACTED]",
        ),
    ];
    patterns
        .into_iter()
        .filter_map(|(re, rep)| Regex::new(re).ok().map(|r| (r, rep)))
        .collect()
});

/// Redact secrets from a plain string value.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}
