//! Audit Sink: append-only JSONL log of every gateway decision. Writes are
//! flushed immediately; I/O failures are swallowed with a diagnostic
//! warning rather than propagated, since a broken audit log must never take
//! the gateway down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Outcome recorded for an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
    Error,
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    agent_id: &'a str,
    operation: &'a str,
    decision: Decision,
    latency_ms: f64,
    metadata: Value,
}

/// Append-only JSONL audit sink.
pub struct AuditSink {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl AuditSink {
    /// Open (or create) the audit log at `path`, creating parent
    /// directories as needed. If the file cannot be opened, the sink is
    /// still constructed — every subsequent write will warn and no-op.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "failed to create audit log directory");
            }
        }

        let file = open_append(&path);
        Self {
            file: Mutex::new(file),
            path,
        }
    }

    /// Record one audit entry. Latency is rounded to two decimal places to
    /// match the precision the gateway reports elsewhere.
    pub fn log(&self, agent_id: &str, operation: &str, decision: Decision, latency_ms: f64, metadata: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            agent_id,
            operation,
            decision,
            latency_ms: (latency_ms * 100.0).round() / 100.0,
            metadata,
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };

        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            *guard = open_append(&self.path);
        }

        let Some(file) = guard.as_mut() else {
            warn!(path = %self.path.display(), "audit log unavailable, dropping entry");
            return;
        };

        if let Err(e) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), error = %e, "failed to write audit log, dropping entry");
            *guard = None;
            return;
        }
        if let Err(e) = file.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush audit log");
        }
    }
}

fn open_append(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open audit log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn writes_one_jsonl_line_per_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = AuditSink::new(&path);

        sink.log("backend", "execute_tool", Decision::Allow, 12.345, json!({"server": "postgres"}));
        sink.log("backend", "execute_tool", Decision::Deny, 1.0, json!({}));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["agent_id"], "backend");
        assert_eq!(first["operation"], "execute_tool");
        assert_eq!(first["decision"], "ALLOW");
        assert_eq!(first["latency_ms"], 12.35);
    }

    #[test]
    fn swallows_errors_when_directory_cannot_be_created() {
        let sink = AuditSink::new("/nonexistent/definitely/not/writable/audit.jsonl");
        sink.log("backend", "list_servers", Decision::Allow, 0.5, json!({}));
    }
}
