use chrono::Utc;
use gasoline_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{error, warn};

/// Rotate the journal to `<file>.1` once it grows past this size.
const MAX_JOURNAL_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    Lifecycle {
        event: String,
        #[serde(default)]
        detail: serde_json::Value,
        pid: u32,
        port: u16,
        timestamp_ms: i64,
    },
    ToolCall {
        tool: String,
        mode: Option<String>,
        client_id: String,
        is_error: bool,
        duration_ms: u64,
        timestamp_ms: i64,
    },
    HttpRequest {
        method: String,
        path: String,
        status: u16,
        duration_ms: u64,
        timestamp_ms: i64,
    },
}

/// Append-only JSONL diagnostic log. Never read back by the daemon itself.
pub struct Journal {
    path: PathBuf,
    port: u16,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(paths: &Paths, port: u16) -> Self {
        Self::at(paths.journal_file(), port)
    }

    pub fn at(path: PathBuf, port: u16) -> Self {
        Self {
            path,
            port,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lifecycle(&self, event: &str, detail: serde_json::Value) {
        self.append(JournalEvent::Lifecycle {
            event: event.to_string(),
            detail,
            pid: std::process::id(),
            port: self.port,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }

    pub fn tool_call(&self, tool: &str, mode: Option<String>, client_id: &str, is_error: bool, duration_ms: u64) {
        self.append(JournalEvent::ToolCall {
            tool: tool.to_string(),
            mode,
            client_id: client_id.to_string(),
            is_error,
            duration_ms,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }

    pub fn http_request(&self, method: &str, path: &str, status: u16, duration_ms: u64) {
        self.append(JournalEvent::HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration_ms,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }

    /// Best effort: a failed write is logged and otherwise ignored.
    pub fn append(&self, event: JournalEvent) {
        if let Err(e) = self.write_event(&event) {
            warn!(error = %e, path = %self.path.display(), "Failed to write journal event");
        }
    }

    fn write_event(&self, event: &JournalEvent) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_large()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn rotate_if_large(&self) -> Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size > MAX_JOURNAL_BYTES {
            let mut rotated = self.path.clone().into_os_string();
            rotated.push(".1");
            std::fs::rename(&self.path, PathBuf::from(rotated))?;
        }
        Ok(())
    }

    /// Read all events back, skipping unparsable lines.
    pub fn read_events(&self) -> Result<Vec<JournalEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse journal event");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().to_path_buf());
        let journal = Journal::new(&paths, 7890);

        journal.lifecycle("startup", serde_json::json!({"version": "0.1.5"}));
        journal.tool_call("observe", Some("errors".into()), "abcdef012345", false, 3);
        journal.http_request("POST", "/logs", 200, 1);

        let events = journal.read_events().unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            JournalEvent::Lifecycle { event, port, .. } => {
                assert_eq!(event, "startup");
                assert_eq!(*port, 7890);
            }
            _ => panic!("Expected Lifecycle event"),
        }
        let raw = std::fs::read_to_string(paths.journal_file()).unwrap();
        assert!(raw.lines().nth(1).unwrap().contains("\"type\":\"tool_call\""));
    }

    #[test]
    fn test_missing_journal_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::at(temp_dir.path().join("none.jsonl"), 1);
        assert!(journal.read_events().unwrap().is_empty());
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("j.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let journal = Journal::at(path, 1);
        journal.http_request("GET", "/health", 200, 0);
        assert_eq!(journal.read_events().unwrap().len(), 1);
    }
}
