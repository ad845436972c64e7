use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gasoline_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub const MAX_FAILED_COMMANDS: usize = 100;
/// How long finished commands stay readable.
const RETENTION_SECS: i64 = 600;

/// Lifecycle state of a browser command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Complete,
    Error,
    Timeout,
    Expired,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CommandStatus::Error | CommandStatus::Timeout | CommandStatus::Expired | CommandStatus::Cancelled
        )
    }

    /// Map the extension's loose status vocabulary onto the lifecycle states.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "ok" | "success" | "succeeded" | "done" | "complete" => CommandStatus::Complete,
            "pending" | "queued" | "running" | "still_processing" => CommandStatus::Pending,
            "error" => CommandStatus::Error,
            "timeout" => CommandStatus::Timeout,
            "expired" => CommandStatus::Expired,
            "cancelled" | "canceled" => CommandStatus::Cancelled,
            _ => CommandStatus::Complete,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Pending => write!(f, "pending"),
            CommandStatus::Complete => write!(f, "complete"),
            CommandStatus::Error => write!(f, "error"),
            CommandStatus::Timeout => write!(f, "timeout"),
            CommandStatus::Expired => write!(f, "expired"),
            CommandStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A browser action requested by an agent, tracked by correlation ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub correlation_id: String,
    pub client_id: String,
    pub kind: String,
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: i64,
    pub status: CommandStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CommandRecord {
    fn deadline(&self) -> DateTime<Utc> {
        self.created_at + ChronoDuration::milliseconds(self.ttl_ms)
    }

    pub fn elapsed_ms(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0)
    }

    /// Empty-client commands are readable by anyone.
    pub fn visible_to(&self, client_id: &str) -> bool {
        self.client_id.is_empty() || self.client_id == client_id
    }
}

/// What `record_result` did with an extension report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Transitioned(CommandStatus),
    Duplicate,
    Ignored,
    Unknown,
}

/// Build a server-side correlation ID: `<prefix>_<unix nanos>_<random>`.
pub fn new_correlation_id(prefix: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random = (uuid::Uuid::new_v4().as_u128() as u64) >> 1;
    format!("{}_{}_{}", prefix, nanos, random)
}

/// True when a failure was caused by the page's Content Security Policy.
pub fn is_csp_failure(error: Option<&str>, result: Option<&Value>) -> bool {
    const MARKERS: [&str; 5] = [
        "csp",
        "content security policy",
        "trusted type",
        "unsafe-eval",
        "restricted_page",
    ];
    let mentions = |text: &str| {
        let lower = text.to_ascii_lowercase();
        MARKERS.iter().any(|m| lower.contains(m))
    };
    if error.is_some_and(mentions) {
        return true;
    }
    let Some(result) = result else {
        return false;
    };
    ["error", "message", "reason", "failure_cause"].iter().any(|field| {
        result.get(field).and_then(Value::as_str).is_some_and(mentions)
    }) || result.get("csp_blocked").and_then(Value::as_bool).unwrap_or(false)
}

/// Reports `success:false` or an `error` field inside an otherwise successful payload.
fn embedded_failure(result: Option<&Value>) -> Option<String> {
    let result = result?;
    let failed = result.get("success").and_then(Value::as_bool) == Some(false);
    let error = result.get("error").filter(|e| !e.is_null()).map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    match (failed, error) {
        (_, Some(err)) => Some(err),
        (true, None) => Some("command reported success=false".to_string()),
        (false, None) => None,
    }
}

struct Entry {
    record: CommandRecord,
    tx: watch::Sender<CommandStatus>,
}

#[derive(Default)]
struct Inner {
    commands: HashMap<String, Entry>,
    failed: VecDeque<CommandRecord>,
}

impl Inner {
    fn transition(
        &mut self,
        correlation_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let Some(entry) = self.commands.get_mut(correlation_id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            return false;
        }
        entry.record.status = status;
        entry.record.completed_at = Some(Utc::now());
        if result.is_some() {
            entry.record.result = result;
        }
        if error.is_some() {
            entry.record.error = error;
        }
        entry.tx.send_replace(status);
        if status.is_failure() {
            let snapshot = entry.record.clone();
            self.failed.push_back(snapshot);
            while self.failed.len() > MAX_FAILED_COMMANDS {
                self.failed.pop_front();
            }
        }
        true
    }

    fn expire_overdue(&mut self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<String> = self
            .commands
            .values()
            .filter(|e| e.record.status == CommandStatus::Pending && now >= e.record.deadline())
            .map(|e| e.record.correlation_id.clone())
            .collect();
        for id in &overdue {
            self.transition(id, CommandStatus::Timeout, None, Some("extension_timeout".to_string()));
        }
        overdue.len()
    }
}

/// Thread-safe registry of browser commands and their results.
pub struct CommandTracker {
    default_ttl: Duration,
    inner: Mutex<Inner>,
}

impl CommandTracker {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Register a pending command.
    pub fn create(
        &self,
        correlation_id: &str,
        kind: &str,
        params: Value,
        client_id: &str,
        ttl: Option<Duration>,
    ) -> CommandRecord {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let record = CommandRecord {
            correlation_id: correlation_id.to_string(),
            client_id: client_id.to_string(),
            kind: kind.to_string(),
            params,
            created_at: Utc::now(),
            ttl_ms: ttl.as_millis() as i64,
            status: CommandStatus::Pending,
            completed_at: None,
            result: None,
            error: None,
        };
        let (tx, _rx) = watch::channel(CommandStatus::Pending);
        self.lock().commands.insert(
            correlation_id.to_string(),
            Entry {
                record: record.clone(),
                tx,
            },
        );
        debug!(correlation_id, kind, "Command queued");
        record
    }

    /// Apply a result reported by the extension.
    pub fn record_result(
        &self,
        correlation_id: &str,
        raw_status: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> RecordOutcome {
        let mut status = CommandStatus::normalize(raw_status);
        if status == CommandStatus::Pending {
            return RecordOutcome::Ignored;
        }
        let mut error = error.filter(|e| !e.is_empty());
        if status == CommandStatus::Complete {
            if let Some(embedded) = error.clone().or_else(|| embedded_failure(result.as_ref())) {
                status = CommandStatus::Error;
                error = Some(embedded);
            }
        }

        let mut inner = self.lock();
        let Some(entry) = inner.commands.get_mut(correlation_id) else {
            debug!(correlation_id, "Result for unknown command");
            return RecordOutcome::Unknown;
        };
        if entry.record.status.is_terminal() {
            if entry.record.status == status {
                if result.is_some() {
                    entry.record.result = result;
                }
                if error.is_some() {
                    entry.record.error = error;
                }
                return RecordOutcome::Duplicate;
            }
            return RecordOutcome::Ignored;
        }
        inner.transition(correlation_id, status, result, error);
        RecordOutcome::Transitioned(status)
    }

    pub fn cancel(&self, correlation_id: &str, client_id: &str) -> Result<CommandRecord> {
        let mut inner = self.lock();
        match inner.commands.get(correlation_id) {
            None => return Err(Error::NotFound(format!("command {}", correlation_id))),
            Some(e) if !e.record.visible_to(client_id) => {
                return Err(Error::PermissionDenied(format!(
                    "command {} belongs to another client",
                    correlation_id
                )))
            }
            Some(_) => {}
        }
        inner.transition(correlation_id, CommandStatus::Cancelled, None, Some("cancelled".to_string()));
        inner
            .commands
            .get(correlation_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound(format!("command {}", correlation_id)))
    }

    /// Read a command, timing it out first if its TTL has elapsed.
    pub fn get(&self, correlation_id: &str, client_id: &str) -> Result<CommandRecord> {
        let mut inner = self.lock();
        let overdue = match inner.commands.get(correlation_id) {
            None => return Err(Error::NotFound(format!("command {}", correlation_id))),
            Some(e) if !e.record.visible_to(client_id) => {
                return Err(Error::PermissionDenied(format!(
                    "command {} belongs to another client",
                    correlation_id
                )))
            }
            Some(e) => e.record.status == CommandStatus::Pending && Utc::now() >= e.record.deadline(),
        };
        if overdue {
            inner.transition(correlation_id, CommandStatus::Timeout, None, Some("extension_timeout".to_string()));
        }
        inner
            .commands
            .get(correlation_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound(format!("command {}", correlation_id)))
    }

    /// Wait until the command leaves `pending` or `timeout` passes.
    ///
    /// Returns the record as of the end of the wait. A result that landed before
    /// the call is seen immediately.
    pub async fn wait(&self, correlation_id: &str, client_id: &str, timeout: Duration) -> Result<CommandRecord> {
        let mut rx = {
            let inner = self.lock();
            let entry = inner
                .commands
                .get(correlation_id)
                .ok_or_else(|| Error::NotFound(format!("command {}", correlation_id)))?;
            if !entry.record.visible_to(client_id) {
                return Err(Error::PermissionDenied(format!(
                    "command {} belongs to another client",
                    correlation_id
                )));
            }
            entry.tx.subscribe()
        };
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await;
        self.get(correlation_id, client_id)
    }

    /// Commands still waiting on the extension, visible to `client_id`.
    pub fn pending(&self, client_id: &str) -> Vec<CommandRecord> {
        let mut inner = self.lock();
        inner.expire_overdue(Utc::now());
        let mut out: Vec<CommandRecord> = inner
            .commands
            .values()
            .filter(|e| e.record.status == CommandStatus::Pending && e.record.visible_to(client_id))
            .map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Recently failed commands, newest first.
    pub fn failed(&self, client_id: &str) -> Vec<CommandRecord> {
        let inner = self.lock();
        inner
            .failed
            .iter()
            .rev()
            .filter(|r| r.visible_to(client_id))
            .cloned()
            .collect()
    }

    /// Expire every pending command, e.g. when the extension goes away.
    pub fn expire_all(&self, reason: &str) -> usize {
        let mut inner = self.lock();
        let pending: Vec<String> = inner
            .commands
            .values()
            .filter(|e| e.record.status == CommandStatus::Pending)
            .map(|e| e.record.correlation_id.clone())
            .collect();
        for id in &pending {
            inner.transition(id, CommandStatus::Expired, None, Some(reason.to_string()));
        }
        if !pending.is_empty() {
            info!(count = pending.len(), reason, "Expired pending commands");
        }
        pending.len()
    }

    /// Time out overdue commands and drop old finished ones.
    pub fn scavenge(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.lock();
        let timed_out = inner.expire_overdue(now);
        let cutoff = now - ChronoDuration::seconds(RETENTION_SECS);
        inner.commands.retain(|_, e| {
            !(e.record.status.is_terminal() && e.record.completed_at.is_some_and(|t| t < cutoff))
        });
        timed_out
    }

    pub fn count(&self) -> usize {
        self.lock().commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> CommandTracker {
        CommandTracker::new(Duration::from_secs(30))
    }

    #[test]
    fn test_correlation_id_prefix() {
        let id = new_correlation_id("dom_click");
        assert!(id.starts_with("dom_click_"));
        assert_eq!(id.split('_').count(), 4);
        assert_ne!(id, new_correlation_id("dom_click"));
    }

    #[test]
    fn test_normalize_status() {
        assert_eq!(CommandStatus::normalize(""), CommandStatus::Complete);
        assert_eq!(CommandStatus::normalize("succeeded"), CommandStatus::Complete);
        assert_eq!(CommandStatus::normalize("still_processing"), CommandStatus::Pending);
        assert_eq!(CommandStatus::normalize("canceled"), CommandStatus::Cancelled);
        assert_eq!(CommandStatus::normalize("timeout"), CommandStatus::Timeout);
        assert_eq!(CommandStatus::normalize("weird"), CommandStatus::Complete);
    }

    #[test]
    fn test_single_terminal_transition() {
        let t = tracker();
        t.create("nav_1", "navigate", json!({"url": "http://localhost"}), "", None);
        assert_eq!(
            t.record_result("nav_1", "ok", Some(json!({"success": true})), None),
            RecordOutcome::Transitioned(CommandStatus::Complete)
        );
        assert_eq!(t.record_result("nav_1", "ok", Some(json!({"success": true})), None), RecordOutcome::Duplicate);
        assert_eq!(t.record_result("nav_1", "error", None, Some("late".into())), RecordOutcome::Ignored);
        let rec = t.get("nav_1", "").unwrap();
        assert_eq!(rec.status, CommandStatus::Complete);
        assert!(rec.error.is_none());
    }

    #[test]
    fn test_embedded_failure_promotes_error() {
        let t = tracker();
        t.create("exec_1", "execute_js", json!({}), "", None);
        t.record_result("exec_1", "complete", Some(json!({"success": false, "error": "ReferenceError: x"})), None);
        let rec = t.get("exec_1", "").unwrap();
        assert_eq!(rec.status, CommandStatus::Error);
        assert_eq!(rec.error.as_deref(), Some("ReferenceError: x"));
        assert_eq!(t.failed("").len(), 1);
    }

    #[test]
    fn test_csp_detection() {
        assert!(is_csp_failure(Some("Refused: Content Security Policy"), None));
        assert!(is_csp_failure(None, Some(&json!({"error": "unsafe-eval blocked"}))));
        assert!(is_csp_failure(None, Some(&json!({"csp_blocked": true}))));
        assert!(!is_csp_failure(Some("element not found"), Some(&json!({"ok": false}))));
    }

    #[test]
    fn test_cross_client_read_denied() {
        let t = tracker();
        t.create("dom_click_1", "click", json!({}), "aaaaaaaaaaaa", None);
        assert!(t.get("dom_click_1", "aaaaaaaaaaaa").is_ok());
        let err = t.get("dom_click_1", "bbbbbbbbbbbb").unwrap_err();
        assert_eq!(err.code(), "permission_denied");

        t.create("legacy", "click", json!({}), "", None);
        assert!(t.get("legacy", "bbbbbbbbbbbb").is_ok());
    }

    #[test]
    fn test_lazy_timeout() {
        let t = tracker();
        t.create("dom_click_2", "click", json!({}), "", Some(Duration::from_millis(0)));
        let rec = t.get("dom_click_2", "").unwrap();
        assert_eq!(rec.status, CommandStatus::Timeout);
        assert_eq!(rec.error.as_deref(), Some("extension_timeout"));
        assert_eq!(t.record_result("dom_click_2", "ok", None, None), RecordOutcome::Ignored);
    }

    #[test]
    fn test_expire_all() {
        let t = tracker();
        t.create("a", "click", json!({}), "", None);
        t.create("b", "click", json!({}), "", None);
        t.record_result("b", "ok", None, None);
        assert_eq!(t.expire_all("extension_disconnected"), 1);
        let rec = t.get("a", "").unwrap();
        assert_eq!(rec.status, CommandStatus::Expired);
        assert_eq!(rec.error.as_deref(), Some("extension_disconnected"));
        assert!(t.pending("").is_empty());
    }

    #[test]
    fn test_cancel() {
        let t = tracker();
        t.create("c", "click", json!({}), "aaaaaaaaaaaa", None);
        assert!(t.cancel("c", "bbbbbbbbbbbb").is_err());
        let rec = t.cancel("c", "aaaaaaaaaaaa").unwrap();
        assert_eq!(rec.status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_sees_result_delivered_before_wait() {
        let t = tracker();
        t.create("nav_2", "navigate", json!({}), "", None);
        t.record_result("nav_2", "ok", Some(json!({"url": "http://localhost"})), None);
        let rec = t.wait("nav_2", "", Duration::from_millis(50)).await.unwrap();
        assert_eq!(rec.status, CommandStatus::Complete);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_completion() {
        let t = std::sync::Arc::new(tracker());
        t.create("nav_3", "navigate", json!({}), "", None);
        let t2 = t.clone();
        let waiter = tokio::spawn(async move { t2.wait("nav_3", "", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.record_result("nav_3", "ok", None, None);
        let rec = waiter.await.unwrap().unwrap();
        assert_eq!(rec.status, CommandStatus::Complete);
    }

    #[tokio::test]
    async fn test_wait_returns_pending_on_deadline() {
        let t = tracker();
        t.create("nav_4", "navigate", json!({}), "", None);
        let rec = t.wait("nav_4", "", Duration::from_millis(20)).await.unwrap();
        assert_eq!(rec.status, CommandStatus::Pending);
    }
}
