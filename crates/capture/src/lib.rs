pub mod alerts;
pub mod checkpoints;
pub mod circuit;
pub mod clients;
pub mod commands;
pub mod extension;
pub mod queries;
pub mod ring;
pub mod store;

pub use alerts::{Alert, AlertBuffer, CiResult, Severity};
pub use checkpoints::{ChangesSince, CheckpointManager};
pub use circuit::{CircuitHealth, RateLimitResponse, Rejection, Transition};
pub use clients::{derive_client_id, ClientInfo, ClientRegistry};
pub use commands::{new_correlation_id, CommandRecord, CommandStatus, CommandTracker, RecordOutcome};
pub use extension::{ExtensionSettings, ExtensionState, PollEvent, SyncRequest};
pub use queries::{PendingQuery, QueryStore};
pub use store::{AddOutcome, BufferKind, CaptureStore, QueryFilter};

use chrono::Utc;
use gasoline_core::Config;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const EXPIRE_REASON_DISCONNECTED: &str = "extension_disconnected";

/// Every piece of in-memory daemon state.
///
/// Each component owns its own lock; methods here call them one after another
/// and never hold two at once.
pub struct Capture {
    pub store: CaptureStore,
    pub clients: ClientRegistry,
    pub checkpoints: CheckpointManager,
    pub commands: CommandTracker,
    pub queries: QueryStore,
    pub alerts: AlertBuffer,
    pub extension: ExtensionState,
    pub started_at: Instant,
    query_timeout: Duration,
    errors_total: AtomicU64,
}

impl Capture {
    pub fn new(config: &Config) -> Self {
        Self {
            store: CaptureStore::new(config.capture.clone()),
            clients: ClientRegistry::default(),
            checkpoints: CheckpointManager::new(),
            commands: CommandTracker::new(Duration::from_secs(config.commands.ttl_secs)),
            queries: QueryStore::new(),
            alerts: AlertBuffer::new(),
            extension: ExtensionState::new(),
            started_at: Instant::now(),
            query_timeout: Duration::from_secs(config.commands.query_timeout_secs),
            errors_total: AtomicU64::new(0),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Append records and feed error logs to the spike detector.
    pub fn ingest(&self, kind: BufferKind, records: Vec<Value>) -> AddOutcome {
        let errors = if kind == BufferKind::Logs {
            records
                .iter()
                .filter(|r| r.get("level").and_then(Value::as_str) == Some("error"))
                .count()
        } else {
            0
        };
        let outcome = self.store.add_events(kind, records);
        self.errors_total.fetch_add(errors as u64, Ordering::Relaxed);
        let now = Utc::now();
        for _ in 0..errors {
            self.alerts.record_error(now);
        }
        outcome
    }

    /// Expire all outstanding extension work if the extension just went quiet.
    pub fn check_extension(&self) -> bool {
        if !self.extension.check_disconnect() {
            return false;
        }
        self.queries.expire_all(EXPIRE_REASON_DISCONNECTED);
        self.commands.expire_all(EXPIRE_REASON_DISCONNECTED);
        true
    }

    /// Periodic cleanup of timed-out commands and stale query results.
    pub fn scavenge(&self) -> usize {
        self.check_extension();
        self.queries.scavenge() + self.commands.scavenge()
    }

    /// Queue a browser command: tracked by correlation ID and delivered as a query.
    pub fn queue_command(&self, kind: &str, query_type: &str, params: Value, client_id: &str) -> CommandRecord {
        let prefix = correlation_prefix(kind);
        let correlation_id = new_correlation_id(prefix);
        let record = self
            .commands
            .create(&correlation_id, kind, params.clone(), client_id, None);
        self.queries.create(
            query_type,
            params,
            Some(correlation_id),
            self.commands.default_ttl(),
            client_id,
        );
        record
    }

    /// Error-level log records ever ingested.
    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Correlation ID prefix for each command kind.
pub fn correlation_prefix(kind: &str) -> &'static str {
    match kind {
        "click" => "dom_click",
        "type" => "dom_type",
        "highlight" => "dom_highlight",
        "navigate" | "refresh" | "back" | "forward" => "nav",
        "execute_js" => "exec",
        "set_storage" => "storage",
        _ => "dom_query",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_command_tracks_and_delivers() {
        let cap = Capture::new(&Config::default());
        let rec = cap.queue_command("click", "dom_action", json!({"selector": "#btn"}), "aaaaaaaaaaaa");
        assert!(rec.correlation_id.starts_with("dom_click_"));
        let pending = cap.queries.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id.as_deref(), Some(rec.correlation_id.as_str()));
        assert_eq!(cap.commands.pending("aaaaaaaaaaaa").len(), 1);
    }

    #[test]
    fn test_ingest_feeds_anomaly_detector() {
        let cap = Capture::new(&Config::default());
        cap.ingest(BufferKind::Logs, vec![json!({"level": "error", "message": "boom"}); 4]);
        assert_eq!(cap.errors_total(), 4);
        let alerts = cap.alerts.drain_for_observe();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, "anomaly");
    }

    #[test]
    fn test_correlation_prefixes() {
        assert_eq!(correlation_prefix("navigate"), "nav");
        assert_eq!(correlation_prefix("execute_js"), "exec");
        assert_eq!(correlation_prefix("set_storage"), "storage");
        assert_eq!(correlation_prefix("type"), "dom_type");
    }
}
