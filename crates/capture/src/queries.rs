//! Work items handed to the extension: synchronous reads (DOM queries) and the
//! delivery side of browser commands.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gasoline_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub const MAX_PENDING_QUERIES: usize = 5;
pub const RESULT_RETENTION: Duration = Duration::from_secs(60);

/// What the extension sees when it polls.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip)]
    pub client_id: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
enum QueryState {
    Pending,
    Answered { value: Value, at: DateTime<Utc> },
    Failed { reason: String, at: DateTime<Utc> },
}

struct Entry {
    query: PendingQuery,
    state: QueryState,
    tx: watch::Sender<bool>,
}

impl Entry {
    fn finish(&mut self, state: QueryState) {
        self.state = state;
        self.tx.send_replace(true);
    }

    fn visible_to(&self, client_id: &str) -> bool {
        self.query.client_id.is_empty() || self.query.client_id == client_id
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    pending_order: VecDeque<String>,
    next_id: u64,
}

impl Inner {
    fn fail(&mut self, id: &str, reason: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if matches!(entry.state, QueryState::Pending) {
                entry.finish(QueryState::Failed {
                    reason: reason.to_string(),
                    at: Utc::now(),
                });
            }
        }
        self.pending_order.retain(|p| p != id);
    }
}

pub struct QueryStore {
    inner: Mutex<Inner>,
    /// Bumped whenever a query is queued, so pollers can long-poll.
    created: watch::Sender<u64>,
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStore {
    pub fn new() -> Self {
        let (created, _rx) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            created,
        }
    }

    pub fn subscribe_created(&self) -> watch::Receiver<u64> {
        self.created.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a query for the extension and return its `q-<n>` ID.
    ///
    /// When the queue is full the oldest pending query is dropped.
    pub fn create(
        &self,
        kind: &str,
        params: Value,
        correlation_id: Option<String>,
        ttl: Duration,
        client_id: &str,
    ) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("q-{}", inner.next_id);

        while inner.pending_order.len() >= MAX_PENDING_QUERIES {
            let Some(oldest) = inner.pending_order.front().cloned() else {
                break;
            };
            debug!(query_id = %oldest, "Dropping oldest pending query");
            inner.fail(&oldest, "dropped: too many pending queries");
        }

        let (tx, _rx) = watch::channel(false);
        let query = PendingQuery {
            id: id.clone(),
            kind: kind.to_string(),
            params,
            correlation_id,
            client_id: client_id.to_string(),
            created_at: Utc::now(),
            ttl,
        };
        inner.entries.insert(
            id.clone(),
            Entry {
                query,
                state: QueryState::Pending,
                tx,
            },
        );
        inner.pending_order.push_back(id.clone());
        drop(inner);
        self.created.send_modify(|n| *n += 1);
        id
    }

    /// Store the extension's answer. Returns the query so callers can follow its correlation ID.
    pub fn set_result(&self, id: &str, value: Value) -> Option<PendingQuery> {
        let mut inner = self.lock();
        inner.pending_order.retain(|p| p != id);
        let entry = inner.entries.get_mut(id)?;
        if !matches!(entry.state, QueryState::Pending) {
            return None;
        }
        entry.finish(QueryState::Answered {
            value,
            at: Utc::now(),
        });
        Some(entry.query.clone())
    }

    /// Queries the extension has not answered yet, oldest first.
    pub fn pending(&self) -> Vec<PendingQuery> {
        let mut inner = self.lock();
        let now = Utc::now();
        let overdue: Vec<String> = inner
            .pending_order
            .iter()
            .filter(|id| {
                inner.entries.get(*id).is_some_and(|e| {
                    now >= e.query.created_at + ChronoDuration::milliseconds(e.query.ttl.as_millis() as i64)
                })
            })
            .cloned()
            .collect();
        for id in overdue {
            inner.fail(&id, "timeout");
        }
        inner
            .pending_order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| e.query.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_order.len()
    }

    /// Block until the query is answered, fails, or `timeout` passes.
    ///
    /// The result is consumed by the first successful read.
    pub async fn wait_for_result(&self, id: &str, timeout: Duration, client_id: &str) -> Result<Value> {
        let mut rx = {
            let inner = self.lock();
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("query {}", id)))?;
            if !entry.visible_to(client_id) {
                return Err(Error::PermissionDenied(format!("query {} belongs to another client", id)));
            }
            entry.tx.subscribe()
        };

        let answered = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await.is_ok();
        drop(rx);

        let mut inner = self.lock();
        if !answered {
            inner.fail(id, "timeout");
            inner.entries.remove(id);
            return Err(Error::Timeout(format!("query {} not answered within {:?}", id, timeout)));
        }
        let Some(entry) = inner.entries.remove(id) else {
            return Err(Error::NotFound(format!("query {}", id)));
        };
        match entry.state {
            QueryState::Answered { value, .. } => Ok(value),
            QueryState::Failed { reason, .. } if reason == "extension_disconnected" => {
                Err(Error::ExtensionDisconnected(format!("query {} expired", id)))
            }
            QueryState::Failed { reason, .. } if reason == "timeout" => {
                Err(Error::Timeout(format!("query {} not answered", id)))
            }
            QueryState::Failed { reason, .. } => Err(Error::Extension(reason)),
            QueryState::Pending => Err(Error::Timeout(format!("query {} not answered", id))),
        }
    }

    /// Fail every pending query with `reason`.
    pub fn expire_all(&self, reason: &str) -> usize {
        let mut inner = self.lock();
        let ids: Vec<String> = inner.pending_order.iter().cloned().collect();
        for id in &ids {
            inner.fail(id, reason);
        }
        ids.len()
    }

    /// Time out overdue queries and drop results nobody collected.
    pub fn scavenge(&self) -> usize {
        let _ = self.pending();
        let cutoff = Utc::now() - ChronoDuration::milliseconds(RESULT_RETENTION.as_millis() as i64);
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| match &e.state {
            QueryState::Pending => true,
            QueryState::Answered { at, .. } | QueryState::Failed { at, .. } => *at >= cutoff,
        });
        before - inner.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn test_ids_are_sequential() {
        let store = QueryStore::new();
        assert_eq!(store.create("dom", json!({}), None, TTL, ""), "q-1");
        assert_eq!(store.create("dom", json!({}), None, TTL, ""), "q-2");
    }

    #[test]
    fn test_pending_cap_drops_oldest() {
        let store = QueryStore::new();
        for _ in 0..6 {
            store.create("dom", json!({}), None, TTL, "");
        }
        let pending = store.pending();
        assert_eq!(pending.len(), MAX_PENDING_QUERIES);
        assert_eq!(pending[0].id, "q-2");
    }

    #[tokio::test]
    async fn test_result_round_trip() {
        let store = Arc::new(QueryStore::new());
        let id = store.create("dom_query", json!({"selector": "h1"}), None, TTL, "aaaaaaaaaaaa");
        let s2 = store.clone();
        let id2 = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s2.set_result(&id2, json!({"matches": 1}));
        });
        let value = store.wait_for_result(&id, Duration::from_secs(2), "aaaaaaaaaaaa").await.unwrap();
        assert_eq!(value["matches"], 1);
        // consumed
        assert!(store.wait_for_result(&id, Duration::from_millis(5), "aaaaaaaaaaaa").await.is_err());
    }

    #[tokio::test]
    async fn test_non_owner_denied() {
        let store = QueryStore::new();
        let id = store.create("dom_query", json!({}), None, TTL, "aaaaaaaaaaaa");
        store.set_result(&id, json!({}));
        let err = store.wait_for_result(&id, Duration::from_millis(5), "bbbbbbbbbbbb").await.unwrap_err();
        assert_eq!(err.code(), "permission_denied");
        assert!(store.wait_for_result(&id, Duration::from_millis(5), "aaaaaaaaaaaa").await.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_query_readable_by_empty_client() {
        let store = QueryStore::new();
        let id = store.create("dom_query", json!({}), None, TTL, "");
        store.set_result(&id, json!({"ok": true}));
        assert!(store.wait_for_result(&id, Duration::from_millis(5), "").await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout() {
        let store = QueryStore::new();
        let id = store.create("dom_query", json!({}), None, TTL, "");
        let err = store.wait_for_result(&id, Duration::from_millis(10), "").await.unwrap_err();
        assert_eq!(err.code(), "extension_timeout");
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_all_wakes_waiter() {
        let store = Arc::new(QueryStore::new());
        let id = store.create("dom_query", json!({}), None, TTL, "");
        let s2 = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s2.expire_all("extension_disconnected");
        });
        let err = store.wait_for_result(&id, Duration::from_secs(2), "").await.unwrap_err();
        assert_eq!(err.code(), "extension_disconnected");
    }

    #[tokio::test]
    async fn test_created_signal() {
        let store = QueryStore::new();
        let mut rx = store.subscribe_created();
        store.create("dom_query", json!({}), None, TTL, "");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn test_overdue_queries_leave_pending() {
        let store = QueryStore::new();
        store.create("dom_query", json!({}), None, Duration::from_millis(0), "");
        assert!(store.pending().is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let store = QueryStore::new();
        store.create("dom_action", json!({"action": "click"}), Some("dom_click_1".into()), TTL, "x");
        let v = serde_json::to_value(&store.pending()[0]).unwrap();
        assert_eq!(v["type"], "dom_action");
        assert_eq!(v["correlation_id"], "dom_click_1");
        assert!(v.get("client_id").is_none());
    }
}
