//! Named per-client positions in the capture buffers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clients::checkpoint_prefix;
use crate::store::{BufferKind, BufferMark, CaptureStore};

pub const MAX_CHECKPOINTS_PER_CLIENT: usize = 64;
pub const UNKNOWN_CHECKPOINT: &str = "unknown-checkpoint-treated-as-epoch";
/// `from` label of a diff against the caller's previous unnamed call.
pub const AUTO_CHECKPOINT: &str = "previous-call";

#[derive(Debug, Clone)]
struct Checkpoint {
    created_at: DateTime<Utc>,
    marks: BTreeMap<BufferKind, BufferMark>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KindChanges {
    pub total_new: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangesSince {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_created_at: Option<DateTime<Utc>>,
    pub changes: BTreeMap<BufferKind, KindChanges>,
}

impl ChangesSince {
    pub fn total_new(&self) -> u64 {
        self.changes.values().map(|c| c.total_new).sum()
    }
}

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<String, Checkpoint>,
    /// Insertion order of namespaced keys, per client prefix.
    order: HashMap<String, VecDeque<String>>,
    /// Per-client position of the last unnamed diff.
    auto: HashMap<String, Checkpoint>,
}

#[derive(Default)]
pub struct CheckpointManager {
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot every buffer's counter under `prefix + name`.
    ///
    /// The marks are read before taking the checkpoint lock so the capture lock
    /// is never held together with this one.
    pub fn create(&self, store: &CaptureStore, name: &str, client_id: &str) {
        let marks = store.marks();
        let prefix = checkpoint_prefix(client_id);
        let key = format!("{}{}", prefix, name);

        let mut inner = self.lock();
        inner.checkpoints.insert(
            key.clone(),
            Checkpoint {
                created_at: Utc::now(),
                marks,
            },
        );
        let order = inner.order.entry(prefix).or_default();
        order.retain(|k| k != &key);
        order.push_back(key);
        let mut evicted = Vec::new();
        while order.len() > MAX_CHECKPOINTS_PER_CLIENT {
            if let Some(old) = order.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            inner.checkpoints.remove(&old);
        }
    }

    fn resolve(&self, name: &str, client_id: &str) -> Option<(String, Checkpoint)> {
        let inner = self.lock();
        let key = format!("{}{}", checkpoint_prefix(client_id), name);
        if let Some(cp) = inner.checkpoints.get(&key) {
            return Some((name.to_string(), cp.clone()));
        }
        inner
            .checkpoints
            .get(name)
            .map(|cp| (name.to_string(), cp.clone()))
    }

    pub fn exists(&self, name: &str, client_id: &str) -> bool {
        self.resolve(name, client_id).is_some()
    }

    /// Diff against a checkpoint name, falling back to an RFC3339 timestamp.
    /// Anything else diffs against the start of the process.
    pub fn changes_since(
        &self,
        store: &CaptureStore,
        name: &str,
        client_id: &str,
        kinds: &[BufferKind],
        record_limit: usize,
    ) -> ChangesSince {
        let (from, created_at, marks) = match self.resolve(name, client_id) {
            Some((from, cp)) => (from, Some(cp.created_at), cp.marks),
            None => match DateTime::parse_from_rfc3339(name) {
                Ok(t) => {
                    let t = t.with_timezone(&Utc);
                    (name.to_string(), Some(t), store.marks_at(t))
                }
                Err(_) => (UNKNOWN_CHECKPOINT.to_string(), None, BTreeMap::new()),
            },
        };
        diff(store, from, created_at, &marks, &store.counters(), kinds, record_limit)
    }

    /// Diff since this client's previous unnamed call, then advance to now.
    /// The first call diffs against the start of the process.
    pub fn changes_since_last_call(
        &self,
        store: &CaptureStore,
        client_id: &str,
        kinds: &[BufferKind],
        record_limit: usize,
    ) -> ChangesSince {
        let current = store.marks();
        let previous = {
            let mut inner = self.lock();
            inner.auto.insert(
                client_id.to_string(),
                Checkpoint {
                    created_at: Utc::now(),
                    marks: current.clone(),
                },
            )
        };
        let counters = current.iter().map(|(k, m)| (*k, m.total_added)).collect();
        let (created_at, marks) = match previous {
            Some(cp) => (Some(cp.created_at), cp.marks),
            None => (None, BTreeMap::new()),
        };
        diff(store, AUTO_CHECKPOINT.to_string(), created_at, &marks, &counters, kinds, record_limit)
    }

    /// Drop the unnamed-diff position of a client that went away.
    pub fn forget_client(&self, client_id: &str) {
        self.lock().auto.remove(client_id);
    }

    pub fn count(&self) -> usize {
        self.lock().checkpoints.len()
    }
}

fn diff(
    store: &CaptureStore,
    from: String,
    created_at: Option<DateTime<Utc>>,
    marks: &BTreeMap<BufferKind, BufferMark>,
    current: &BTreeMap<BufferKind, u64>,
    kinds: &[BufferKind],
    record_limit: usize,
) -> ChangesSince {
    let kinds: &[BufferKind] = if kinds.is_empty() { &BufferKind::ALL } else { kinds };
    let mut changes = BTreeMap::new();
    for &kind in kinds {
        let since = marks.get(&kind).map(|m| m.total_added).unwrap_or(0);
        let now = current.get(&kind).copied().unwrap_or(0);
        let total_new = now.saturating_sub(since);
        let records = if record_limit > 0 && total_new > 0 {
            store.added_since(kind, since, record_limit.min(total_new as usize))
        } else {
            Vec::new()
        };
        changes.insert(kind, KindChanges { total_new, records });
    }
    ChangesSince {
        from,
        checkpoint_created_at: created_at,
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::derive_client_id;
    use gasoline_core::config::CaptureConfig;
    use serde_json::json;

    fn store() -> CaptureStore {
        CaptureStore::new(CaptureConfig::default())
    }

    #[test]
    fn test_checkpoint_then_append() {
        let s = store();
        let mgr = CheckpointManager::new();
        mgr.create(&s, "start", "");
        let diff = mgr.changes_since(&s, "start", "", &[], 0);
        assert_eq!(diff.total_new(), 0);

        s.add_events(BufferKind::Logs, vec![json!({"level": "error"}); 3]);
        let diff = mgr.changes_since(&s, "start", "", &[BufferKind::Logs], 10);
        assert_eq!(diff.changes[&BufferKind::Logs].total_new, 3);
        assert_eq!(diff.changes[&BufferKind::Logs].records.len(), 3);
    }

    #[test]
    fn test_multi_client_isolation() {
        let s = store();
        let mgr = CheckpointManager::new();
        let alice = derive_client_id("/home/alice/project");
        let bob = derive_client_id("/home/bob/project");
        mgr.create(&s, "start", &alice);
        mgr.create(&s, "start", &bob);
        s.add_events(
            BufferKind::Logs,
            vec![json!({"level": "error", "message": "E1"}), json!({"level": "error", "message": "E2"})],
        );
        let a = mgr.changes_since(&s, "start", &alice, &[BufferKind::Logs], 0);
        let b = mgr.changes_since(&s, "start", &bob, &[BufferKind::Logs], 0);
        assert_eq!(a.changes[&BufferKind::Logs].total_new, 2);
        assert_eq!(b.changes[&BufferKind::Logs].total_new, 2);
        assert_eq!(a.from, "start");
        assert_eq!(mgr.count(), 2);
    }

    #[test]
    fn test_names_do_not_collide() {
        let s = store();
        let mgr = CheckpointManager::new();
        mgr.create(&s, "n", "aaaaaaaaaaaa");
        s.add_events(BufferKind::Actions, vec![json!({"type": "click"})]);
        mgr.create(&s, "n", "bbbbbbbbbbbb");
        let a = mgr.changes_since(&s, "n", "aaaaaaaaaaaa", &[BufferKind::Actions], 0);
        let b = mgr.changes_since(&s, "n", "bbbbbbbbbbbb", &[BufferKind::Actions], 0);
        assert_eq!(a.changes[&BufferKind::Actions].total_new, 1);
        assert_eq!(b.changes[&BufferKind::Actions].total_new, 0);
        assert!(!mgr.exists("n", "cccccccccccc"));
    }

    #[test]
    fn test_falls_back_to_global() {
        let s = store();
        let mgr = CheckpointManager::new();
        mgr.create(&s, "shared", "");
        s.add_events(BufferKind::Logs, vec![json!({})]);
        let diff = mgr.changes_since(&s, "shared", "abcdef012345", &[BufferKind::Logs], 0);
        assert_eq!(diff.from, "shared");
        assert_eq!(diff.changes[&BufferKind::Logs].total_new, 1);
    }

    #[test]
    fn test_unknown_checkpoint_is_epoch() {
        let s = store();
        let mgr = CheckpointManager::new();
        s.add_events(BufferKind::Logs, vec![json!({}); 2]);
        let diff = mgr.changes_since(&s, "missing", "", &[BufferKind::Logs], 0);
        assert_eq!(diff.from, UNKNOWN_CHECKPOINT);
        assert_eq!(diff.changes[&BufferKind::Logs].total_new, 2);
    }

    #[test]
    fn test_timestamp_checkpoint() {
        let s = store();
        let mgr = CheckpointManager::new();
        s.add_events(BufferKind::Logs, vec![json!({"message": "before"})]);
        let cut = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.add_events(BufferKind::Logs, vec![json!({"message": "after"}); 2]);

        let stamp = cut.to_rfc3339();
        let diff = mgr.changes_since(&s, &stamp, "", &[BufferKind::Logs], 10);
        assert_eq!(diff.from, stamp);
        assert_eq!(diff.checkpoint_created_at, Some(cut));
        assert_eq!(diff.changes[&BufferKind::Logs].total_new, 2);
        assert!(diff.changes[&BufferKind::Logs]
            .records
            .iter()
            .all(|r| r["message"] == "after"));

        let future = (cut + chrono::Duration::hours(1)).to_rfc3339();
        assert_eq!(mgr.changes_since(&s, &future, "", &[BufferKind::Logs], 0).total_new(), 0);
    }

    #[test]
    fn test_named_checkpoint_wins_over_timestamp_parse() {
        let s = store();
        let mgr = CheckpointManager::new();
        let stamp = "2020-01-01T00:00:00Z";
        s.add_events(BufferKind::Logs, vec![json!({})]);
        mgr.create(&s, stamp, "");
        s.add_events(BufferKind::Logs, vec![json!({})]);
        let diff = mgr.changes_since(&s, stamp, "", &[BufferKind::Logs], 0);
        assert_eq!(diff.changes[&BufferKind::Logs].total_new, 1);
        assert!(!mgr.exists("2021-01-01T00:00:00Z", ""));
    }

    #[test]
    fn test_unnamed_diff_advances_per_client() {
        let s = store();
        let mgr = CheckpointManager::new();
        s.add_events(BufferKind::Logs, vec![json!({}); 2]);

        let first = mgr.changes_since_last_call(&s, "aaaaaaaaaaaa", &[BufferKind::Logs], 0);
        assert_eq!(first.from, AUTO_CHECKPOINT);
        assert!(first.checkpoint_created_at.is_none());
        assert_eq!(first.changes[&BufferKind::Logs].total_new, 2);

        let again = mgr.changes_since_last_call(&s, "aaaaaaaaaaaa", &[BufferKind::Logs], 0);
        assert_eq!(again.changes[&BufferKind::Logs].total_new, 0);
        assert!(again.checkpoint_created_at.is_some());

        s.add_events(BufferKind::Logs, vec![json!({})]);
        let next = mgr.changes_since_last_call(&s, "aaaaaaaaaaaa", &[BufferKind::Logs], 10);
        assert_eq!(next.changes[&BufferKind::Logs].total_new, 1);
        assert_eq!(next.changes[&BufferKind::Logs].records.len(), 1);

        // Another client has its own position.
        let other = mgr.changes_since_last_call(&s, "bbbbbbbbbbbb", &[BufferKind::Logs], 0);
        assert_eq!(other.changes[&BufferKind::Logs].total_new, 3);

        mgr.forget_client("aaaaaaaaaaaa");
        let reset = mgr.changes_since_last_call(&s, "aaaaaaaaaaaa", &[BufferKind::Logs], 0);
        assert_eq!(reset.changes[&BufferKind::Logs].total_new, 3);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn test_per_client_fifo_cap() {
        let s = store();
        let mgr = CheckpointManager::new();
        for i in 0..(MAX_CHECKPOINTS_PER_CLIENT + 3) {
            mgr.create(&s, &format!("cp{}", i), "abcdef012345");
        }
        assert_eq!(mgr.count(), MAX_CHECKPOINTS_PER_CLIENT);
        assert!(!mgr.exists("cp0", "abcdef012345"));
        assert!(mgr.exists(&format!("cp{}", MAX_CHECKPOINTS_PER_CLIENT + 2), "abcdef012345"));
    }
}
