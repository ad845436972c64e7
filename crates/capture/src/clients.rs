//! Registry of connected agent clients, keyed by a hash of their working directory.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const MAX_CLIENTS: usize = 32;
pub const CLIENT_ID_LEN: usize = 12;
/// Entries touched this recently are only evicted when nothing older is left.
const EVICTION_GRACE_SECS: i64 = 5;

/// Derive the stable 12-hex client ID for a working directory. Empty in, empty out.
pub fn derive_client_id(cwd: &str) -> String {
    if cwd.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(cwd.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(CLIENT_ID_LEN);
    id
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientInfo {
    pub id: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Checkpoint namespace: `id + ":"`, or empty for the global namespace.
    #[serde(skip)]
    pub prefix: String,
}

impl ClientInfo {
    fn new(id: String, cwd: String) -> Self {
        let now = Utc::now();
        let prefix = checkpoint_prefix(&id);
        Self {
            id,
            cwd,
            created_at: now,
            last_seen_at: now,
            prefix,
        }
    }
}

pub fn checkpoint_prefix(id: &str) -> String {
    if id.is_empty() {
        String::new()
    } else {
        format!("{}:", id)
    }
}

struct Entry {
    info: ClientInfo,
    /// Access order for LRU; larger is more recent.
    seq: u64,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<String, Entry>,
    next_seq: u64,
}

impl RegistryInner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_one(&mut self, now: DateTime<Utc>) -> Option<String> {
        let grace = Duration::seconds(EVICTION_GRACE_SECS);
        let outside_grace = self
            .clients
            .values()
            .filter(|e| now - e.info.last_seen_at >= grace)
            .min_by_key(|e| e.seq)
            .map(|e| e.info.id.clone());
        let victim = outside_grace.or_else(|| {
            self.clients
                .values()
                .min_by_key(|e| e.seq)
                .map(|e| e.info.id.clone())
        })?;
        self.clients.remove(&victim);
        Some(victim)
    }
}

pub struct ClientRegistry {
    cap: usize,
    inner: Mutex<RegistryInner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(MAX_CLIENTS)
    }
}

impl ClientRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a working directory, or refresh it if already known.
    pub fn register(&self, cwd: &str) -> ClientInfo {
        let id = derive_client_id(cwd);
        let mut inner = self.lock();
        let seq = inner.bump();
        if let Some(entry) = inner.clients.get_mut(&id) {
            entry.seq = seq;
            entry.info.last_seen_at = Utc::now();
            return entry.info.clone();
        }

        let info = ClientInfo::new(id.clone(), cwd.to_string());
        inner.clients.insert(id, Entry { info: info.clone(), seq });
        while inner.clients.len() > self.cap {
            match inner.evict_one(Utc::now()) {
                Some(evicted) => debug!(client_id = %evicted, "Evicted least recently used client"),
                None => break,
            }
        }
        info
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.lock().clients.remove(id).is_some()
    }

    /// Look up a client and mark it as recently used.
    pub fn get(&self, id: &str) -> Option<ClientInfo> {
        let mut inner = self.lock();
        let seq = inner.bump();
        let entry = inner.clients.get_mut(id)?;
        entry.seq = seq;
        entry.info.last_seen_at = Utc::now();
        Some(entry.info.clone())
    }

    /// Never fails: unknown IDs get a synthetic state carrying their namespace prefix.
    pub fn get_or_default(&self, id: &str) -> ClientInfo {
        self.get(id)
            .unwrap_or_else(|| ClientInfo::new(id.to_string(), String::new()))
    }

    pub fn touch(&self, id: &str) {
        let _ = self.get(id);
    }

    pub fn count(&self) -> usize {
        self.lock().clients.len()
    }

    /// All clients, most recently used first.
    pub fn list(&self) -> Vec<ClientInfo> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.clients.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| e.info.clone()).collect()
    }
}
