//! Capture buffers plus the memory/rate governor, under one reader-writer lock.

use chrono::{DateTime, Utc};
use gasoline_core::config::CaptureConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::circuit::{
    CircuitHealth, Governor, MemoryLimits, RateLimitResponse, Rejection, Transition,
};
use crate::ring::RingBuffer;

pub const DEFAULT_QUERY_LIMIT: usize = 20;
const EVICTION_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    Logs,
    NetworkBodies,
    WebsocketEvents,
    Actions,
    HttpDebug,
}

impl BufferKind {
    pub const ALL: [BufferKind; 5] = [
        BufferKind::Logs,
        BufferKind::NetworkBodies,
        BufferKind::WebsocketEvents,
        BufferKind::Actions,
        BufferKind::HttpDebug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::Logs => "logs",
            BufferKind::NetworkBodies => "network_bodies",
            BufferKind::WebsocketEvents => "websocket_events",
            BufferKind::Actions => "actions",
            BufferKind::HttpDebug => "http_debug",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logs" | "console" => Some(BufferKind::Logs),
            "network_bodies" | "network" => Some(BufferKind::NetworkBodies),
            "websocket_events" | "websocket" | "ws" => Some(BufferKind::WebsocketEvents),
            "actions" => Some(BufferKind::Actions),
            "http_debug" => Some(BufferKind::HttpDebug),
            _ => None,
        }
    }

    /// Fixed per-record bookkeeping cost added to the string payload size.
    fn overhead(&self) -> u64 {
        match self {
            BufferKind::Logs => 100,
            BufferKind::NetworkBodies => 300,
            BufferKind::WebsocketEvents => 200,
            BufferKind::Actions => 500,
            BufferKind::HttpDebug => 300,
        }
    }
}

/// Filter for `CaptureStore::query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub limit: Option<usize>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub status_min: Option<u64>,
    pub status_max: Option<u64>,
    pub level: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl QueryFilter {
    fn matches(&self, record: &Value, at: &DateTime<Utc>) -> bool {
        if let Some(since) = self.since {
            if *at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if *at > until {
                return false;
            }
        }
        if let Some(url) = &self.url {
            let hit = record
                .get("url")
                .and_then(Value::as_str)
                .map(|u| u.contains(url.as_str()))
                .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        if let Some(method) = &self.method {
            let hit = record
                .get("method")
                .and_then(Value::as_str)
                .map(|m| m.eq_ignore_ascii_case(method))
                .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        if self.status_min.is_some() || self.status_max.is_some() {
            let Some(status) = record.get("status").and_then(Value::as_u64) else {
                return false;
            };
            if self.status_min.is_some_and(|min| status < min) {
                return false;
            }
            if self.status_max.is_some_and(|max| status > max) {
                return false;
            }
        }
        if let Some(level) = &self.level {
            let hit = record
                .get("level")
                .and_then(Value::as_str)
                .map(|l| l.eq_ignore_ascii_case(level))
                .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Position of one buffer at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMark {
    pub total_added: u64,
    pub newest_at: Option<DateTime<Utc>>,
}

/// Result of `add_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddOutcome {
    pub added: usize,
    pub evicted: usize,
    pub truncated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub count: usize,
    pub capacity: usize,
    pub total_added: u64,
    pub bytes: u64,
}

struct CaptureInner {
    buffers: BTreeMap<BufferKind, RingBuffer<Value>>,
    governor: Governor,
    minimal_mode: bool,
    last_eviction: Option<Instant>,
    simulated_memory: Option<u64>,
}

impl CaptureInner {
    fn buffer(&self, kind: BufferKind) -> Option<&RingBuffer<Value>> {
        self.buffers.get(&kind)
    }

    fn memory(&self) -> u64 {
        if let Some(simulated) = self.simulated_memory {
            return simulated;
        }
        self.buffers.values().map(|b| b.bytes()).sum()
    }
}

pub struct CaptureStore {
    config: CaptureConfig,
    inner: RwLock<CaptureInner>,
}

impl CaptureStore {
    pub fn new(config: CaptureConfig) -> Self {
        let mut buffers = BTreeMap::new();
        for kind in BufferKind::ALL {
            buffers.insert(kind, RingBuffer::new(Self::base_cap(&config, kind)));
        }
        let governor = Governor::new(config.rate_threshold, Instant::now());
        Self {
            config,
            inner: RwLock::new(CaptureInner {
                buffers,
                governor,
                minimal_mode: false,
                last_eviction: None,
                simulated_memory: None,
            }),
        }
    }

    fn base_cap(config: &CaptureConfig, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Logs => config.max_logs,
            BufferKind::NetworkBodies => config.max_network_bodies,
            BufferKind::WebsocketEvents => config.max_ws_events,
            BufferKind::Actions => config.max_actions,
            BufferKind::HttpDebug => config.max_http_debug,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CaptureInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CaptureInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn limits(&self) -> MemoryLimits {
        MemoryLimits {
            hard: self.config.memory_hard_limit,
            close: self.config.memory_close_limit,
        }
    }

    /// Append records in order, advancing the kind's monotonic counter by `records.len()`.
    pub fn add_events(&self, kind: BufferKind, records: Vec<Value>) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        if records.is_empty() {
            return outcome;
        }
        let now = Utc::now();
        let mut inner = self.write();
        let n = records.len() as u64;

        for mut record in records {
            if kind == BufferKind::NetworkBodies && self.truncate_bodies(&mut record) {
                outcome.truncated += 1;
            }
            let size = estimate_size(&record) + kind.overhead();
            if let Some(buffer) = inner.buffers.get_mut(&kind) {
                outcome.evicted += buffer.push(record, size, now);
                outcome.added += 1;
            }
        }

        if kind == BufferKind::NetworkBodies {
            outcome.evicted += self.enforce_network_body_limit(&mut inner);
        }
        outcome.evicted += self.enforce_memory(&mut inner, Instant::now());

        let memory = inner.memory();
        let limits = self.limits();
        if let Some(t) = inner.governor.record_events(n, Instant::now(), memory, limits) {
            log_transition(t, memory);
        }
        outcome
    }

    fn truncate_bodies(&self, record: &mut Value) -> bool {
        let Some(obj) = record.as_object_mut() else {
            return false;
        };
        let req = truncate_field(obj, "request_body", "request_truncated", self.config.max_request_body);
        let resp = truncate_field(obj, "response_body", "response_truncated", self.config.max_response_body);
        req || resp
    }

    fn enforce_network_body_limit(&self, inner: &mut CaptureInner) -> usize {
        let limit = self.config.network_body_memory_limit;
        let Some(buffer) = inner.buffers.get_mut(&BufferKind::NetworkBodies) else {
            return 0;
        };
        let mut evicted = 0;
        while buffer.bytes() > limit && !buffer.is_empty() {
            evicted += buffer.evict_oldest(1);
        }
        evicted
    }

    fn enforce_memory(&self, inner: &mut CaptureInner, now: Instant) -> usize {
        let total = inner.memory();
        if total <= self.config.memory_soft_limit {
            return 0;
        }

        if total > self.config.memory_critical_limit {
            warn!(memory_bytes = total, "Capture memory critical, clearing buffers and entering minimal mode");
            let mut evicted = 0;
            for buffer in inner.buffers.values_mut() {
                evicted += buffer.len();
                buffer.clear();
            }
            if !inner.minimal_mode {
                inner.minimal_mode = true;
                for (kind, buffer) in inner.buffers.iter_mut() {
                    buffer.set_capacity(Self::base_cap(&self.config, *kind) / 2);
                }
            }
            inner.last_eviction = Some(now);
            return evicted;
        }

        if inner
            .last_eviction
            .is_some_and(|t| now.saturating_duration_since(t) < EVICTION_COOLDOWN)
        {
            return 0;
        }

        let (limit, ratio) = if total > self.config.memory_hard_limit {
            (self.config.memory_hard_limit, 2)
        } else {
            (self.config.memory_soft_limit, 4)
        };

        // Repeatedly shave the currently largest buffer.
        let mut evicted = 0;
        while inner.memory() > limit {
            let largest = inner
                .buffers
                .iter()
                .filter(|(_, b)| !b.is_empty())
                .max_by_key(|(_, b)| b.bytes())
                .map(|(k, _)| *k);
            let Some(kind) = largest else { break };
            if let Some(buffer) = inner.buffers.get_mut(&kind) {
                let n = buffer.len().div_ceil(ratio);
                evicted += buffer.evict_oldest(n);
            }
            if inner.simulated_memory.is_some() {
                break;
            }
        }
        inner.last_eviction = Some(now);
        if evicted > 0 {
            info!(evicted, memory_bytes = inner.memory(), "Evicted capture records over memory limit");
        }
        evicted
    }

    /// Periodic memory check, run by the daemon every few seconds.
    pub fn check_memory(&self) -> usize {
        let mut inner = self.write();
        self.enforce_memory(&mut inner, Instant::now())
    }

    /// Close an expired rate window even when no events arrive.
    pub fn tick(&self) -> Option<Transition> {
        let mut inner = self.write();
        let memory = inner.memory();
        let t = inner.governor.tick_if_expired(Instant::now(), memory, self.limits());
        if let Some(t) = t {
            log_transition(t, memory);
        }
        t
    }

    pub fn check_admission(&self) -> Option<Rejection> {
        let inner = self.read();
        inner
            .governor
            .check_admission(Instant::now(), inner.memory(), self.limits())
    }

    pub fn rate_limit_response(&self) -> RateLimitResponse {
        self.read().governor.rate_limit_response(Instant::now())
    }

    pub fn health(&self) -> CircuitHealth {
        let inner = self.read();
        inner.governor.health(Instant::now(), inner.memory())
    }

    pub fn minimal_mode(&self) -> bool {
        self.read().minimal_mode
    }

    pub fn memory_bytes(&self) -> u64 {
        self.read().memory()
    }

    pub fn set_simulated_memory(&self, bytes: Option<u64>) {
        self.write().simulated_memory = bytes;
    }

    /// Newest-first records matching `filter`, capped at the buffer's capacity.
    pub fn query(&self, kind: BufferKind, filter: &QueryFilter) -> Vec<Value> {
        let inner = self.read();
        let Some(buffer) = inner.buffer(kind) else {
            return Vec::new();
        };
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, buffer.capacity());
        buffer
            .iter_newest()
            .filter(|(record, at)| filter.matches(record, at))
            .take(limit)
            .map(|(record, _)| record.clone())
            .collect()
    }

    /// Newest-first records appended after `mark`, at most `limit`.
    pub fn added_since(&self, kind: BufferKind, since_total: u64, limit: usize) -> Vec<Value> {
        let inner = self.read();
        inner
            .buffer(kind)
            .map(|b| b.added_since(since_total).take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark(&self, kind: BufferKind) -> BufferMark {
        let inner = self.read();
        inner
            .buffer(kind)
            .map(|b| BufferMark {
                total_added: b.total_added(),
                newest_at: b.newest_time(),
            })
            .unwrap_or(BufferMark { total_added: 0, newest_at: None })
    }

    pub fn marks(&self) -> BTreeMap<BufferKind, BufferMark> {
        let inner = self.read();
        inner
            .buffers
            .iter()
            .map(|(kind, b)| {
                (*kind, BufferMark { total_added: b.total_added(), newest_at: b.newest_time() })
            })
            .collect()
    }

    /// Marks as they stood at `t`, reconstructed from insertion times.
    pub fn marks_at(&self, t: DateTime<Utc>) -> BTreeMap<BufferKind, BufferMark> {
        let inner = self.read();
        inner
            .buffers
            .iter()
            .map(|(kind, b)| {
                let newest_at = b.iter_newest().map(|(_, at)| *at).find(|at| *at <= t);
                (*kind, BufferMark { total_added: b.total_at(t), newest_at })
            })
            .collect()
    }

    /// Monotonic counters per kind.
    pub fn counters(&self) -> BTreeMap<BufferKind, u64> {
        let inner = self.read();
        inner.buffers.iter().map(|(k, b)| (*k, b.total_added())).collect()
    }

    pub fn stats(&self) -> BTreeMap<BufferKind, BufferStats> {
        let inner = self.read();
        inner
            .buffers
            .iter()
            .map(|(k, b)| {
                (
                    *k,
                    BufferStats {
                        count: b.len(),
                        capacity: b.capacity(),
                        total_added: b.total_added(),
                        bytes: b.bytes(),
                    },
                )
            })
            .collect()
    }

    /// Drop buffered records. Counters keep their values.
    pub fn clear(&self, kind: Option<BufferKind>) -> usize {
        let mut inner = self.write();
        let mut cleared = 0;
        for (k, buffer) in inner.buffers.iter_mut() {
            if kind.map_or(true, |want| want == *k) {
                cleared += buffer.len();
                buffer.clear();
            }
        }
        cleared
    }
}

fn log_transition(t: Transition, memory: u64) {
    match t {
        Transition::Opened(reason) => {
            warn!(reason = reason.as_str(), memory_bytes = memory, "Circuit breaker opened");
        }
        Transition::Closed => info!(memory_bytes = memory, "Circuit breaker closed"),
    }
}

fn truncate_field(obj: &mut Map<String, Value>, field: &str, flag: &str, max: usize) -> bool {
    let Some(Value::String(body)) = obj.get_mut(field) else {
        return false;
    };
    if body.len() <= max {
        return false;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    obj.insert(flag.to_string(), Value::Bool(true));
    true
}

/// Sum of string payload bytes in a record, keys included.
pub fn estimate_size(value: &Value) -> u64 {
    match value {
        Value::String(s) => s.len() as u64,
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() as u64 + estimate_size(v))
            .sum(),
        _ => 8,
    }
}
