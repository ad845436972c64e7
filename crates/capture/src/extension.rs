//! Browser extension connection state, as inferred from its polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

/// The extension counts as connected while it polled within this window.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(10);
/// A poll gap longer than this is logged as a reconnect.
pub const RECONNECT_GAP: Duration = Duration::from_secs(3);
pub const MAX_DRAW_SESSIONS: usize = 10;

/// Settings the extension reports on every sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtensionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_title: Option<String>,
}

/// One command outcome carried in a sync request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncCommandResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub extension_version: Option<String>,
    #[serde(default)]
    pub settings: Option<ExtensionSettings>,
    #[serde(default)]
    pub command_results: Vec<SyncCommandResult>,
}

/// What a poll did to the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Connected,
    Reconnected,
    Continued,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExtensionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_ms_ago: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_version: Option<String>,
    pub settings: ExtensionSettings,
    pub reconnects: u64,
}

/// Annotation session submitted from the extension's draw mode.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DrawSession {
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Default)]
struct Inner {
    last_poll: Option<Instant>,
    was_connected: bool,
    session_id: Option<String>,
    version: Option<String>,
    settings: ExtensionSettings,
    reconnects: u64,
    draw_sessions: VecDeque<DrawSession>,
}

impl Inner {
    fn connected_at(&self, now: Instant) -> bool {
        self.last_poll
            .is_some_and(|t| now.saturating_duration_since(t) <= CONNECTED_WINDOW)
    }
}

#[derive(Default)]
pub struct ExtensionState {
    inner: Mutex<Inner>,
}

impl ExtensionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note a poll from the extension.
    pub fn record_poll(
        &self,
        session_id: Option<String>,
        version: Option<String>,
        settings: Option<ExtensionSettings>,
    ) -> PollEvent {
        self.record_poll_at(Instant::now(), session_id, version, settings)
    }

    fn record_poll_at(
        &self,
        now: Instant,
        session_id: Option<String>,
        version: Option<String>,
        settings: Option<ExtensionSettings>,
    ) -> PollEvent {
        let mut inner = self.lock();
        let event = match inner.last_poll {
            None => PollEvent::Connected,
            Some(_) if !inner.was_connected => PollEvent::Connected,
            Some(last) if now.saturating_duration_since(last) > RECONNECT_GAP => PollEvent::Reconnected,
            Some(_) => PollEvent::Continued,
        };
        let new_session = session_id.is_some() && session_id != inner.session_id;
        inner.last_poll = Some(now);
        inner.was_connected = true;
        if session_id.is_some() {
            inner.session_id = session_id;
        }
        if version.is_some() {
            inner.version = version;
        }
        if let Some(settings) = settings {
            inner.settings = settings;
        }
        match event {
            PollEvent::Connected => {
                info!(version = ?inner.version, "Extension connected");
            }
            PollEvent::Reconnected => {
                inner.reconnects += 1;
                info!(reconnects = inner.reconnects, new_session, "Extension reconnected after poll gap");
            }
            PollEvent::Continued => {}
        }
        event
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected_at(Instant::now())
    }

    /// Returns true exactly once when a previously connected extension has gone quiet.
    pub fn check_disconnect(&self) -> bool {
        self.check_disconnect_at(Instant::now())
    }

    fn check_disconnect_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.was_connected && !inner.connected_at(now) {
            inner.was_connected = false;
            info!("Extension disconnected");
            return true;
        }
        false
    }

    pub fn settings(&self) -> ExtensionSettings {
        self.lock().settings.clone()
    }

    /// Only an explicit `pilot_enabled=false` from the extension counts as disabled.
    pub fn pilot_disabled(&self) -> bool {
        self.lock().settings.pilot_enabled == Some(false)
    }

    pub fn status(&self) -> ExtensionStatus {
        let inner = self.lock();
        let now = Instant::now();
        ExtensionStatus {
            connected: inner.connected_at(now),
            last_poll_ms_ago: inner
                .last_poll
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            session_id: inner.session_id.clone(),
            extension_version: inner.version.clone(),
            settings: inner.settings.clone(),
            reconnects: inner.reconnects,
        }
    }

    /// Short `pilot=... extension=... tracked_tab=...` line used in timeout hints.
    pub fn diagnostic_hint(&self) -> String {
        let status = self.status();
        let pilot = match status.settings.pilot_enabled {
            Some(true) => "enabled",
            Some(false) => "disabled",
            None => "unknown",
        };
        let tab = status
            .settings
            .tracked_tab_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "pilot={} extension={} tracked_tab={}",
            pilot,
            if status.connected { "connected" } else { "disconnected" },
            tab
        )
    }

    pub fn add_draw_session(&self, payload: Value) -> usize {
        let mut inner = self.lock();
        inner.draw_sessions.push_back(DrawSession {
            received_at: Utc::now(),
            payload,
        });
        while inner.draw_sessions.len() > MAX_DRAW_SESSIONS {
            inner.draw_sessions.pop_front();
        }
        inner.draw_sessions.len()
    }

    /// Draw sessions, newest first.
    pub fn draw_sessions(&self) -> Vec<DrawSession> {
        self.lock().draw_sessions.iter().rev().cloned().collect()
    }
}
