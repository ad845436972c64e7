//! Passive telemetry: what accumulated since this client's previous tool call.

use gasoline_capture::{BufferKind, Capture};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Auto,
    Full,
}

impl TelemetryMode {
    /// Unknown strings fall back to `auto`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => TelemetryMode::Off,
            "full" => TelemetryMode::Full,
            _ => TelemetryMode::Auto,
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(TelemetryMode::Off),
            "auto" => Some(TelemetryMode::Auto),
            "full" => Some(TelemetryMode::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Off => "off",
            TelemetryMode::Auto => "auto",
            TelemetryMode::Full => "full",
        }
    }
}

/// Monotonic counters sampled at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySummary {
    pub errors: u64,
    pub logs: u64,
    pub network: u64,
    pub websocket: u64,
    pub actions: u64,
    pub alerts: u64,
}

impl TelemetrySummary {
    pub fn sample(capture: &Capture) -> Self {
        let counters = capture.store.counters();
        let get = |k: BufferKind| counters.get(&k).copied().unwrap_or(0);
        Self {
            errors: capture.errors_total(),
            logs: get(BufferKind::Logs),
            network: get(BufferKind::NetworkBodies),
            websocket: get(BufferKind::WebsocketEvents),
            actions: get(BufferKind::Actions),
            alerts: capture.alerts.total_added(),
        }
    }

    /// Field-wise difference, clamped at zero.
    pub fn delta_since(&self, earlier: &Self) -> Self {
        Self {
            errors: self.errors.saturating_sub(earlier.errors),
            logs: self.logs.saturating_sub(earlier.logs),
            network: self.network.saturating_sub(earlier.network),
            websocket: self.websocket.saturating_sub(earlier.websocket),
            actions: self.actions.saturating_sub(earlier.actions),
            alerts: self.alerts.saturating_sub(earlier.alerts),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Telemetry {
    mode: RwLock<TelemetryMode>,
    cursors: Mutex<HashMap<String, TelemetrySummary>>,
}

impl Telemetry {
    pub fn new(mode: TelemetryMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> TelemetryMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: TelemetryMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<String, TelemetrySummary>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the client's cursor to `now` and return the delta from the previous one.
    ///
    /// The first call for a client reports zero.
    pub fn advance(&self, client_id: &str, now: TelemetrySummary) -> TelemetrySummary {
        let mut cursors = self.cursors();
        let delta = match cursors.get(client_id) {
            Some(prev) => now.delta_since(prev),
            None => TelemetrySummary::default(),
        };
        cursors.insert(client_id.to_string(), now);
        delta
    }

    /// The summary to attach to a response, if any, under `mode`.
    pub fn summary_for(
        &self,
        client_id: &str,
        now: TelemetrySummary,
        mode: TelemetryMode,
    ) -> Option<TelemetrySummary> {
        if mode == TelemetryMode::Off {
            return None;
        }
        let delta = self.advance(client_id, now);
        match mode {
            TelemetryMode::Full => Some(delta),
            TelemetryMode::Auto if !delta.is_zero() => Some(delta),
            _ => None,
        }
    }

    pub fn forget(&self, client_id: &str) {
        self.cursors().remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(logs: u64, errors: u64) -> TelemetrySummary {
        TelemetrySummary { logs, errors, ..Default::default() }
    }

    #[test]
    fn test_first_call_is_zero() {
        let t = Telemetry::new(TelemetryMode::Full);
        assert_eq!(t.advance("a", sample(10, 2)), TelemetrySummary::default());
        assert_eq!(t.advance("a", sample(15, 3)), sample(5, 1));
    }

    #[test]
    fn test_cursors_are_per_client() {
        let t = Telemetry::new(TelemetryMode::Auto);
        t.advance("a", sample(0, 0));
        t.advance("b", sample(0, 0));
        assert_eq!(t.advance("a", sample(4, 0)).logs, 4);
        assert_eq!(t.advance("b", sample(6, 0)).logs, 6);
    }

    #[test]
    fn test_negative_delta_clamped() {
        let t = Telemetry::new(TelemetryMode::Full);
        t.advance("a", sample(10, 0));
        assert_eq!(t.advance("a", sample(3, 0)).logs, 0);
    }

    #[test]
    fn test_auto_only_when_changed() {
        let t = Telemetry::new(TelemetryMode::Auto);
        assert!(t.summary_for("a", sample(1, 0), TelemetryMode::Auto).is_none());
        assert!(t.summary_for("a", sample(1, 0), TelemetryMode::Auto).is_none());
        assert_eq!(t.summary_for("a", sample(2, 0), TelemetryMode::Auto), Some(sample(1, 0)));
        assert_eq!(t.summary_for("a", sample(2, 0), TelemetryMode::Full), Some(TelemetrySummary::default()));
        assert!(t.summary_for("a", sample(9, 0), TelemetryMode::Off).is_none());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(TelemetryMode::parse("FULL"), TelemetryMode::Full);
        assert_eq!(TelemetryMode::parse("bogus"), TelemetryMode::Auto);
        assert_eq!(TelemetryMode::try_parse("bogus"), None);
        let t = Telemetry::new(TelemetryMode::Auto);
        t.set_mode(TelemetryMode::Off);
        assert_eq!(t.mode().as_str(), "off");
    }
}
