//! Ingest rate window and circuit breaker.
//!
//! The window is a 1-second tumbling counter. Each time a window closes the
//! breaker is re-evaluated: five consecutive hot windows (or memory above the
//! hard limit) open it, and it only closes once the rate has been quiet for
//! ten seconds with memory back under the close limit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(1);
pub const STREAK_TO_OPEN: u32 = 5;
pub const QUIET_TO_CLOSE: Duration = Duration::from_secs(10);
pub const RETRY_AFTER_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitReason {
    RateExceeded,
    MemoryExceeded,
}

impl CircuitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitReason::RateExceeded => "rate_exceeded",
            CircuitReason::MemoryExceeded => "memory_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CircuitOpen,
    MemoryExceeded,
    RateExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened(CircuitReason),
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub hard: u64,
    pub close: u64,
}

/// Health view of the breaker, served by `GET /health`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitHealth {
    pub circuit_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<String>,
    pub current_rate: u64,
    pub memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of a 429 ingest rejection.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitResponse {
    pub error: &'static str,
    pub message: String,
    pub retry_after_ms: u64,
    pub circuit_open: bool,
    pub current_rate: u64,
    pub threshold: u64,
}

#[derive(Debug)]
pub struct Governor {
    threshold: u64,
    window_start: Instant,
    window_count: u64,
    streak: u32,
    last_below_threshold: Option<Instant>,
    circuit_open: bool,
    opened_at: Option<DateTime<Utc>>,
    reason: Option<CircuitReason>,
}

impl Governor {
    pub fn new(threshold: u64, now: Instant) -> Self {
        Self {
            threshold,
            window_start: now,
            window_count: 0,
            streak: 0,
            last_below_threshold: None,
            circuit_open: false,
            opened_at: None,
            reason: None,
        }
    }

    fn window_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) > RATE_WINDOW
    }

    /// Count `n` newly ingested events, closing the window first if it expired.
    pub fn record_events(
        &mut self,
        n: u64,
        now: Instant,
        memory: u64,
        limits: MemoryLimits,
    ) -> Option<Transition> {
        let transition = self.tick_if_expired(now, memory, limits);
        self.window_count += n;
        transition
    }

    /// Close the current window if it has run past one second.
    pub fn tick_if_expired(
        &mut self,
        now: Instant,
        memory: u64,
        limits: MemoryLimits,
    ) -> Option<Transition> {
        if !self.window_expired(now) {
            return None;
        }
        if self.window_count > self.threshold {
            self.streak += 1;
            self.last_below_threshold = None;
        } else {
            self.streak = 0;
            if self.last_below_threshold.is_none() {
                self.last_below_threshold = Some(now);
            }
        }
        let transition = self.evaluate(now, memory, limits);
        self.window_count = 0;
        self.window_start = now;
        transition
    }

    fn evaluate(&mut self, now: Instant, memory: u64, limits: MemoryLimits) -> Option<Transition> {
        if !self.circuit_open {
            let reason = if self.streak >= STREAK_TO_OPEN {
                Some(CircuitReason::RateExceeded)
            } else if memory > limits.hard {
                Some(CircuitReason::MemoryExceeded)
            } else {
                None
            };
            if let Some(reason) = reason {
                self.circuit_open = true;
                self.opened_at = Some(Utc::now());
                self.reason = Some(reason);
                return Some(Transition::Opened(reason));
            }
            return None;
        }

        let quiet_long_enough = self
            .last_below_threshold
            .map(|t| now.saturating_duration_since(t) >= QUIET_TO_CLOSE)
            .unwrap_or(false);
        if self.streak == 0 && quiet_long_enough && memory <= limits.close {
            self.circuit_open = false;
            self.opened_at = None;
            self.reason = None;
            self.streak = 0;
            self.last_below_threshold = None;
            return Some(Transition::Closed);
        }
        None
    }

    /// Admission priority: open circuit, then memory, then the live window.
    pub fn check_admission(&self, now: Instant, memory: u64, limits: MemoryLimits) -> Option<Rejection> {
        if self.circuit_open {
            return Some(Rejection::CircuitOpen);
        }
        if memory > limits.hard {
            return Some(Rejection::MemoryExceeded);
        }
        if !self.window_expired(now) && self.window_count > self.threshold {
            return Some(Rejection::RateExceeded);
        }
        None
    }

    pub fn current_rate(&self, now: Instant) -> u64 {
        if self.window_expired(now) {
            0
        } else {
            self.window_count
        }
    }

    pub fn is_open(&self) -> bool {
        self.circuit_open
    }

    pub fn reason(&self) -> Option<CircuitReason> {
        self.reason
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn health(&self, now: Instant, memory: u64) -> CircuitHealth {
        CircuitHealth {
            circuit_open: self.circuit_open,
            opened_at: self.opened_at.map(|t| t.to_rfc3339()),
            current_rate: self.current_rate(now),
            memory_bytes: memory,
            reason: self.reason.map(|r| r.as_str().to_string()),
        }
    }

    pub fn rate_limit_response(&self, now: Instant) -> RateLimitResponse {
        RateLimitResponse {
            error: "rate_limited",
            message: format!(
                "Server receiving >{} events/sec. Retry after backoff.",
                self.threshold
            ),
            retry_after_ms: RETRY_AFTER_MS,
            circuit_open: self.circuit_open,
            current_rate: self.current_rate(now),
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const LIMITS: MemoryLimits = MemoryLimits { hard: 50 * MIB, close: 30 * MIB };

    fn secs(base: Instant, s: f64) -> Instant {
        base + Duration::from_secs_f64(s)
    }

    /// Drive one event batch per 1.1s window.
    fn hot_windows(gov: &mut Governor, base: Instant, start: u32, count: u32, rate: u64) -> Vec<Transition> {
        let mut out = Vec::new();
        for i in start..start + count {
            if let Some(t) = gov.record_events(rate, secs(base, i as f64 * 1.1), 0, LIMITS) {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn test_opens_after_five_hot_windows() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        // First batch lands in the initial window; each later batch closes the previous one.
        let transitions = hot_windows(&mut gov, base, 1, 5, 1200);
        assert!(transitions.is_empty());
        assert!(!gov.is_open());

        let t = gov.record_events(1200, secs(base, 6.6), 0, LIMITS);
        assert_eq!(t, Some(Transition::Opened(CircuitReason::RateExceeded)));
        assert!(gov.is_open());
        assert_eq!(gov.check_admission(secs(base, 6.7), 0, LIMITS), Some(Rejection::CircuitOpen));
        let health = gov.health(secs(base, 6.7), 0);
        assert_eq!(health.reason.as_deref(), Some("rate_exceeded"));
        assert!(health.opened_at.is_some());
    }

    #[test]
    fn test_four_hot_windows_do_not_open() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        hot_windows(&mut gov, base, 1, 4, 1500);
        gov.record_events(10, secs(base, 5.5), 0, LIMITS);
        gov.record_events(10, secs(base, 6.6), 0, LIMITS);
        assert!(!gov.is_open());
    }

    #[test]
    fn test_closes_after_quiet_period() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        hot_windows(&mut gov, base, 1, 6, 1200);
        assert!(gov.is_open());

        // Closes the last hot window.
        assert_eq!(gov.tick_if_expired(secs(base, 8.0), 0, LIMITS), None);
        // First quiet window starts the quiet clock.
        assert_eq!(gov.tick_if_expired(secs(base, 9.2), 0, LIMITS), None);
        assert_eq!(gov.tick_if_expired(secs(base, 15.0), 0, LIMITS), None);
        assert!(gov.is_open());
        let t = gov.tick_if_expired(secs(base, 19.5), 0, LIMITS);
        assert_eq!(t, Some(Transition::Closed));
        assert!(!gov.is_open());
        assert!(gov.health(secs(base, 19.6), 0).reason.is_none());
        assert_eq!(gov.check_admission(secs(base, 19.6), 0, LIMITS), None);
    }

    #[test]
    fn test_stays_open_while_memory_high() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        hot_windows(&mut gov, base, 1, 6, 1200);
        gov.tick_if_expired(secs(base, 8.0), 40 * MIB, LIMITS);
        gov.tick_if_expired(secs(base, 9.2), 40 * MIB, LIMITS);
        assert_eq!(gov.tick_if_expired(secs(base, 19.5), 40 * MIB, LIMITS), None);
        assert!(gov.is_open());
        assert_eq!(gov.tick_if_expired(secs(base, 20.8), 10 * MIB, LIMITS), Some(Transition::Closed));
    }

    #[test]
    fn test_memory_over_hard_limit_opens_on_tick() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        let t = gov.tick_if_expired(secs(base, 1.5), 60 * MIB, LIMITS);
        assert_eq!(t, Some(Transition::Opened(CircuitReason::MemoryExceeded)));
    }

    #[test]
    fn test_admission_priority() {
        let base = Instant::now();
        let mut gov = Governor::new(1000, base);
        assert_eq!(gov.check_admission(base, 0, LIMITS), None);
        assert_eq!(gov.check_admission(base, 51 * MIB, LIMITS), Some(Rejection::MemoryExceeded));
        gov.record_events(1001, secs(base, 0.2), 0, LIMITS);
        assert_eq!(gov.check_admission(secs(base, 0.3), 0, LIMITS), Some(Rejection::RateExceeded));
        // Expired window no longer counts against admission.
        assert_eq!(gov.check_admission(secs(base, 2.0), 0, LIMITS), None);
    }

    #[test]
    fn test_rate_limit_response_shape() {
        let base = Instant::now();
        let gov = Governor::new(1000, base);
        let body = serde_json::to_value(gov.rate_limit_response(base)).unwrap();
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["retry_after_ms"], 1000);
        assert_eq!(body["threshold"], 1000);
        assert_eq!(body["circuit_open"], false);
        assert!(body["message"].as_str().unwrap().contains(">1000 events/sec"));
    }

    #[test]
    fn test_health_omits_closed_fields() {
        let base = Instant::now();
        let gov = Governor::new(1000, base);
        let body = serde_json::to_value(gov.health(base, 42)).unwrap();
        assert!(body.get("opened_at").is_none());
        assert!(body.get("reason").is_none());
        assert_eq!(body["memory_bytes"], 42);
    }
}
