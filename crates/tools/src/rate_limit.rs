//! Sliding-window limiter for `tools/call`.
//!
//! Keeps the timestamps of accepted calls inside the window; a call is
//! rejected once the window already holds `capacity` of them.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            calls: VecDeque::new(),
        }
    }

    fn compact(&mut self, now: Instant) {
        while let Some(first) = self.calls.front() {
            if now.saturating_duration_since(*first) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        self.compact(now);
        if self.calls.len() >= self.capacity {
            return false;
        }
        self.calls.push_back(now);
        true
    }
}

/// Thread-safe wrapper around `RateLimiter`.
pub struct ToolRateLimiter(Mutex<RateLimiter>);

impl ToolRateLimiter {
    pub fn new(calls_per_minute: usize) -> Self {
        Self(Mutex::new(RateLimiter::new(calls_per_minute, DEFAULT_WINDOW)))
    }

    pub fn allow(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow_at(Instant::now())
    }

    pub fn capacity(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_at_capacity() {
        let mut rl = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        assert!(rl.allow_at(t0));
        assert!(rl.allow_at(t0));
        assert!(!rl.allow_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_window_slides() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        assert!(rl.allow_at(t0 + Duration::from_secs(30)));
        assert!(!rl.allow_at(t0 + Duration::from_secs(59)));
        // first call has left the window
        assert!(rl.allow_at(t0 + Duration::from_secs(60)));
        assert!(!rl.allow_at(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        for i in 1..5 {
            assert!(!rl.allow_at(t0 + Duration::from_secs(i)));
        }
        assert!(rl.allow_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_shared_limiter() {
        let rl = ToolRateLimiter::new(500);
        assert_eq!(rl.capacity(), 500);
        assert!(rl.allow());
    }
}
