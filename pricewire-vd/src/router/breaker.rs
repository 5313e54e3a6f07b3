//! Per-model circuit breaker
//!
//! Two open signals are tracked: a consecutive-failure count (from the
//! performance record) and a sliding window of error timestamps. An open
//! circuit becomes eligible for half-open once the window duration has
//! elapsed since it opened; the next success closes it, the next failure
//! re-opens it.
//!
//! All time-dependent methods take explicit epoch-millis timestamps so the
//! transitions are testable without sleeping.

use pricewire_common::models::{CircuitBreakerState, CircuitState};
use std::collections::VecDeque;

/// Consecutive failures that open the circuit regardless of the window
pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<i64>,
    window: VecDeque<i64>,
    threshold: u32,
    window_ms: i64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            window: VecDeque::new(),
            threshold,
            window_ms: window_ms as i64,
        }
    }

    /// Rebuild from a KV snapshot (cold-start convergence)
    pub fn from_snapshot(snapshot: &CircuitBreakerState, threshold: u32, window_ms: u64) -> Self {
        Self {
            state: snapshot.state,
            opened_at: snapshot.opened_at,
            window: snapshot.error_timestamps.iter().copied().collect(),
            threshold,
            window_ms: window_ms as i64,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            opened_at: self.opened_at,
            error_timestamps: self.window.iter().copied().collect(),
        }
    }

    /// State with open→half-open promotion applied for the given time
    pub fn effective_state(&self, now_ms: i64) -> CircuitState {
        match self.state {
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now_ms);
                if now_ms - opened_at >= self.window_ms {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            other => other,
        }
    }

    pub fn is_open(&self, now_ms: i64) -> bool {
        self.effective_state(now_ms) == CircuitState::Open
    }

    pub fn opened_at(&self) -> Option<i64> {
        self.opened_at
    }

    /// Record a failure and evaluate both open signals.
    ///
    /// `consecutive_failures` is the post-increment count from the model's
    /// performance record.
    pub fn record_failure(&mut self, now_ms: i64, consecutive_failures: u32) {
        self.window.push_back(now_ms);
        self.prune(now_ms);

        match self.effective_state(now_ms) {
            // A probe failed: straight back to open.
            CircuitState::HalfOpen => self.open(now_ms),
            CircuitState::Open => {}
            CircuitState::Closed => {
                if consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT
                    || self.window.len() as u32 >= self.threshold
                {
                    self.open(now_ms);
                }
            }
        }
    }

    /// A successful request closes the circuit from any state
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.window.clear();
    }

    /// Persist the open→half-open promotion when a probe is handed out
    pub fn promote_half_open(&mut self, now_ms: i64) {
        if self.state == CircuitState::Open && self.effective_state(now_ms) == CircuitState::HalfOpen
        {
            self.state = CircuitState::HalfOpen;
        }
    }

    /// Forced reset used when every circuit in a pool is open
    pub fn force_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
    }

    fn open(&mut self, now_ms: i64) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while matches!(self.window.front(), Some(&ts) if ts < cutoff) {
            self.window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: u64 = 300_000;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, WINDOW_MS)
    }

    #[test]
    fn opens_after_windowed_threshold() {
        let mut b = breaker();
        let t0 = 1_000_000;

        b.record_failure(t0, 1);
        b.record_failure(t0 + 10_000, 2);
        assert!(!b.is_open(t0 + 10_000));

        b.record_failure(t0 + 60_000, 3);
        assert!(b.is_open(t0 + 60_000));
        assert_eq!(b.opened_at(), Some(t0 + 60_000));
    }

    #[test]
    fn stale_errors_fall_out_of_the_window() {
        let mut b = breaker();
        let t0 = 1_000_000;

        b.record_failure(t0, 1);
        b.record_failure(t0 + 1, 2);
        // The third failure lands after the first two left the window.
        b.record_failure(t0 + WINDOW_MS as i64 + 5_000, 1);
        assert!(!b.is_open(t0 + WINDOW_MS as i64 + 5_000));
    }

    #[test]
    fn consecutive_failures_open_regardless_of_window() {
        let mut b = CircuitBreaker::new(100, WINDOW_MS);
        b.record_failure(1_000, CONSECUTIVE_FAILURE_LIMIT);
        assert!(b.is_open(1_000));
    }

    #[test]
    fn open_becomes_half_open_after_window_elapses() {
        let mut b = breaker();
        let t0 = 1_000_000;
        for i in 0..3 {
            b.record_failure(t0 + i, i as u32 + 1);
        }
        assert!(b.is_open(t0 + 2));

        let after = t0 + 2 + WINDOW_MS as i64 + 1;
        assert!(!b.is_open(after));
        assert_eq!(b.effective_state(after), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let mut b = breaker();
        for i in 0..3 {
            b.record_failure(1_000 + i, i as u32 + 1);
        }
        b.promote_half_open(1_000 + 2 + WINDOW_MS as i64 + 1);
        b.record_success();
        assert_eq!(b.effective_state(i64::MAX), CircuitState::Closed);
        assert_eq!(b.opened_at(), None);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let mut b = breaker();
        let t0 = 1_000_000;
        for i in 0..3 {
            b.record_failure(t0 + i, i as u32 + 1);
        }
        let probe_at = t0 + 2 + WINDOW_MS as i64 + 1;
        b.promote_half_open(probe_at);
        b.record_failure(probe_at + 10, 1);
        assert!(b.is_open(probe_at + 10));
        assert_eq!(b.opened_at(), Some(probe_at + 10));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut b = breaker();
        for i in 0..3 {
            b.record_failure(1_000 + i, i as u32 + 1);
        }
        let snapshot = b.snapshot();
        let restored = CircuitBreaker::from_snapshot(&snapshot, 3, WINDOW_MS);
        assert!(restored.is_open(1_002));
        assert_eq!(restored.opened_at(), b.opened_at());
    }
}
