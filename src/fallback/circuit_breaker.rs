//! Per-group circuit breaker

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::fallback::{duration_millis, epoch_millis_now};

/// Consecutive half-open successes required to close the circuit.
const HALF_OPEN_CLOSE_TARGET: u64 = 5;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (rejecting requests)
    Open,
    /// Circuit is half-open (admitting probe traffic)
    HalfOpen,
}

impl CircuitState {
    /// Return the lowercase label used in stats and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Serialisable breaker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures accumulated in the current window
    pub failure_count: u64,
    /// Epoch-ms of the last recorded failure (0 = never)
    pub last_failure_ms: u64,
    /// Consecutive successes while half-open
    pub consecutive_success: u64,
    /// Configured failure threshold
    pub threshold: u64,
}

#[derive(Default)]
struct Counters {
    failure_count: u64,
    last_failure_ms: u64,
    consecutive_success: u64,
}

/// Three-state failure gate protecting one traffic group.
///
/// The state lives in an atomic for cheap reads; the counters share one mutex
/// so they stay consistent with the transition they trigger. Transitions are
/// Closed→Open, Open→HalfOpen, HalfOpen→Closed, and HalfOpen→Open only.
pub struct CircuitBreaker {
    state: AtomicU8,
    counters: Mutex<Counters>,
    threshold: u64,
    failure_window: Duration,
    recovery_window: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(threshold: u64, failure_window: Duration, recovery_window: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            counters: Mutex::new(Counters::default()),
            threshold,
            failure_window,
            recovery_window,
        }
    }

    /// Whether requests should currently be rejected.
    ///
    /// An open circuit whose recovery window has elapsed flips to half-open
    /// here (compare-and-swap, so concurrent callers race for one probe
    /// admission) and the call reports not-open.
    pub fn is_open(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let mut counters = self.counters.lock();
                let elapsed = epoch_millis_now().saturating_sub(counters.last_failure_ms);
                if elapsed > duration_millis(self.recovery_window)
                    && self
                        .state
                        .compare_exchange(
                            CircuitState::Open.as_u8(),
                            CircuitState::HalfOpen.as_u8(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    counters.consecutive_success = 0;
                    debug!("Recovery window elapsed, circuit half-open for probing");
                    return false;
                }
                true
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut counters = self.counters.lock();

        match self.state() {
            CircuitState::HalfOpen => {
                counters.consecutive_success += 1;
                if counters.consecutive_success >= HALF_OPEN_CLOSE_TARGET {
                    self.state
                        .store(CircuitState::Closed.as_u8(), Ordering::Release);
                    counters.failure_count = 0;
                    debug!("Probe successes reached target, circuit closed");
                }
            }
            CircuitState::Closed => {
                // Rolling reset: the failure count survives until a full
                // failure window passes without failures.
                let elapsed = epoch_millis_now().saturating_sub(counters.last_failure_ms);
                if elapsed > duration_millis(self.failure_window) {
                    counters.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let mut counters = self.counters.lock();

        counters.failure_count += 1;
        counters.last_failure_ms = epoch_millis_now();

        match self.state() {
            CircuitState::HalfOpen => {
                self.state
                    .store(CircuitState::Open.as_u8(), Ordering::Release);
                warn!("Probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                if counters.failure_count >= self.threshold {
                    self.state
                        .store(CircuitState::Open.as_u8(), Ordering::Release);
                    warn!(
                        failures = counters.failure_count,
                        threshold = self.threshold,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Return a stats snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let counters = self.counters.lock();
        CircuitBreakerStats {
            state: self.state(),
            failure_count: counters.failure_count,
            last_failure_ms: counters.last_failure_ms,
            consecutive_success: counters.consecutive_success,
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            threshold,
            Duration::from_secs(300),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn starts_closed_and_admits_requests() {
        let cb = breaker(3);
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    fn probe_after_recovery(cb: &CircuitBreaker) {
        // The recovery window comparison is strict, so let a few millis pass.
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn open_transitions_to_half_open_after_recovery_window() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(300), Duration::ZERO);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        probe_after_recovery(&cb);
    }

    #[test]
    fn half_open_closes_after_five_consecutive_successes() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(300), Duration::ZERO);
        cb.record_failure();
        probe_after_recovery(&cb);

        for _ in 0..4 {
            cb.record_success();
            assert_eq!(cb.state(), CircuitState::HalfOpen);
        }
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(300), Duration::ZERO);
        cb.record_failure();
        probe_after_recovery(&cb);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn closed_success_resets_count_only_after_failure_window() {
        // Large window: the count survives a success right after a failure.
        let cb = breaker(3);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.stats().failure_count, 1);

        // Zero window: any success clears the accumulated count.
        let cb = CircuitBreaker::new(3, Duration::ZERO, Duration::from_secs(600));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.record_success();
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[test]
    fn never_more_than_threshold_failures_while_closed() {
        let cb = breaker(4);
        for i in 1..=4u64 {
            assert_eq!(cb.state(), CircuitState::Closed);
            cb.record_failure();
            assert!(cb.stats().failure_count <= 4, "failure {i} exceeded threshold");
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn stays_open_within_recovery_window() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(300), Duration::from_secs(600));
        cb.record_failure();
        assert!(cb.is_open());
        assert!(cb.is_open(), "must not leave open before the window elapses");
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let cb = breaker(5);
        cb.record_failure();
        cb.record_failure();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.threshold, 5);
        assert_ne!(stats.last_failure_ms, 0);
        assert_eq!(stats.consecutive_success, 0);
    }

    #[test]
    fn state_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
        assert_eq!(CircuitState::Open.as_str(), "open");
    }
}
