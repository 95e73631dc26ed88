//! Per-handler request metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for one handler's traffic.
pub struct HandlerMetrics {
    /// Requests entering `handle`
    total_requests: AtomicU64,
    /// Requests that ended with a successful attempt
    success_requests: AtomicU64,
    /// Requests that exhausted every candidate or were rejected
    failed_requests: AtomicU64,
    /// Attempts made beyond the first per request
    fallback_attempts: AtomicU64,
    /// Requests rejected by an open circuit breaker
    breaker_rejections: AtomicU64,
}

impl HandlerMetrics {
    /// Create zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            success_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            fallback_attempts: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
        }
    }

    /// Record a request entering the handler.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that ended successfully.
    pub fn record_success(&self) {
        self.success_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that ended in failure.
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt beyond the first within one request.
    pub fn record_fallback_attempt(&self) {
        self.fallback_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejection by the open breaker.
    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_requests: self.success_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            fallback_attempts: self.fallback_attempts.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
        }
    }
}

impl Default for HandlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable counter snapshot, cheap to clone and sum.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Requests entering `handle`
    pub total_requests: u64,
    /// Requests that ended with a successful attempt
    pub success_requests: u64,
    /// Requests that exhausted every candidate or were rejected
    pub failed_requests: u64,
    /// Attempts made beyond the first per request
    pub fallback_attempts: u64,
    /// Requests rejected by an open circuit breaker
    pub breaker_rejections: u64,
}

impl MetricsSnapshot {
    /// Fold another snapshot into this one (for cross-group aggregation).
    pub fn absorb(&mut self, other: &MetricsSnapshot) {
        self.total_requests += other.total_requests;
        self.success_requests += other.success_requests;
        self.failed_requests += other.failed_requests;
        self.fallback_attempts += other.fallback_attempts;
        self.breaker_rejections += other.breaker_rejections;
    }
}
