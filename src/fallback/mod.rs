//! Fallback machinery: selection, circuit breaking, health, capture, orchestration

mod capture;
mod circuit_breaker;
mod handler;
mod health;
mod manager;
mod metrics;
mod selector;

pub use capture::{CaptureMode, ResponseCapture};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use handler::{
    AccountStats, FailureReason, FallbackHandler, FallbackResult, UpstreamExecutor,
};
pub use health::{AccountHealth, HealthMonitor, HealthStatus};
pub use manager::{
    FallbackManager, GroupStats, ManagerStats, account_fallback_stats, account_health,
    aggregate_metrics, cleanup_stale_data, disable_account, enable_account, group_health_stats,
    init_manager, manager, update_account_performance,
};
pub use metrics::{HandlerMetrics, MetricsSnapshot};
pub use selector::{
    AccountSelector, AdaptiveSelector, HybridSelector, LeastUsedSelector, PerformanceData,
    PrioritySelector, RoundRobinSelector, SmartLoadBalanceSelector, WeightedSelector,
    selector_for,
};

/// Current time as milliseconds since UNIX epoch.
///
/// Truncation to `u64` is safe: epoch-ms fits comfortably for centuries.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A `Duration` as whole milliseconds, for epoch-ms arithmetic.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn duration_millis(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}
