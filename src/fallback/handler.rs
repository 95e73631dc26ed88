//! Fallback orchestration
//!
//! A [`FallbackHandler`] owns the per-group machinery: breaker, health
//! monitor, request history, metrics, and the selector. `handle` runs one
//! request through the candidate accounts, feeding each attempt through a
//! capturing sink so the client only ever sees the winning reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::account::{Account, AccountInfo};
use crate::config::{FallbackConfig, FallbackStrategy};
use crate::fallback::capture::ResponseCapture;
use crate::fallback::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::fallback::{duration_millis, epoch_millis_now};
use crate::fallback::health::{AccountHealth, HealthMonitor};
use crate::fallback::metrics::{HandlerMetrics, MetricsSnapshot};
use crate::fallback::selector::{AccountSelector, selector_for};
use crate::sink::ResponseSink;

/// Request history entries kept per account.
const MAX_HISTORY_PER_ACCOUNT: usize = 100;
/// Request history entries older than this are trimmed on record.
const HISTORY_WINDOW_MS: u64 = 10 * 60 * 1000;
/// Interval of the background cleanup pass.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// Cleanup cutoff for history and selector performance data.
const CLEANUP_MAX_AGE: Duration = Duration::from_secs(3600);
/// Health entries idle longer than this are purged by cleanup.
const HEALTH_STALE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Performs one upstream attempt, writing the reply through the sink.
///
/// Transport-level failures may either surface as an `Err` or be written
/// into the sink as a 5xx status; both count as a failed attempt.
#[async_trait]
pub trait UpstreamExecutor: Send + Sync {
    /// Issue the upstream request for `account` with the given raw body.
    async fn execute(
        &self,
        account: &Account,
        request_body: &[u8],
        sink: &mut dyn ResponseSink,
    ) -> Result<()>;
}

/// Terminal outcome classification of one `handle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The group breaker rejected the request before any attempt
    BreakerOpen,
    /// The selector produced an empty order
    NoAvailableAccounts,
    /// Every attempted account failed
    AllAccountsFailed,
    /// The request succeeded
    None,
}

impl FailureReason {
    /// Whether this is the success tag (omitted from serialised results).
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Structured outcome of one `handle` call.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResult {
    /// Whether an attempt succeeded
    pub success: bool,
    /// The last attempted account (the winner on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    /// Upstream status code of the last attempt (0 if none was made)
    pub status_code: u16,
    /// Error body of the last failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Attempts made (1-based index of the winner on success)
    pub attempt_count: usize,
    /// Wall-clock duration of the whole `handle` call, in nanoseconds
    #[serde(serialize_with = "serialize_nanos")]
    pub duration: Duration,
    /// Strategy configured when the request was handled
    pub strategy_used: FallbackStrategy,
    /// Failure classification
    #[serde(skip_serializing_if = "FailureReason::is_none")]
    pub failure_reason: FailureReason,
}

impl FallbackResult {
    fn rejected(
        reason: FailureReason,
        message: &str,
        strategy: FallbackStrategy,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            account: None,
            status_code: 0,
            error_message: Some(message.to_owned()),
            attempt_count: 0,
            duration,
            strategy_used: strategy,
            failure_reason: reason,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_nanos<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_nanos())
}

/// Per-account view combining request history and health.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStats {
    /// Requests recorded in the recent history window
    pub request_count: usize,
    /// Health snapshot, if the account has been attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<AccountHealth>,
}

/// Failover orchestrator for one traffic group.
pub struct FallbackHandler {
    config: RwLock<Arc<FallbackConfig>>,
    selector: Box<dyn AccountSelector>,
    breaker: CircuitBreaker,
    health: HealthMonitor,
    history: DashMap<u64, Vec<u64>>,
    metrics: HandlerMetrics,
    shutdown: broadcast::Sender<()>,
}

impl FallbackHandler {
    /// Create a handler with the base selector for the configured strategy.
    ///
    /// Must be called within a tokio runtime: the cleanup loop (and the
    /// health sweep when enabled) are spawned here and run until [`stop`]
    /// or until the handler is dropped.
    ///
    /// [`stop`]: FallbackHandler::stop
    #[must_use]
    pub fn new(config: Arc<FallbackConfig>) -> Arc<Self> {
        let selector = selector_for(config.strategy);
        Self::with_selector(config, selector)
    }

    /// Create a handler around a caller-supplied selector (e.g. an
    /// [`AdaptiveSelector`] or [`SmartLoadBalanceSelector`] decorator).
    ///
    /// [`AdaptiveSelector`]: crate::fallback::AdaptiveSelector
    /// [`SmartLoadBalanceSelector`]: crate::fallback::SmartLoadBalanceSelector
    #[must_use]
    pub fn with_selector(
        config: Arc<FallbackConfig>,
        selector: Box<dyn AccountSelector>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.failure_window,
            config.recovery_window,
        );

        let handler = Arc::new(Self {
            config: RwLock::new(config),
            selector,
            breaker,
            health: HealthMonitor::new(),
            history: DashMap::new(),
            metrics: HandlerMetrics::new(),
            shutdown,
        });

        handler.spawn_background_tasks();
        handler
    }

    /// Route one request through the candidates with fallback.
    pub async fn handle(
        &self,
        sink: &mut dyn ResponseSink,
        candidates: &[Account],
        raw_body: &[u8],
        executor: &dyn UpstreamExecutor,
    ) -> FallbackResult {
        let started = Instant::now();
        let config = self.current_config();
        self.metrics.record_request();

        info!(
            candidates = candidates.len(),
            strategy = config.strategy.as_str(),
            "Handling relay request with fallback"
        );

        if config.enable_circuit_breaker && self.breaker.is_open() {
            self.metrics.record_breaker_rejection();
            warn!("Circuit breaker open, rejecting request");
            return FallbackResult::rejected(
                FailureReason::BreakerOpen,
                "circuit breaker is open, requests are temporarily rejected",
                config.strategy,
                started.elapsed(),
            );
        }

        let ordered = self.selector.order(candidates);
        if ordered.is_empty() {
            self.metrics.record_failure();
            return FallbackResult::rejected(
                FailureReason::NoAvailableAccounts,
                "no accounts available for this request",
                config.strategy,
                started.elapsed(),
            );
        }

        let max_attempts = config.max_retries.min(ordered.len());
        let mut last_error: Option<String> = None;
        let mut last_status: u16 = 0;
        let mut last_account: Option<AccountInfo> = None;

        for (index, account) in ordered.iter().take(max_attempts).enumerate() {
            if config.enable_health_check && self.health.is_skippable(account.id) {
                warn!(account = %account.name, "Skipping unhealthy account");
                continue;
            }

            if index > 0 {
                self.metrics.record_fallback_attempt();
            }

            debug!(
                attempt = index + 1,
                max_attempts,
                account = %account.name,
                platform = %account.platform,
                priority = account.priority,
                "Trying account"
            );

            let attempt_started = Instant::now();
            let mut capture = ResponseCapture::new(&mut *sink, attempt_started);
            let outcome = executor.execute(account, raw_body, &mut capture).await;

            self.record_request_history(account.id);
            let elapsed = attempt_started.elapsed();
            last_account = Some(AccountInfo::from(account));

            if outcome.is_ok() && capture.is_success() {
                let streaming = capture.is_streaming();
                if !streaming {
                    if let Err(e) = capture.flush_non_stream_success() {
                        warn!(account = %account.name, error = %e, "Client write failed while replaying buffered reply");
                    }
                }

                if config.enable_circuit_breaker {
                    self.breaker.record_success();
                }
                if config.enable_health_check {
                    self.health.record_result(account.id, true, elapsed, None);
                }
                self.metrics.record_success();

                info!(
                    account = %account.name,
                    status = capture.status_code().as_u16(),
                    ttfb_ms = capture.first_byte_time().map(|d| d.as_millis() as u64),
                    bytes = capture.total_bytes(),
                    streaming,
                    duration_ms = elapsed.as_millis() as u64,
                    "Attempt succeeded"
                );

                return FallbackResult {
                    success: true,
                    account: last_account,
                    status_code: capture.status_code().as_u16(),
                    error_message: None,
                    attempt_count: index + 1,
                    duration: started.elapsed(),
                    strategy_used: config.strategy,
                    failure_reason: FailureReason::None,
                };
            }

            let error_body = if capture.buffered_data().is_empty() {
                outcome.err().map(|e| e.to_string()).unwrap_or_default()
            } else {
                String::from_utf8_lossy(capture.buffered_data()).into_owned()
            };
            last_status = capture.status_code().as_u16();
            drop(capture);

            warn!(
                account = %account.name,
                status = last_status,
                error = %error_body,
                "Attempt failed"
            );

            if config.enable_health_check {
                self.health
                    .record_result(account.id, false, elapsed, Some(&error_body));
            }
            last_error = Some(error_body);

            if index + 1 < max_attempts && !config.retry_delay.is_zero() {
                debug!(
                    delay_ms = config.retry_delay.as_millis() as u64,
                    "Waiting before next attempt"
                );
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        if config.enable_circuit_breaker {
            self.breaker.record_failure();
        }
        self.metrics.record_failure();
        error!(
            attempts = max_attempts,
            error = last_error.as_deref().unwrap_or(""),
            "All accounts failed"
        );

        FallbackResult {
            success: false,
            account: last_account,
            status_code: last_status,
            error_message: last_error,
            attempt_count: max_attempts,
            duration: started.elapsed(),
            strategy_used: config.strategy,
            failure_reason: FailureReason::AllAccountsFailed,
        }
    }

    /// Stop the background loops.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        info!("Fallback handler stopped");
    }

    /// Swap in a new shared config; in-flight requests keep their snapshot.
    pub fn set_config(&self, config: Arc<FallbackConfig>) {
        *self.config.write() = config;
    }

    /// The config future requests will snapshot.
    #[must_use]
    pub fn current_config(&self) -> Arc<FallbackConfig> {
        Arc::clone(&self.config.read())
    }

    /// Request history and health for one account.
    #[must_use]
    pub fn account_stats(&self, account_id: u64) -> AccountStats {
        AccountStats {
            request_count: self
                .history
                .get(&account_id)
                .map_or(0, |stamps| stamps.len()),
            health: self.health.get(account_id),
        }
    }

    /// Breaker snapshot for this group.
    #[must_use]
    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Health snapshots for every tracked account.
    #[must_use]
    pub fn health_snapshot(&self) -> std::collections::HashMap<u64, AccountHealth> {
        self.health.all()
    }

    /// Metrics snapshot for this group.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Feed an attempt outcome into the selector's performance data
    /// (meaningful for the adaptive decorators).
    pub fn update_performance(&self, account_id: u64, success: bool, response_time: Duration) {
        self.selector
            .update_performance(account_id, success, response_time);
    }

    /// Health monitor accessor for administrative operations.
    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    fn record_request_history(&self, account_id: u64) {
        let now = epoch_millis_now();
        {
            let mut stamps = self.history.entry(account_id).or_default();
            stamps.push(now);
            if stamps.len() > MAX_HISTORY_PER_ACCOUNT {
                let excess = stamps.len() - MAX_HISTORY_PER_ACCOUNT;
                stamps.drain(..excess);
            }
        }

        let cutoff = now.saturating_sub(HISTORY_WINDOW_MS);
        self.history.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            !stamps.is_empty()
        });
    }

    /// Hourly compaction of history, selector performance data, and health.
    fn cleanup(&self) {
        let cutoff = epoch_millis_now().saturating_sub(duration_millis(CLEANUP_MAX_AGE));

        self.history.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            if stamps.len() > MAX_HISTORY_PER_ACCOUNT {
                let excess = stamps.len() - MAX_HISTORY_PER_ACCOUNT;
                stamps.drain(..excess);
            }
            !stamps.is_empty()
        });

        self.selector.cleanup_old(cutoff);
        self.health.cleanup_stale(HEALTH_STALE_MAX_AGE);

        debug!(
            history_entries = self.history.len(),
            health_entries = self.health.len(),
            "Cleanup pass complete"
        );
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match weak.upgrade() {
                            Some(handler) => handler.cleanup(),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let config = self.current_config();
        if config.enable_health_check {
            let weak = Arc::downgrade(self);
            let mut shutdown_rx = self.shutdown.subscribe();
            let interval = config.health_check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match weak.upgrade() {
                                Some(handler) => handler.health.sweep(),
                                None => break,
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }
    }
}
