//! Per-account health tracking
//!
//! Driven from two paths: per-result updates after each attempt, and the
//! periodic sweep the handler schedules at the configured interval.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fallback::{duration_millis, epoch_millis_now};

/// Error rate above which an account is auto-disabled.
const AUTO_DISABLE_ERROR_RATE: f64 = 0.8;
/// A failure within this window counts as recent for auto-disable.
const RECENT_FAILURE_WINDOW_MS: u64 = 5 * 60 * 1000;
/// How long an auto-disabled account stays out of rotation.
const AUTO_DISABLE_DURATION_MS: u64 = 10 * 60 * 1000;
/// No activity within this window marks an account idle.
const IDLE_WINDOW_MS: u64 = 5 * 60 * 1000;
/// Average response time above which an account is unhealthy.
const UNHEALTHY_RESPONSE_MS: u64 = 60 * 1000;
/// Average response time above which an account is degraded.
const DEGRADED_RESPONSE_MS: u64 = 30 * 1000;

/// Health classification of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Elevated error rate or slow responses
    Degraded,
    /// Failing often enough to be skipped
    Unhealthy,
    /// Taken out of rotation until a deadline
    Disabled,
    /// No recent traffic
    Idle,
}

impl HealthStatus {
    /// Return the lowercase label used in stats and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Disabled => "disabled",
            Self::Idle => "idle",
        }
    }
}

/// Rolling health record for one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountHealth {
    /// Account identifier
    pub account_id: u64,
    /// Current classification
    pub status: HealthStatus,
    /// Epoch-ms of the last sweep over this entry
    pub last_check_ms: u64,
    /// Total successful attempts
    pub success_count: u64,
    /// Total failed attempts
    pub failure_count: u64,
    /// Smoothed response time in milliseconds
    pub avg_response_time_ms: u64,
    /// failures / (successes + failures)
    pub error_rate: f64,
    /// Epoch-ms of the last success (0 = never)
    pub last_success_ms: u64,
    /// Epoch-ms of the last failure (0 = never)
    pub last_failure_ms: u64,
    /// Deadline until which the account is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_until_ms: Option<u64>,
    /// Reason recorded with the last failure or disable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl AccountHealth {
    fn new(account_id: u64, status: HealthStatus) -> Self {
        Self {
            account_id,
            status,
            last_check_ms: epoch_millis_now(),
            success_count: 0,
            failure_count: 0,
            avg_response_time_ms: 0,
            error_rate: 0.0,
            last_success_ms: 0,
            last_failure_ms: 0,
            disabled_until_ms: None,
            failure_reason: None,
        }
    }

    fn recompute_error_rate(&mut self) {
        let total = self.success_count + self.failure_count;
        if total > 0 {
            self.error_rate = self.failure_count as f64 / total as f64;
        }
    }

    fn disabled_at(&self, now_ms: u64) -> bool {
        self.disabled_until_ms.is_some_and(|until| until > now_ms)
    }
}

/// Tracks rolling health for every account a handler has attempted.
pub struct HealthMonitor {
    entries: RwLock<HashMap<u64, AccountHealth>>,
}

impl HealthMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record one attempt outcome for an account.
    pub fn record_result(
        &self,
        account_id: u64,
        success: bool,
        response_time: Duration,
        reason: Option<&str>,
    ) {
        let now = epoch_millis_now();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(account_id)
            .or_insert_with(|| AccountHealth::new(account_id, HealthStatus::Healthy));

        if success {
            entry.success_count += 1;
            entry.last_success_ms = now;
        } else {
            entry.failure_count += 1;
            entry.last_failure_ms = now;
            entry.failure_reason = reason.map(str::to_owned);

            // Evaluated against the rate before this failure is folded in.
            if entry.error_rate > AUTO_DISABLE_ERROR_RATE
                && now.saturating_sub(entry.last_failure_ms) < RECENT_FAILURE_WINDOW_MS
            {
                let until = now + AUTO_DISABLE_DURATION_MS;
                entry.disabled_until_ms = Some(until);
                warn!(
                    account_id,
                    error_rate = entry.error_rate,
                    disabled_until_ms = until,
                    "Account temporarily disabled after repeated failures"
                );
            }
        }

        let sample_ms = duration_millis(response_time);
        entry.avg_response_time_ms = if entry.avg_response_time_ms == 0 {
            sample_ms
        } else {
            (entry.avg_response_time_ms + sample_ms) / 2
        };

        entry.recompute_error_rate();
    }

    /// Periodic sweep: refresh error rates and reclassify every entry.
    pub fn sweep(&self) {
        let now = epoch_millis_now();
        let mut entries = self.entries.write();

        for entry in entries.values_mut() {
            entry.last_check_ms = now;
            entry.recompute_error_rate();

            let previous = entry.status;
            entry.status = determine_status(entry, now);

            if previous != entry.status {
                info!(
                    account_id = entry.account_id,
                    from = previous.as_str(),
                    to = entry.status.as_str(),
                    "Account health status changed"
                );
            }
        }
    }

    /// Whether the handler should skip this account for an attempt.
    #[must_use]
    pub fn is_skippable(&self, account_id: u64) -> bool {
        let entries = self.entries.read();
        entries.get(&account_id).is_some_and(|entry| {
            entry.status == HealthStatus::Unhealthy || entry.disabled_at(epoch_millis_now())
        })
    }

    /// Manually take an account out of rotation.
    pub fn set_disabled(&self, account_id: u64, duration: Duration, reason: &str) {
        let now = epoch_millis_now();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(account_id)
            .or_insert_with(|| AccountHealth::new(account_id, HealthStatus::Disabled));

        let until = now + duration_millis(duration);
        entry.disabled_until_ms = Some(until);
        entry.status = HealthStatus::Disabled;
        entry.failure_reason = Some(reason.to_owned());

        warn!(account_id, disabled_until_ms = until, reason, "Account disabled");
    }

    /// Manually restore a disabled account.
    pub fn enable(&self, account_id: u64) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&account_id) {
            entry.disabled_until_ms = None;
            entry.status = HealthStatus::Healthy;
            entry.failure_reason = None;
            info!(account_id, "Account enabled");
        }
    }

    /// Drop entries with no sweep activity within `max_age`.
    pub fn cleanup_stale(&self, max_age: Duration) {
        let cutoff = epoch_millis_now().saturating_sub(duration_millis(max_age));
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_check_ms >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Dropped stale health entries");
        }
    }

    /// Snapshot one account's health.
    #[must_use]
    pub fn get(&self, account_id: u64) -> Option<AccountHealth> {
        self.entries.read().get(&account_id).cloned()
    }

    /// Snapshot every tracked account.
    #[must_use]
    pub fn all(&self) -> HashMap<u64, AccountHealth> {
        self.entries.read().clone()
    }

    /// Number of tracked accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no accounts are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify an entry; first matching rule wins.
fn determine_status(entry: &AccountHealth, now_ms: u64) -> HealthStatus {
    if entry.disabled_at(now_ms) {
        return HealthStatus::Disabled;
    }

    let success_age = entry.last_check_ms.saturating_sub(entry.last_success_ms);
    let failure_age = entry.last_check_ms.saturating_sub(entry.last_failure_ms);
    if success_age > IDLE_WINDOW_MS && failure_age > IDLE_WINDOW_MS {
        return HealthStatus::Idle;
    }

    if entry.error_rate > 0.5 {
        return HealthStatus::Unhealthy;
    }
    if entry.error_rate > 0.2 {
        return HealthStatus::Degraded;
    }

    if entry.avg_response_time_ms > UNHEALTHY_RESPONSE_MS {
        return HealthStatus::Unhealthy;
    }
    if entry.avg_response_time_ms > DEGRADED_RESPONSE_MS {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
