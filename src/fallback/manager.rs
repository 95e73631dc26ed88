//! Group-partitioned handler registry
//!
//! One [`FallbackHandler`] per traffic group, created lazily on first use.
//! A process-wide manager singleton is set once at init; the module-level
//! convenience functions degrade to empty/default returns when it has not
//! been initialised.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::config::FallbackConfig;
use crate::fallback::circuit_breaker::CircuitBreakerStats;
use crate::fallback::handler::{AccountStats, FallbackHandler};
use crate::fallback::health::AccountHealth;
use crate::fallback::metrics::MetricsSnapshot;

/// Registry of per-group fallback handlers sharing one configuration.
pub struct FallbackManager {
    handlers: RwLock<HashMap<i64, Arc<FallbackHandler>>>,
    config: RwLock<Arc<FallbackConfig>>,
}

/// Per-group slice of a [`ManagerStats`] report.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    /// Breaker snapshot for the group
    pub circuit_breaker: CircuitBreakerStats,
    /// Health snapshots keyed by account id
    pub health: HashMap<u64, AccountHealth>,
    /// Request counters for the group
    pub metrics: MetricsSnapshot,
}

/// Aggregate statistics across all live groups.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Number of live groups
    pub total_groups: usize,
    /// Per-group statistics keyed by group id
    pub groups: HashMap<i64, GroupStats>,
}

impl FallbackManager {
    /// Create a manager with the given shared configuration.
    #[must_use]
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Get or lazily create the handler for a group.
    pub fn handler_for(&self, group_id: i64) -> Arc<FallbackHandler> {
        if let Some(handler) = self.handlers.read().get(&group_id) {
            return Arc::clone(handler);
        }

        let mut handlers = self.handlers.write();
        // Double-checked: another request may have won the race.
        if let Some(handler) = handlers.get(&group_id) {
            return Arc::clone(handler);
        }

        let handler = FallbackHandler::new(Arc::clone(&self.config.read()));
        handlers.insert(group_id, Arc::clone(&handler));
        info!(group_id, "Created fallback handler for group");
        handler
    }

    /// Drop (and stop) the handler for a group, if it exists.
    pub fn remove_handler(&self, group_id: i64) {
        if let Some(handler) = self.handlers.write().remove(&group_id) {
            handler.stop();
        }
    }

    /// Snapshot of all live handlers.
    #[must_use]
    pub fn handlers(&self) -> HashMap<i64, Arc<FallbackHandler>> {
        self.handlers.read().clone()
    }

    /// Replace the shared configuration.
    ///
    /// Every live handler receives the same pointer; existing selectors are
    /// not rebuilt, so the update takes effect on subsequent requests only.
    pub fn update_config(&self, config: FallbackConfig) {
        let shared = Arc::new(config);
        *self.config.write() = Arc::clone(&shared);

        for handler in self.handlers.read().values() {
            handler.set_config(Arc::clone(&shared));
        }
        info!("Fallback configuration updated");
    }

    /// The configuration new handlers will receive.
    #[must_use]
    pub fn config(&self) -> Arc<FallbackConfig> {
        Arc::clone(&self.config.read())
    }

    /// Aggregate breaker/health/metrics statistics across groups.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let handlers = self.handlers.read();
        let groups = handlers
            .iter()
            .map(|(&group_id, handler)| {
                (
                    group_id,
                    GroupStats {
                        circuit_breaker: handler.breaker_stats(),
                        health: handler.health_snapshot(),
                        metrics: handler.metrics(),
                    },
                )
            })
            .collect();

        ManagerStats {
            total_groups: handlers.len(),
            groups,
        }
    }

    /// Stop every handler and empty the registry.
    pub fn cleanup(&self) {
        let mut handlers = self.handlers.write();
        for handler in handlers.values() {
            handler.stop();
        }
        handlers.clear();
        info!("Fallback manager cleaned up");
    }
}

static MANAGER: OnceLock<FallbackManager> = OnceLock::new();

/// Initialise the process-wide manager singleton (idempotent).
pub fn init_manager(config: FallbackConfig) -> &'static FallbackManager {
    MANAGER.get_or_init(|| FallbackManager::new(config))
}

/// The manager singleton, if initialised.
#[must_use]
pub fn manager() -> Option<&'static FallbackManager> {
    MANAGER.get()
}

/// Per-group stats for one account across all groups that have seen it.
#[must_use]
pub fn account_fallback_stats(account_id: u64) -> HashMap<i64, AccountStats> {
    let Some(manager) = manager() else {
        return HashMap::new();
    };

    manager
        .handlers()
        .into_iter()
        .filter_map(|(group_id, handler)| {
            let stats = handler.account_stats(account_id);
            (stats.request_count > 0 || stats.health.is_some()).then_some((group_id, stats))
        })
        .collect()
}

/// Feed an attempt outcome into a group's selector performance data.
pub fn update_account_performance(
    group_id: i64,
    account_id: u64,
    success: bool,
    response_time: Duration,
) {
    if let Some(manager) = manager() {
        manager
            .handler_for(group_id)
            .update_performance(account_id, success, response_time);
    }
}

/// Take an account out of rotation within a group.
pub fn disable_account(group_id: i64, account_id: u64, duration: Duration, reason: &str) {
    if let Some(manager) = manager() {
        manager
            .handler_for(group_id)
            .health()
            .set_disabled(account_id, duration, reason);
    }
}

/// Restore a disabled account within a group.
pub fn enable_account(group_id: i64, account_id: u64) {
    if let Some(manager) = manager() {
        manager.handler_for(group_id).health().enable(account_id);
    }
}

/// Health snapshot for one account within a group.
#[must_use]
pub fn account_health(group_id: i64, account_id: u64) -> Option<AccountHealth> {
    manager()?.handler_for(group_id).health().get(account_id)
}

/// Health snapshots for every account a group has attempted.
#[must_use]
pub fn group_health_stats(group_id: i64) -> HashMap<u64, AccountHealth> {
    manager().map_or_else(HashMap::new, |m| m.handler_for(group_id).health_snapshot())
}

/// Purge stale health entries in every group.
pub fn cleanup_stale_data(max_age: Duration) {
    if let Some(manager) = manager() {
        for handler in manager.handlers().values() {
            handler.health().cleanup_stale(max_age);
        }
    }
}

/// Request counters summed across all groups.
#[must_use]
pub fn aggregate_metrics() -> MetricsSnapshot {
    let Some(manager) = manager() else {
        return MetricsSnapshot::default();
    };

    let mut total = MetricsSnapshot::default();
    for handler in manager.handlers().values() {
        total.absorb(&handler.metrics());
    }
    total
}
