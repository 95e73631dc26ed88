//! Account selection strategies
//!
//! Selectors take a candidate list and produce an ordered preference list
//! without mutating the input. Round-robin and the adaptive decorators carry
//! internal state behind their own locks and tolerate concurrent invocation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::account::{Account, AccountStatus};
use crate::config::FallbackStrategy;
use crate::fallback::epoch_millis_now;

/// Usage count at which an account's usage-based score bottoms out.
const USAGE_SCALE: f64 = 1000.0;

/// An ordering strategy over candidate accounts.
pub trait AccountSelector: Send + Sync {
    /// Produce the preference order for this request.
    fn order(&self, candidates: &[Account]) -> Vec<Account>;

    /// Feed an attempt outcome into the selector. Base selectors ignore this;
    /// the adaptive decorators use it to build performance data.
    fn update_performance(&self, _account_id: u64, _success: bool, _response_time: Duration) {}

    /// Drop performance entries with no activity since `cutoff_ms`.
    fn cleanup_old(&self, _cutoff_ms: u64) {}
}

/// Build the base selector for a strategy tag.
#[must_use]
pub fn selector_for(strategy: FallbackStrategy) -> Box<dyn AccountSelector> {
    match strategy {
        FallbackStrategy::PriorityFirst => Box::new(PrioritySelector),
        FallbackStrategy::Weighted => Box::new(WeightedSelector),
        FallbackStrategy::RoundRobin => Box::new(RoundRobinSelector::new()),
        FallbackStrategy::LeastUsed => Box::new(LeastUsedSelector),
        FallbackStrategy::Hybrid => Box::new(HybridSelector),
    }
}

/// Ascending priority, ties broken by today's usage.
pub struct PrioritySelector;

impl AccountSelector for PrioritySelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|a| (a.priority, a.today_usage_count));
        ordered
    }
}

/// Descending usage-adjusted effective weight.
pub struct WeightedSelector;

impl WeightedSelector {
    fn effective_weight(account: &Account, total_weight: i64) -> f64 {
        let base = f64::from(account.weight) / total_weight as f64;
        let usage_factor = (1.0 - account.today_usage_count as f64 / USAGE_SCALE).max(0.1);
        base * usage_factor
    }
}

impl AccountSelector for WeightedSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let total_weight: i64 = candidates.iter().map(|a| i64::from(a.weight)).sum();
        let mut ordered = candidates.to_vec();
        if total_weight != 0 {
            ordered.sort_by(|a, b| {
                Self::effective_weight(b, total_weight)
                    .total_cmp(&Self::effective_weight(a, total_weight))
            });
        }
        ordered
    }
}

#[derive(Default)]
struct RoundRobinState {
    /// Selection round counter
    counter: u64,
    /// Round at which each account was last selected
    last_selected: HashMap<u64, u64>,
}

/// Least-recently-selected first.
pub struct RoundRobinSelector {
    state: Mutex<RoundRobinState>,
}

impl RoundRobinSelector {
    /// Create a fresh round-robin selector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoundRobinState::default()),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountSelector for RoundRobinSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let mut state = self.state.lock();

        // Never-selected accounts score maximal, so they lead immediately.
        let mut ordered = candidates.to_vec();
        let counter = state.counter;
        ordered.sort_by_key(|a| {
            let staleness = state
                .last_selected
                .get(&a.id)
                .map_or(u64::MAX, |&last| counter - last);
            std::cmp::Reverse(staleness)
        });

        // Recording the round for the head alone sends it to the back of the
        // next ordering, rotating leadership one account per call.
        if let Some(head) = ordered.first() {
            state.last_selected.insert(head.id, counter);
            state.counter += 1;
        }

        ordered
    }
}

/// Ascending today's usage, ties broken by priority.
pub struct LeastUsedSelector;

impl AccountSelector for LeastUsedSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|a| (a.today_usage_count, a.priority));
        ordered
    }
}

/// Priority buckets, each bucket ordered by a composite weight/usage/status
/// score.
pub struct HybridSelector;

impl HybridSelector {
    fn composite_score(account: &Account) -> f64 {
        let mut score = f64::from(account.weight) * 0.4;

        score += if account.today_usage_count == 0 {
            30.0
        } else {
            (30.0 * (1.0 - account.today_usage_count as f64 / USAGE_SCALE)).max(0.0)
        };

        score += match account.current_status {
            AccountStatus::Normal => 30.0,
            AccountStatus::Throttled => 10.0,
            AccountStatus::Error => 0.0,
        };

        score
    }
}

impl AccountSelector for HybridSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let mut buckets: BTreeMap<i32, Vec<Account>> = BTreeMap::new();
        for account in candidates {
            buckets
                .entry(account.priority)
                .or_default()
                .push(account.clone());
        }

        let mut ordered = Vec::with_capacity(candidates.len());
        for (_, mut bucket) in buckets {
            bucket.sort_by(|a, b| Self::composite_score(b).total_cmp(&Self::composite_score(a)));
            ordered.extend(bucket);
        }
        ordered
    }
}

/// Rolling performance record for one account.
#[derive(Debug, Clone, Default)]
pub struct PerformanceData {
    /// Fraction of requests that succeeded
    pub success_rate: f64,
    /// Smoothed response time
    pub avg_response_time: Duration,
    /// Epoch-ms of the last success (0 = never)
    pub last_success_ms: u64,
    /// Epoch-ms of the last failure (0 = never)
    pub last_failure_ms: u64,
    /// Total recorded requests
    pub total_requests: u64,
    /// Total recorded successes
    pub total_successes: u64,
}

/// Decorator that re-sorts a base selector's order by measured performance.
///
/// Accounts with performance data sort before accounts without; within the
/// measured group, higher success rate wins and response time breaks ties.
pub struct AdaptiveSelector {
    base: Box<dyn AccountSelector>,
    performance: RwLock<HashMap<u64, PerformanceData>>,
}

impl AdaptiveSelector {
    /// Wrap the base selector for `strategy`.
    #[must_use]
    pub fn new(strategy: FallbackStrategy) -> Self {
        Self {
            base: selector_for(strategy),
            performance: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot the performance record for one account.
    #[must_use]
    pub fn performance(&self, account_id: u64) -> Option<PerformanceData> {
        self.performance.read().get(&account_id).cloned()
    }

    /// Number of accounts with performance data.
    #[must_use]
    pub fn tracked_accounts(&self) -> usize {
        self.performance.read().len()
    }
}

impl AccountSelector for AdaptiveSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let mut ordered = self.base.order(candidates);

        let performance = self.performance.read();
        if !performance.is_empty() {
            ordered.sort_by(|a, b| {
                match (performance.get(&a.id), performance.get(&b.id)) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(pa), Some(pb)) => pb
                        .success_rate
                        .total_cmp(&pa.success_rate)
                        .then(pa.avg_response_time.cmp(&pb.avg_response_time)),
                }
            });
        }

        ordered
    }

    fn update_performance(&self, account_id: u64, success: bool, response_time: Duration) {
        let mut performance = self.performance.write();
        let entry = performance.entry(account_id).or_default();

        entry.total_requests += 1;
        if success {
            entry.total_successes += 1;
            entry.last_success_ms = epoch_millis_now();
        } else {
            entry.last_failure_ms = epoch_millis_now();
        }
        entry.success_rate = entry.total_successes as f64 / entry.total_requests as f64;

        entry.avg_response_time = if entry.avg_response_time.is_zero() {
            response_time
        } else {
            (entry.avg_response_time + response_time) / 2
        };
    }

    fn cleanup_old(&self, cutoff_ms: u64) {
        self.performance
            .write()
            .retain(|_, p| p.last_success_ms >= cutoff_ms || p.last_failure_ms >= cutoff_ms);
    }
}

/// Load-aware decorator over [`AdaptiveSelector`].
///
/// Filters out accounts whose load score exceeds the threshold before
/// delegating; when every candidate is overloaded, all pass through sorted by
/// ascending load instead.
pub struct SmartLoadBalanceSelector {
    adaptive: AdaptiveSelector,
    load_threshold: f64,
}

impl SmartLoadBalanceSelector {
    /// Create a load-balancing selector over the base `strategy` with the
    /// given load threshold (0..100).
    #[must_use]
    pub fn new(strategy: FallbackStrategy, load_threshold: f64) -> Self {
        Self {
            adaptive: AdaptiveSelector::new(strategy),
            load_threshold,
        }
    }

    fn load_score(account: &Account) -> f64 {
        let usage_load = (account.today_usage_count as f64 / USAGE_SCALE * 50.0).min(50.0);

        let status_load = match account.current_status {
            AccountStatus::Normal => 0.0,
            AccountStatus::Throttled => 20.0,
            AccountStatus::Error => 30.0,
        };

        let weight_load = if account.weight > 0 {
            (2000.0 / f64::from(account.weight)).min(20.0)
        } else {
            0.0
        };

        usage_load + status_load + weight_load
    }
}

impl AccountSelector for SmartLoadBalanceSelector {
    fn order(&self, candidates: &[Account]) -> Vec<Account> {
        let available: Vec<Account> = candidates
            .iter()
            .filter(|a| Self::load_score(a) <= self.load_threshold)
            .cloned()
            .collect();

        if available.is_empty() {
            // Everyone is overloaded; least-loaded first rather than nothing.
            let mut all = candidates.to_vec();
            all.sort_by(|a, b| Self::load_score(a).total_cmp(&Self::load_score(b)));
            return all;
        }

        self.adaptive.order(&available)
    }

    fn update_performance(&self, account_id: u64, success: bool, response_time: Duration) {
        self.adaptive
            .update_performance(account_id, success, response_time);
    }

    fn cleanup_old(&self, cutoff_ms: u64) {
        self.adaptive.cleanup_old(cutoff_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: u64, priority: i32, weight: i32, usage: i64, status: AccountStatus) -> Account {
        Account {
            id,
            name: format!("acct-{id}"),
            platform: "claude".to_string(),
            priority,
            weight,
            today_usage_count: usage,
            current_status: status,
        }
    }

    fn ids(accounts: &[Account]) -> Vec<u64> {
        accounts.iter().map(|a| a.id).collect()
    }

    // ── priority ──────────────────────────────────────────────────────────

    #[test]
    fn priority_sorts_ascending_with_usage_tiebreak() {
        let candidates = vec![
            account(1, 2, 10, 0, AccountStatus::Normal),
            account(2, 1, 10, 50, AccountStatus::Normal),
            account(3, 1, 10, 5, AccountStatus::Normal),
        ];
        let ordered = PrioritySelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![3, 2, 1]);
    }

    // ── weighted ──────────────────────────────────────────────────────────

    #[test]
    fn weighted_prefers_heavier_accounts() {
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 1, 90, 0, AccountStatus::Normal),
        ];
        let ordered = WeightedSelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[test]
    fn weighted_discounts_heavily_used_accounts() {
        // Equal weights: the account with less usage today wins.
        let candidates = vec![
            account(1, 1, 50, 900, AccountStatus::Normal),
            account(2, 1, 50, 10, AccountStatus::Normal),
        ];
        let ordered = WeightedSelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[test]
    fn weighted_zero_total_weight_keeps_input_order() {
        let candidates = vec![
            account(1, 1, 0, 0, AccountStatus::Normal),
            account(2, 1, 0, 0, AccountStatus::Normal),
            account(3, 1, 0, 0, AccountStatus::Normal),
        ];
        let ordered = WeightedSelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![1, 2, 3]);
    }

    // ── round robin ───────────────────────────────────────────────────────

    #[test]
    fn round_robin_rotates_first_place() {
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 1, 10, 0, AccountStatus::Normal),
            account(3, 1, 10, 0, AccountStatus::Normal),
        ];
        let selector = RoundRobinSelector::new();

        let mut firsts = Vec::new();
        for _ in 0..6 {
            firsts.push(selector.order(&candidates)[0].id);
        }

        // Each account leads twice over six rounds.
        for id in 1..=3u64 {
            assert_eq!(
                firsts.iter().filter(|&&f| f == id).count(),
                2,
                "account {id} should lead exactly twice, got {firsts:?}"
            );
        }
    }

    #[test]
    fn round_robin_returns_permutation() {
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 1, 10, 0, AccountStatus::Normal),
        ];
        let selector = RoundRobinSelector::new();
        for _ in 0..5 {
            let mut got = ids(&selector.order(&candidates));
            got.sort_unstable();
            assert_eq!(got, vec![1, 2]);
        }
    }

    // ── least used ────────────────────────────────────────────────────────

    #[test]
    fn least_used_sorts_by_usage_then_priority() {
        let candidates = vec![
            account(1, 1, 10, 20, AccountStatus::Normal),
            account(2, 2, 10, 5, AccountStatus::Normal),
            account(3, 1, 10, 5, AccountStatus::Normal),
        ];
        let ordered = LeastUsedSelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![3, 2, 1]);
    }

    // ── hybrid ────────────────────────────────────────────────────────────

    #[test]
    fn hybrid_emits_priority_buckets_in_order() {
        let candidates = vec![
            account(1, 2, 100, 0, AccountStatus::Normal),
            account(2, 1, 1, 999, AccountStatus::Error),
            account(3, 1, 50, 0, AccountStatus::Normal),
        ];
        let ordered = HybridSelector.order(&candidates);
        // Both priority-1 accounts come before the priority-2 account, and
        // the healthy unused one outranks the erroring exhausted one.
        assert_eq!(ids(&ordered), vec![3, 2, 1]);
    }

    #[test]
    fn hybrid_prefers_normal_status_within_bucket() {
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Throttled),
            account(2, 1, 10, 0, AccountStatus::Normal),
            account(3, 1, 10, 0, AccountStatus::Error),
        ];
        let ordered = HybridSelector.order(&candidates);
        assert_eq!(ids(&ordered), vec![2, 1, 3]);
    }

    // ── adaptive ──────────────────────────────────────────────────────────

    #[test]
    fn adaptive_without_data_keeps_base_order() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        let candidates = vec![
            account(1, 2, 10, 0, AccountStatus::Normal),
            account(2, 1, 10, 0, AccountStatus::Normal),
        ];
        assert_eq!(ids(&selector.order(&candidates)), vec![2, 1]);
    }

    #[test]
    fn adaptive_promotes_higher_success_rate() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 2, 10, 0, AccountStatus::Normal),
        ];

        // Account 1 fails often, account 2 is reliable.
        selector.update_performance(1, false, Duration::from_millis(100));
        selector.update_performance(1, true, Duration::from_millis(100));
        selector.update_performance(2, true, Duration::from_millis(100));
        selector.update_performance(2, true, Duration::from_millis(100));

        assert_eq!(ids(&selector.order(&candidates)), vec![2, 1]);
    }

    #[test]
    fn adaptive_measured_accounts_sort_before_unmeasured() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 2, 10, 0, AccountStatus::Normal),
        ];
        selector.update_performance(2, true, Duration::from_millis(50));
        assert_eq!(ids(&selector.order(&candidates)), vec![2, 1]);
    }

    #[test]
    fn adaptive_response_time_breaks_success_ties() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        let candidates = vec![
            account(1, 1, 10, 0, AccountStatus::Normal),
            account(2, 2, 10, 0, AccountStatus::Normal),
        ];
        selector.update_performance(1, true, Duration::from_millis(500));
        selector.update_performance(2, true, Duration::from_millis(20));
        assert_eq!(ids(&selector.order(&candidates)), vec![2, 1]);
    }

    #[test]
    fn adaptive_averages_response_time() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        selector.update_performance(1, true, Duration::from_millis(100));
        selector.update_performance(1, true, Duration::from_millis(300));

        let perf = selector.performance(1).unwrap();
        assert_eq!(perf.avg_response_time, Duration::from_millis(200));
        assert_eq!(perf.total_requests, 2);
        assert_eq!(perf.total_successes, 2);
        assert!((perf.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn adaptive_cleanup_drops_inactive_entries() {
        let selector = AdaptiveSelector::new(FallbackStrategy::PriorityFirst);
        selector.update_performance(1, true, Duration::from_millis(10));
        assert_eq!(selector.tracked_accounts(), 1);

        // A cutoff in the future makes the entry stale.
        selector.cleanup_old(epoch_millis_now() + 60_000);
        assert_eq!(selector.tracked_accounts(), 0);
    }

    // ── smart load balance ────────────────────────────────────────────────

    #[test]
    fn smart_filters_overloaded_accounts() {
        let selector = SmartLoadBalanceSelector::new(FallbackStrategy::PriorityFirst, 40.0);
        let candidates = vec![
            account(1, 1, 100, 950, AccountStatus::Error), // heavy load
            account(2, 1, 100, 0, AccountStatus::Normal),  // light load
        ];
        let ordered = selector.order(&candidates);
        assert_eq!(ids(&ordered), vec![2]);
    }

    #[test]
    fn smart_all_overloaded_returns_everyone_by_ascending_load() {
        let selector = SmartLoadBalanceSelector::new(FallbackStrategy::PriorityFirst, 1.0);
        let candidates = vec![
            account(1, 1, 100, 900, AccountStatus::Error),
            account(2, 1, 100, 100, AccountStatus::Normal),
        ];
        let ordered = selector.order(&candidates);
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[test]
    fn smart_zero_weight_contributes_no_weight_load() {
        let light = account(1, 1, 0, 0, AccountStatus::Normal);
        assert!(SmartLoadBalanceSelector::load_score(&light) < f64::EPSILON);
    }

    // ── factory ───────────────────────────────────────────────────────────

    #[test]
    fn selector_factory_orders_like_its_strategy() {
        let candidates = vec![
            account(1, 2, 10, 0, AccountStatus::Normal),
            account(2, 1, 10, 0, AccountStatus::Normal),
        ];
        let selector = selector_for(FallbackStrategy::PriorityFirst);
        assert_eq!(ids(&selector.order(&candidates)), vec![2, 1]);
    }
}
