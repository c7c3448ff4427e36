use crate::algorithms::AdmissionResult;
use crate::engine::DecisionMode;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionCounters {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub degraded_decisions: u64,
    pub fail_open_decisions: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    total: AtomicU64,
    allowed: AtomicU64,
    throttled: AtomicU64,
    degraded: AtomicU64,
    fail_open: AtomicU64,
}

impl AtomicCounters {
    fn record(&self, result: &AdmissionResult, mode: DecisionMode) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if result.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.throttled.fetch_add(1, Ordering::Relaxed);
        }
        if result.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        if mode == DecisionMode::FailOpen {
            self.fail_open.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> AdmissionCounters {
        AdmissionCounters {
            total_requests: self.total.load(Ordering::Relaxed),
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            throttled_requests: self.throttled.load(Ordering::Relaxed),
            degraded_decisions: self.degraded.load(Ordering::Relaxed),
            fail_open_decisions: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: AdmissionCounters,
    pub shared_store_errors: u64,
    pub per_policy: BTreeMap<String, AdmissionCounters>,
    pub since: u64,
}

/// Decision counters, globally and per policy description.
#[derive(Debug)]
pub struct AdmissionMetrics {
    global: AtomicCounters,
    per_policy: DashMap<String, AtomicCounters>,
    store_errors: AtomicU64,
    since: u64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self {
            global: AtomicCounters::default(),
            per_policy: DashMap::new(),
            store_errors: AtomicU64::new(0),
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn record_decision(&self, policy: &str, result: &AdmissionResult, mode: DecisionMode) {
        self.global.record(result, mode);
        if let Some(counters) = self.per_policy.get(policy) {
            counters.record(result, mode);
            return;
        }
        self.per_policy
            .entry(policy.to_string())
            .or_default()
            .record(result, mode);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn global(&self) -> AdmissionCounters {
        self.global.snapshot()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            global: self.global.snapshot(),
            shared_store_errors: self.store_errors.load(Ordering::Relaxed),
            per_policy: self
                .per_policy
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
            since: self.since,
        }
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(allowed: bool, degraded: bool) -> AdmissionResult {
        AdmissionResult {
            allowed,
            total_hits: 1,
            remaining: 0,
            ms_until_reset: 0,
            degraded,
        }
    }

    #[test]
    fn test_records_per_policy_and_global() {
        let metrics = AdmissionMetrics::new();
        metrics.record_decision("Auth", &result(true, false), DecisionMode::Shared);
        metrics.record_decision("Auth", &result(false, true), DecisionMode::Fallback);
        metrics.record_decision("General", &result(true, false), DecisionMode::FailOpen);
        metrics.record_store_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.total_requests, 3);
        assert_eq!(snapshot.global.throttled_requests, 1);
        assert_eq!(snapshot.global.degraded_decisions, 1);
        assert_eq!(snapshot.global.fail_open_decisions, 1);
        assert_eq!(snapshot.shared_store_errors, 1);
        assert_eq!(snapshot.per_policy["Auth"].total_requests, 2);
        assert_eq!(snapshot.per_policy["General"].allowed_requests, 1);
    }
}
