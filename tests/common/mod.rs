#![allow(dead_code)]

use admission_gate::algorithms::{AdmissionResult, LocalWindowStore, SharedCounter, WindowSnapshot};
use admission_gate::clock::{Clock, MockClock};
use admission_gate::mode::SwitchConfig;
use admission_gate::policy::{PolicyConfig, PolicyRegistry, RateLimitPolicy};
use admission_gate::{AdmissionEngine, Error, RequestIdentifier, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_MS: u64 = 1_700_000_000_000;

/// Shared counter that applies the same prune/count/insert step under one
/// lock, standing in for the Redis script.
#[derive(Debug)]
pub struct InMemorySharedCounter {
    sets: Mutex<HashMap<String, Vec<u64>>>,
    clock: Arc<dyn Clock>,
    pub calls: AtomicUsize,
}

impl InMemorySharedCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            clock,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn entries(&self, identifier: &RequestIdentifier) -> usize {
        self.sets
            .lock()
            .unwrap()
            .get(identifier.as_str())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SharedCounter for InMemorySharedCounter {
    async fn try_admit(
        &self,
        identifier: &RequestIdentifier,
        policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_ms();
        let window = policy.window_ms();

        let mut sets = self.sets.lock().unwrap();
        let set = sets.entry(identifier.to_string()).or_default();
        set.retain(|&t| t + window > now);
        let count_before = set.len() as u64;
        let admitted = count_before < policy.max_requests as u64;
        if admitted {
            set.push(now);
        }
        let oldest_ms = set.iter().copied().min().unwrap_or(now);

        Ok(WindowSnapshot {
            count_before,
            admitted,
            oldest_ms,
        }
        .evaluate(policy, now, false))
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Duration::from_millis(1))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Shared counter whose store is always unreachable.
#[derive(Debug, Default)]
pub struct FailingCounter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SharedCounter for FailingCounter {
    async fn try_admit(
        &self,
        _identifier: &RequestIdentifier,
        _policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Store("connection refused".into()))
    }

    async fn ping(&self) -> Result<Duration> {
        Err(Error::StoreTimeout(200))
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

/// Shared counter with a bug: it panics instead of returning.
#[derive(Debug, Default)]
pub struct PanickingCounter;

#[async_trait]
impl SharedCounter for PanickingCounter {
    async fn try_admit(
        &self,
        _identifier: &RequestIdentifier,
        _policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult> {
        panic!("index out of bounds in window arithmetic");
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Duration::ZERO)
    }

    fn backend(&self) -> &'static str {
        "panicking"
    }
}

/// Clock that panics on use.
#[derive(Debug)]
pub struct PanicClock;

impl Clock for PanicClock {
    fn now_ms(&self) -> u64 {
        panic!("clock exploded");
    }
}

pub fn scenario_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(Duration::from_secs(60), 3, "Scenario")
}

/// Registry where every path falls to a `{60s, 3}` default.
pub fn scenario_registry() -> PolicyRegistry {
    PolicyRegistry::compile(
        PolicyConfig {
            rules: vec![],
            default: None,
        },
        scenario_policy(),
    )
    .unwrap()
}

pub fn local_store(clock: Arc<dyn Clock>) -> Arc<LocalWindowStore> {
    Arc::new(LocalWindowStore::new(clock, Duration::from_secs(3600)))
}

/// Engine with no shared store, always in fallback.
pub fn local_engine(clock: &MockClock) -> AdmissionEngine {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    AdmissionEngine::new(scenario_registry(), local_store(Arc::clone(&clock)), clock).with_switch_config(
        SwitchConfig {
            failure_threshold: 3,
            probe_interval: Duration::from_secs(30),
        },
    )
}

pub fn engine_with(clock: &MockClock, counter: Arc<dyn SharedCounter>) -> AdmissionEngine {
    local_engine(clock).with_shared_counter(counter)
}
