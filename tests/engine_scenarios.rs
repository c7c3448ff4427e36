mod common;

use admission_gate::clock::{Clock, MockClock};
use admission_gate::identifier::{derive_identifier, fingerprint};
use admission_gate::mode::StoreMode;
use admission_gate::{AdmissionEngine, DecisionMode, PolicyRegistry, RateLimitPolicy, RequestDescriptor};
use common::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn caller_x() -> RequestDescriptor {
    RequestDescriptor::new("GET", "/api/reports?page=1", "203.0.113.10").with_header("User-Agent", "Mozilla/5.0")
}

#[tokio::test]
async fn scenario_a_three_allowed_then_throttled() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let engine = engine_with(&clock, counter.clone());

    let mut remaining = Vec::new();
    for _ in 0..3 {
        let decision = engine.decide(&caller_x()).await;
        assert!(decision.allowed());
        assert_eq!(decision.mode, DecisionMode::Shared);
        assert!(!decision.result.degraded);
        remaining.push(decision.result.remaining);
        clock.advance(Duration::from_secs(5));
    }
    assert_eq!(remaining, vec![2, 1, 0]);

    let fourth = engine.decide(&caller_x()).await;
    assert!(!fourth.allowed());
    assert_eq!(fourth.result.remaining, 0);
    assert!(fourth.result.ms_until_reset > 0);
}

#[tokio::test]
async fn scenario_b_oldest_entry_frees_one_slot() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let engine = engine_with(&clock, counter.clone());

    for _ in 0..3 {
        assert!(engine.decide(&caller_x()).await.allowed());
        clock.advance(Duration::from_secs(10));
    }
    let rejected = engine.decide(&caller_x()).await;
    assert!(!rejected.allowed());
    assert_eq!(rejected.result.ms_until_reset, 30_000);

    clock.advance(Duration::from_millis(rejected.result.ms_until_reset));
    let after = engine.decide(&caller_x()).await;
    assert!(after.allowed());
    // Two arrivals are still inside the window, so only one slot opened.
    assert_eq!(after.result.total_hits, 3);
    assert_eq!(after.result.remaining, 0);
    assert!(!engine.decide(&caller_x()).await.allowed());
}

#[tokio::test]
async fn scenario_b_burst_in_one_instant_expires_together() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let engine = engine_with(&clock, counter);

    for _ in 0..3 {
        assert!(engine.decide(&caller_x()).await.allowed());
    }
    let rejected = engine.decide(&caller_x()).await;
    assert_eq!(rejected.result.ms_until_reset, 60_000);

    clock.advance(Duration::from_millis(rejected.result.ms_until_reset));
    let after = engine.decide(&caller_x()).await;
    assert!(after.allowed());
    assert_eq!(after.result.remaining, 2);
}

#[tokio::test]
async fn rejected_requests_do_not_consume_quota() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let engine = engine_with(&clock, counter.clone());

    for _ in 0..3 {
        assert!(engine.decide(&caller_x()).await.allowed());
    }
    for _ in 0..20 {
        assert!(!engine.decide(&caller_x()).await.allowed());
    }
    let identifier = engine.decide(&caller_x()).await.identifier.unwrap();
    assert_eq!(counter.entries(&identifier), 3);

    clock.advance(Duration::from_secs(60));
    let after = engine.decide(&caller_x()).await;
    assert!(after.allowed());
    assert_eq!(after.result.remaining, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_limit() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let clock_handle: Arc<dyn Clock> = Arc::new(clock.clone());
    let registry = PolicyRegistry::compile(
        admission_gate::PolicyConfig {
            rules: vec![],
            default: None,
        },
        RateLimitPolicy::new(Duration::from_secs(60), 10, "Burst"),
    )
    .unwrap();
    let engine = Arc::new(
        AdmissionEngine::new(registry, local_store(Arc::clone(&clock_handle)), clock_handle)
            .with_shared_counter(counter),
    );

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.decide(&caller_x()).await.allowed() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn shared_store_failure_degrades_every_decision() {
    let clock = MockClock::new(START_MS);
    let failing = Arc::new(FailingCounter::default());
    let engine = engine_with(&clock, failing.clone());

    for i in 0..6 {
        let decision = engine.decide(&caller_x()).await;
        assert!(decision.result.degraded);
        assert_eq!(decision.mode, DecisionMode::Fallback);
        assert_eq!(decision.allowed(), i < 3, "request {}", i);
    }

    // Threshold is 3: after that the shared store is no longer attempted.
    assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.store_mode(), StoreMode::Degraded);

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.shared_store_errors, 3);
    assert_eq!(snapshot.global.degraded_decisions, 6);
    assert_eq!(snapshot.global.fail_open_decisions, 0);
}

#[tokio::test]
async fn degraded_mode_reprobes_shared_store() {
    let clock = MockClock::new(START_MS);
    let failing = Arc::new(FailingCounter::default());
    let engine = engine_with(&clock, failing.clone());

    for _ in 0..5 {
        engine.decide(&caller_x()).await;
    }
    assert_eq!(failing.calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(30));
    let probe = engine.decide(&caller_x()).await;
    assert!(probe.result.degraded);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 4);
    assert_eq!(engine.store_mode(), StoreMode::Degraded);
}

#[tokio::test]
async fn recovers_to_shared_mode_after_outage() {
    let clock = MockClock::new(START_MS);
    let counter = Arc::new(InMemorySharedCounter::new(Arc::new(clock.clone())));
    let engine = engine_with(&clock, counter.clone());

    for _ in 0..3 {
        engine.switch().record_failure();
    }
    let degraded = engine.decide(&caller_x()).await;
    assert_eq!(degraded.mode, DecisionMode::Fallback);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(31));
    let recovered = engine.decide(&caller_x()).await;
    assert_eq!(recovered.mode, DecisionMode::Shared);
    assert!(!recovered.result.degraded);
    assert_eq!(engine.store_mode(), StoreMode::Probing);
    assert_eq!(engine.switch().consecutive_failures(), 0);
}

#[tokio::test]
async fn forced_fallback_mode_is_reported() {
    let clock = MockClock::new(START_MS);
    let engine = local_engine(&clock);

    let decision = engine.decide(&caller_x()).await;
    assert!(decision.allowed());
    assert!(decision.result.degraded);
    assert_eq!(decision.mode, DecisionMode::Fallback);
}

#[tokio::test]
async fn panicking_shared_counter_fails_open() {
    let clock = MockClock::new(START_MS);
    let engine = engine_with(&clock, Arc::new(PanickingCounter));

    for _ in 0..10 {
        let decision = engine.decide(&caller_x()).await;
        assert!(decision.allowed());
        assert_eq!(decision.mode, DecisionMode::FailOpen);
        assert!(!decision.result.degraded);
    }
    let global = engine.metrics().global();
    assert_eq!(global.fail_open_decisions, 10);
    assert_eq!(global.throttled_requests, 0);
    assert_eq!(global.degraded_decisions, 0);
}

#[tokio::test]
async fn fault_inside_orchestration_fails_open() {
    let clock: Arc<dyn Clock> = Arc::new(PanicClock);
    let engine = AdmissionEngine::new(scenario_registry(), local_store(Arc::clone(&clock)), clock);

    let decision = engine.decide(&caller_x()).await;
    assert!(decision.allowed());
    assert_eq!(decision.mode, DecisionMode::FailOpen);
    assert!(!decision.result.degraded);
    assert_eq!(decision.policy.description, "Scenario");
    assert_eq!(engine.metrics().global().degraded_decisions, 0);
    assert_eq!(engine.metrics().global().fail_open_decisions, 1);
}

#[tokio::test]
async fn policy_lookup_is_pure() {
    let registry = PolicyRegistry::builtin(scenario_policy()).unwrap();
    let paths = ["/api/auth/login", "/api/clean-routing", "/dashboard", "/api/ai-classify"];
    for path in paths {
        let first = registry.policy_for(path);
        for _ in 0..50 {
            assert_eq!(*registry.policy_for(path), *first);
        }
    }
}

#[tokio::test]
async fn scenario_c_shared_address_different_metadata() {
    let clock = MockClock::new(START_MS);
    let engine = local_engine(&clock);

    let chrome = RequestDescriptor::new("GET", "/api/reports", "198.51.100.1").with_header("User-Agent", "Chrome/120");
    let firefox = RequestDescriptor::new("GET", "/api/reports", "198.51.100.1").with_header("User-Agent", "Firefox/121");
    let garbage = RequestDescriptor::new("GET", "/api/reports", "198.51.100.1")
        .with_header("User-Agent", &"\u{0}\u{1}zz".repeat(10_000));

    let a = engine.decide(&chrome).await;
    let b = engine.decide(&firefox).await;
    let c = engine.decide(&garbage).await;
    assert!(a.allowed() && b.allowed() && c.allowed());

    let (a, b) = (a.identifier.unwrap(), b.identifier.unwrap());
    assert_ne!(a, b);

    // Identifiers may only collide through the 32-bit fingerprint.
    let mut metadata = HashMap::new();
    metadata.insert("user-agent".to_string(), "Chrome/120".to_string());
    assert_eq!(a, derive_identifier("198.51.100.1", "/api/reports", &metadata));
    assert_eq!(fingerprint(&metadata).len(), 8);
}
