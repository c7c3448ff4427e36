//! In-process sliding window used while the shared store is unreachable.

use super::{AdmissionResult, WindowSnapshot};
use crate::clock::Clock;
use crate::identifier::RequestIdentifier;
use crate::policy::RateLimitPolicy;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

#[derive(Debug, Default)]
struct LocalWindow {
    timestamps: VecDeque<u64>,
    window_ms: u64,
}

impl LocalWindow {
    fn newest(&self) -> Option<u64> {
        self.timestamps.iter().copied().max()
    }
}

/// Per-identifier timestamp lists in a sharded map.
///
/// A bucket is mutated under its shard's lock only, so unrelated callers do
/// not contend on one global lock. The store never fails: it is the last
/// resort when everything else is down.
#[derive(Debug)]
pub struct LocalWindowStore {
    buckets: DashMap<String, LocalWindow>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl LocalWindowStore {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            retention,
        }
    }

    pub fn try_admit(&self, identifier: &RequestIdentifier, policy: &RateLimitPolicy) -> AdmissionResult {
        let now = self.clock.now_ms();
        let window_ms = policy.window_ms();

        let mut bucket = self
            .buckets
            .entry(identifier.as_str().to_owned())
            .or_default();
        bucket.window_ms = window_ms;

        // Tolerates timestamps pushed out of order by a clock step.
        bucket
            .timestamps
            .retain(|&t| t.saturating_add(window_ms) > now);

        let count_before = bucket.timestamps.len() as u64;
        let admitted = count_before < policy.max_requests as u64;
        if admitted {
            bucket.timestamps.push_back(now);
        }
        let oldest_ms = bucket.timestamps.iter().copied().min().unwrap_or(now);
        drop(bucket);

        WindowSnapshot {
            count_before,
            admitted,
            oldest_ms,
        }
        .evaluate(policy, now, true)
    }

    /// Drop buckets whose newest entry is older than the retention ceiling
    /// (or their own window, if longer). Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let retention_ms = self.retention.as_millis() as u64;
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            let keep_for = retention_ms.max(bucket.window_ms);
            bucket
                .newest()
                .is_some_and(|newest| newest.saturating_add(keep_for) > now)
        });

        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep();
                debug!(
                    target: "admission_gate::fallback",
                    removed,
                    remaining = store.len(),
                    "Swept local fallback buckets"
                );
            }
        })
    }
}
