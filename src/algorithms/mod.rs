//! Sliding-window admission algorithms.
//!
//! Both stores implement the same window: an entry stamped `t` counts while
//! `now < t + window`. A request is recorded only when it is admitted, so
//! rejected attempts never consume quota.

pub mod local_window;
pub mod sliding_window;

pub use local_window::LocalWindowStore;
pub use sliding_window::RedisSlidingWindow;

use crate::error::Result;
use crate::identifier::RequestIdentifier;
use crate::policy::RateLimitPolicy;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Requests recorded in the window, including this one when admitted.
    pub total_hits: u64,
    pub remaining: u64,
    /// Time until the oldest recorded request leaves the window.
    pub ms_until_reset: u64,
    /// Served by the local fallback store instead of the shared store.
    pub degraded: bool,
}

impl AdmissionResult {
    /// Admit without counting. Used when the gate itself is broken or
    /// switched off; neither store served it, so it is not degraded.
    pub fn pass_through(policy: &RateLimitPolicy) -> Self {
        Self {
            allowed: true,
            total_hits: 0,
            remaining: policy.max_requests as u64,
            ms_until_reset: 0,
            degraded: false,
        }
    }
}

/// Raw state of a window right after an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Entries inside the window before this request was considered.
    pub count_before: u64,
    pub admitted: bool,
    /// Timestamp of the oldest surviving entry (ms since epoch).
    pub oldest_ms: u64,
}

impl WindowSnapshot {
    pub fn evaluate(&self, policy: &RateLimitPolicy, now_ms: u64, degraded: bool) -> AdmissionResult {
        let max = policy.max_requests as u64;
        let total_hits = if self.admitted {
            self.count_before + 1
        } else {
            self.count_before
        };
        let reset_at = self.oldest_ms.saturating_add(policy.window_ms());
        let mut ms_until_reset = reset_at.saturating_sub(now_ms);
        if !self.admitted {
            ms_until_reset = ms_until_reset.max(1);
        }

        AdmissionResult {
            allowed: self.admitted,
            total_hits,
            remaining: max.saturating_sub(total_hits),
            ms_until_reset,
            degraded,
        }
    }
}

/// A window counter shared by every instance of the service.
///
/// Implementations must perform prune, count and conditional insert as one
/// atomic operation and report every store failure as an error; they never
/// decide how to degrade.
#[async_trait]
pub trait SharedCounter: Send + Sync {
    async fn try_admit(
        &self,
        identifier: &RequestIdentifier,
        policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult>;

    /// Round-trip latency to the store.
    async fn ping(&self) -> Result<Duration>;

    fn backend(&self) -> &'static str;
}
