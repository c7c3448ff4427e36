//! Sticky fallback mode for the shared store.
//!
//! While `Probing`, every decision tries the shared store. After
//! `failure_threshold` consecutive failures the switch moves to `Degraded`
//! and decisions go straight to the local store, skipping the connection
//! timeout. Once `probe_interval` has passed the switch returns to `Probing`;
//! a single further failure sends it back to `Degraded`, a success clears it.

use crate::clock::Clock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Probing = 0,
    Degraded = 1,
}

impl From<u8> for StoreMode {
    fn from(value: u8) -> Self {
        match value {
            1 => StoreMode::Degraded,
            _ => StoreMode::Probing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub failure_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct FallbackSwitch {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    degraded_since_ms: AtomicU64,
    config: SwitchConfig,
    clock: Arc<dyn Clock>,
}

impl FallbackSwitch {
    pub fn new(config: SwitchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(StoreMode::Probing as u8),
            consecutive_failures: AtomicU64::new(0),
            degraded_since_ms: AtomicU64::new(0),
            config,
            clock,
        }
    }

    pub fn state(&self) -> StoreMode {
        StoreMode::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether the next decision should try the shared store.
    pub fn should_try_shared(&self) -> bool {
        match self.state() {
            StoreMode::Probing => true,
            StoreMode::Degraded => {
                let since = self.degraded_since_ms.load(Ordering::Acquire);
                let elapsed = self.clock.now_ms().saturating_sub(since);
                if elapsed < self.config.probe_interval.as_millis() as u64 {
                    return false;
                }
                let moved = self
                    .state
                    .compare_exchange(
                        StoreMode::Degraded as u8,
                        StoreMode::Probing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if moved {
                    info!(
                        target: "admission_gate::mode",
                        degraded_for_ms = elapsed,
                        "Re-probing shared store"
                    );
                }
                true
            }
        }
    }

    pub fn record_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::AcqRel);
        self.state.store(StoreMode::Probing as u8, Ordering::Release);
        if failures >= self.config.failure_threshold as u64 {
            info!(
                target: "admission_gate::mode",
                failures,
                "Shared store recovered"
            );
        }
    }

    /// Returns `true` when this failure switched the gate into `Degraded`.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.config.failure_threshold as u64 {
            return false;
        }

        self.degraded_since_ms
            .store(self.clock.now_ms(), Ordering::Release);
        let previous = self.state.swap(StoreMode::Degraded as u8, Ordering::AcqRel);
        let tripped = StoreMode::from(previous) == StoreMode::Probing;
        if tripped {
            warn!(
                target: "admission_gate::mode",
                failures,
                probe_interval_ms = self.config.probe_interval.as_millis() as u64,
                "Shared store marked degraded, serving from local fallback"
            );
        }
        tripped
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.degraded_since_ms.store(0, Ordering::Release);
        self.state.store(StoreMode::Probing as u8, Ordering::Release);
    }
}
