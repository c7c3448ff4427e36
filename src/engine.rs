//! Admission decision engine.
//!
//! Orchestrates policy lookup, identifier derivation, the shared counter and
//! the local fallback. Store failures degrade to the local store; defects in
//! the orchestration itself (errors or panics) fail open.

use crate::algorithms::{AdmissionResult, LocalWindowStore, RedisSlidingWindow, SharedCounter};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identifier::{
    canonicalize_path, derive_identifier, extract_client_ip, RequestDescriptor, RequestIdentifier,
    UNKNOWN_PATH,
};
use crate::metrics::AdmissionMetrics;
use crate::mode::{FallbackSwitch, StoreMode, SwitchConfig};
use crate::policy::{PolicyConfig, PolicyRegistry, RateLimitPolicy};
use crate::redis::RedisClient;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionMode {
    Shared,
    Fallback,
    FailOpen,
    Disabled,
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMode::Shared => "shared",
            DecisionMode::Fallback => "fallback",
            DecisionMode::FailOpen => "fail-open",
            DecisionMode::Disabled => "disabled",
        }
    }
}

/// An admission result together with what produced it.
#[derive(Debug, Clone)]
pub struct Decision {
    pub identifier: Option<RequestIdentifier>,
    pub policy: Arc<RateLimitPolicy>,
    pub result: AdmissionResult,
    pub mode: DecisionMode,
    pub decided_at_ms: u64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.result.allowed
    }

    /// When the oldest recorded request leaves the window (ms since epoch).
    pub fn reset_at_ms(&self) -> u64 {
        self.decided_at_ms.saturating_add(self.result.ms_until_reset)
    }

    /// Whole seconds a throttled caller should wait, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        self.result.ms_until_reset.div_ceil(1000).max(1)
    }
}

pub struct AdmissionEngine {
    registry: RwLock<Arc<PolicyRegistry>>,
    shared: Option<Arc<dyn SharedCounter>>,
    local: Arc<LocalWindowStore>,
    switch: FallbackSwitch,
    metrics: AdmissionMetrics,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl AdmissionEngine {
    /// Engine without a shared counter: every decision is served locally.
    pub fn new(registry: PolicyRegistry, local: Arc<LocalWindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            shared: None,
            local,
            switch: FallbackSwitch::new(SwitchConfig::default(), Arc::clone(&clock)),
            metrics: AdmissionMetrics::new(),
            clock,
            enabled: true,
        }
    }

    pub fn with_shared_counter(mut self, counter: Arc<dyn SharedCounter>) -> Self {
        self.shared = Some(counter);
        self
    }

    pub fn with_switch_config(mut self, config: SwitchConfig) -> Self {
        self.switch = FallbackSwitch::new(config, Arc::clone(&self.clock));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build the production engine. Redis is dialled lazily, so this succeeds
    /// even while the shared store is down.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let registry = config.load_policies()?;
        let local = Arc::new(LocalWindowStore::new(Arc::clone(&clock), config.retention()));

        let mut engine = Self::new(registry, local, Arc::clone(&clock))
            .with_switch_config(config.switch_config())
            .with_enabled(!config.skip_rate_limit);

        if config.disable_redis {
            warn!(
                target: "admission_gate::engine",
                "Shared store disabled by configuration, all decisions use the local fallback"
            );
        } else {
            let client = RedisClient::new(&config.redis_url, config.redis_timeout())?;
            let counter =
                RedisSlidingWindow::new(Arc::new(client), clock, &config.redis_key_prefix);
            engine = engine.with_shared_counter(Arc::new(counter));
        }
        if !engine.enabled {
            warn!(target: "admission_gate::engine", "Admission control is skipped");
        }

        Ok(engine)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    pub fn store_mode(&self) -> StoreMode {
        self.switch.state()
    }

    pub fn switch(&self) -> &FallbackSwitch {
        &self.switch
    }

    pub fn local_store(&self) -> &Arc<LocalWindowStore> {
        &self.local
    }

    pub fn shared_counter(&self) -> Option<&Arc<dyn SharedCounter>> {
        self.shared.as_ref()
    }

    pub fn policies(&self) -> Arc<PolicyRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new policy table. Requests in flight keep the table they
    /// started with.
    pub fn reload_policies(&self, table: PolicyConfig) -> Result<Arc<PolicyRegistry>> {
        let fallback_default = self.policies().default_policy().clone();
        let registry = Arc::new(PolicyRegistry::compile(table, fallback_default)?);

        let mut slot = self
            .registry
            .write()
            .map_err(|_| Error::Internal("policy registry lock poisoned".into()))?;
        *slot = Arc::clone(&registry);
        info!(
            target: "admission_gate::engine",
            rules = registry.rule_count(),
            "Reloaded rate limit policies"
        );
        Ok(registry)
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.local.spawn_sweeper(interval)
    }

    /// Decide whether a request may proceed. Never fails and never panics.
    pub async fn decide(&self, request: &RequestDescriptor) -> Decision {
        if !self.enabled {
            let path = canonicalize_path(&request.path);
            let policy = self
                .policies()
                .policy_for(path.as_deref().unwrap_or(UNKNOWN_PATH));
            return Decision {
                identifier: None,
                result: AdmissionResult::pass_through(&policy),
                policy,
                mode: DecisionMode::Disabled,
                decided_at_ms: self.now_ms_outside_guard(),
            };
        }

        match AssertUnwindSafe(self.try_decide(request)).catch_unwind().await {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => self.fail_open(request, &err.to_string()),
            Err(panic) => self.fail_open(request, &panic_message(panic.as_ref())),
        }
    }

    async fn try_decide(&self, request: &RequestDescriptor) -> Result<Decision> {
        let registry = self.policies();
        let path = canonicalize_path(&request.path);
        let policy = registry.policy_for(path.as_deref().unwrap_or(UNKNOWN_PATH));

        let address = if request.caller_address.trim().is_empty() {
            extract_client_ip(&request.headers).unwrap_or_default()
        } else {
            request.caller_address.clone()
        };
        let identifier = derive_identifier(&address, &request.path, &request.headers);

        // Reset times are relative to the moment the window was evaluated,
        // not to when the store replied.
        let decided_at_ms = self.clock.now_ms();
        let (result, mode) = self.admit(&identifier, &policy).await;
        self.metrics
            .record_decision(&policy.description, &result, mode);

        if result.allowed {
            debug!(
                target: "admission_gate::engine",
                identifier = %identifier,
                policy = %policy.description,
                remaining = result.remaining,
                mode = mode.as_str(),
                "Request admitted"
            );
        } else {
            info!(
                target: "admission_gate::engine",
                identifier = %identifier,
                policy = %policy.description,
                total_hits = result.total_hits,
                ms_until_reset = result.ms_until_reset,
                mode = mode.as_str(),
                "Request throttled"
            );
        }

        Ok(Decision {
            identifier: Some(identifier),
            policy,
            result,
            mode,
            decided_at_ms,
        })
    }

    async fn admit(
        &self,
        identifier: &RequestIdentifier,
        policy: &RateLimitPolicy,
    ) -> (AdmissionResult, DecisionMode) {
        if let Some(shared) = &self.shared {
            if self.switch.should_try_shared() {
                match shared.try_admit(identifier, policy).await {
                    Ok(result) => {
                        self.switch.record_success();
                        return (result, DecisionMode::Shared);
                    }
                    Err(err) => {
                        self.metrics.record_store_error();
                        let tripped = self.switch.record_failure();
                        warn!(
                            target: "admission_gate::engine",
                            identifier = %identifier,
                            backend = shared.backend(),
                            error = %err,
                            tripped,
                            "Shared store unavailable, degrading to local fallback"
                        );
                    }
                }
            }
        }

        let mut result = self.local.try_admit(identifier, policy);
        result.degraded = true;
        (result, DecisionMode::Fallback)
    }

    fn fail_open(&self, request: &RequestDescriptor, reason: &str) -> Decision {
        let policy = Arc::new(
            self.registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .default_policy()
                .clone(),
        );
        let result = AdmissionResult::pass_through(&policy);
        self.metrics
            .record_decision(&policy.description, &result, DecisionMode::FailOpen);

        error!(
            target: "admission_gate::engine",
            method = %request.method,
            path = %request.path,
            reason,
            "Internal admission control fault, failing open"
        );

        Decision {
            identifier: None,
            policy,
            result,
            mode: DecisionMode::FailOpen,
            decided_at_ms: self.now_ms_outside_guard(),
        }
    }

    /// Injected clock for paths that run outside the unwind guard. A clock
    /// that panics there falls back to wall time.
    fn now_ms_outside_guard(&self) -> u64 {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.clock.now_ms()))
            .unwrap_or_else(|_| SystemClock::new().now_ms())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("enabled", &self.enabled)
            .field("shared", &self.shared.as_ref().map(|s| s.backend()))
            .field("mode", &self.switch.state())
            .finish_non_exhaustive()
    }
}
