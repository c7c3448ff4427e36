use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use crate::engine::AdmissionEngine;
use crate::mode::StoreMode;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub admission_enabled: bool,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub shared_store: ServiceStatus,
    pub fallback_store: FallbackStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FallbackStatus {
    pub mode: String,
    pub consecutive_failures: u64,
    pub tracked_identifiers: usize,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    engine: Arc<AdmissionEngine>,
}

impl HealthChecker {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self { engine }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let shared_store = self.check_shared_store().await;

        // Without a shared store the gate still works, just per instance.
        let overall_status = if shared_store.status == "healthy" || shared_store.status == "disabled" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            admission_enabled: self.engine.is_enabled(),
            dependencies: DependencyStatus {
                shared_store,
                fallback_store: FallbackStatus {
                    mode: match self.engine.store_mode() {
                        StoreMode::Probing => "probing".to_string(),
                        StoreMode::Degraded => "degraded".to_string(),
                    },
                    consecutive_failures: self.engine.switch().consecutive_failures(),
                    tracked_identifiers: self.engine.local_store().len(),
                },
            },
        }
    }

    async fn check_shared_store(&self) -> ServiceStatus {
        let Some(counter) = self.engine.shared_counter() else {
            return ServiceStatus {
                status: "disabled".to_string(),
                response_time_ms: 0,
                error: None,
            };
        };

        match counter.ping().await {
            Ok(latency) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms: latency.as_millis() as u64,
                error: None,
            },
            Err(err) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: 0,
                error: Some(err.to_string()),
            },
        }
    }
}
