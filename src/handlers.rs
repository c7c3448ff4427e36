use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::{AdmissionEngine, Decision};
use crate::error::Error;
use crate::health::HealthChecker;
use crate::identifier::RequestDescriptor;
use crate::metrics::MetricsSnapshot;
use crate::policy::PolicyConfig;
use crate::response::{apply_headers, rfc3339_millis};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub engine: Arc<AdmissionEngine>,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(engine: Arc<AdmissionEngine>) -> SharedState {
        Arc::new(Self {
            health: HealthChecker::new(Arc::clone(&engine)),
            engine,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub mode: &'static str,
    pub degraded: bool,
    pub identifier: Option<String>,
    pub policy: String,
    pub limit: u32,
    pub remaining: u64,
    pub total_hits: u64,
    pub ms_until_reset: u64,
    pub retry_after: Option<u64>,
    pub reset_time: String,
}

impl CheckResponse {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            allowed: decision.allowed(),
            mode: decision.mode.as_str(),
            degraded: decision.result.degraded,
            identifier: decision.identifier.as_ref().map(|id| id.to_string()),
            policy: decision.policy.description.clone(),
            limit: decision.policy.max_requests,
            remaining: decision.result.remaining,
            total_hits: decision.result.total_hits,
            ms_until_reset: decision.result.ms_until_reset,
            retry_after: (!decision.allowed()).then(|| decision.retry_after_secs()),
            reset_time: rfc3339_millis(decision.reset_at_ms()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PolicyUpdateResponse {
    pub status: String,
    pub message: String,
    pub rules: usize,
}

/// Decide on a request described by a host in another process.
pub async fn check_admission(
    State(state): State<SharedState>,
    Json(descriptor): Json<RequestDescriptor>,
) -> Response {
    let decision = state.engine.decide(&descriptor).await;

    let status = if decision.allowed() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let mut response = (status, Json(CheckResponse::from_decision(&decision))).into_response();
    apply_headers(&mut response, &decision);
    response
}

pub async fn get_policies(State(state): State<SharedState>) -> Json<PolicyConfig> {
    Json(state.engine.policies().to_config())
}

pub async fn replace_policies(
    State(state): State<SharedState>,
    Json(table): Json<PolicyConfig>,
) -> Result<Json<PolicyUpdateResponse>, Error> {
    let registry = state.engine.reload_policies(table)?;

    Ok(Json(PolicyUpdateResponse {
        status: "success".to_string(),
        message: "Rate limit policies replaced".to_string(),
        rules: registry.rule_count(),
    }))
}

pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().snapshot())
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint. The gate can always decide, so it is ready even
/// while the shared store is down.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.health.check_health().await;
    let shared = health.dependencies.shared_store.status;

    if shared == "healthy" {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "shared_store": "connected"
            })),
        )
    } else {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "shared_store": shared,
                "note": "Running on local fallback store"
            })),
        )
    }
}
