use crate::engine::Decision;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const HEADER_MODE: HeaderName = HeaderName::from_static("x-ratelimit-mode");

/// Body of a `429 Too Many Requests` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottledResponse {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
    pub limit: u32,
    pub remaining: u64,
    pub reset_time: String,
    pub policy: String,
}

impl ThrottledResponse {
    pub fn from_decision(decision: &Decision) -> Self {
        let retry_after = decision.retry_after_secs();
        Self {
            error: "rate_limit_exceeded".to_string(),
            message: format!(
                "Too many requests. Limit of {} per {} exceeded, retry after {} seconds.",
                decision.policy.max_requests,
                humantime::format_duration(decision.policy.window),
                retry_after
            ),
            retry_after,
            limit: decision.policy.max_requests,
            remaining: decision.result.remaining,
            reset_time: rfc3339_millis(decision.reset_at_ms()),
            policy: decision.policy.description.clone(),
        }
    }
}

/// Rate limit headers for a decision. `Retry-After` is present only when the
/// request was throttled.
pub fn rate_limit_headers(decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.policy.max_requests));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.result.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_at_ms().div_ceil(1000)));
    headers.insert(HEADER_MODE, HeaderValue::from_static(decision.mode.as_str()));
    if !decision.allowed() {
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
    }
    headers
}

pub fn apply_headers(response: &mut Response, decision: &Decision) {
    response.headers_mut().extend(rate_limit_headers(decision));
}

/// The short-circuit response for a throttled request.
pub fn throttled_response(decision: &Decision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ThrottledResponse::from_decision(decision)),
    )
        .into_response();
    apply_headers(&mut response, decision);
    response
}

pub fn rfc3339_millis(epoch_ms: u64) -> String {
    Utc.timestamp_millis_opt(epoch_ms as i64)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
