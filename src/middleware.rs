use crate::engine::AdmissionEngine;
use crate::identifier::{RequestDescriptor, FINGERPRINT_HEADERS, MAX_HEADER_VALUE_LEN};
use crate::response::{apply_headers, throttled_response};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const FORWARDING_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Gate a router behind the admission engine.
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/clean-routing", post(handler))
///     .layer(axum::middleware::from_fn_with_state(engine, admission_middleware));
/// ```
pub async fn admission_middleware(
    State(engine): State<Arc<AdmissionEngine>>,
    request: Request,
    next: Next,
) -> Response {
    if !engine.is_enabled() {
        return next.run(request).await;
    }

    let descriptor = describe_request(&request);
    let decision = engine.decide(&descriptor).await;

    if !decision.allowed() {
        return throttled_response(&decision);
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "admission_gate::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "admission_gate::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

/// Protocol-independent view of an axum request. Only the forwarding and
/// fingerprint headers are copied.
pub fn describe_request(request: &Request) -> RequestDescriptor {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut descriptor = RequestDescriptor::new(request.method().as_str(), &path, &get_client_ip(request));
    for name in FINGERPRINT_HEADERS.iter().chain(FORWARDING_HEADERS.iter()) {
        if let Some(value) = request.headers().get(*name).and_then(|v| v.to_str().ok()) {
            let bounded: String = value.chars().take(MAX_HEADER_VALUE_LEN).collect();
            descriptor.headers.insert(name.to_string(), bounded);
        }
    }
    descriptor
}

fn get_client_ip(request: &Request) -> String {
    // Try to get real IP from headers first
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.trim().to_string();
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
