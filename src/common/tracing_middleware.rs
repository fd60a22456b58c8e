//! Request tracing middleware
//!
//! Assigns every request an `X-Request-ID` (kept if the client sent one),
//! logs start and completion with timing, and feeds the HTTP latency metrics.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::common::metrics::METRICS;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Coarse route label for metrics, so arbitrary key paths do not explode
/// label cardinality.
pub fn route_label(path: &str) -> &'static str {
    const ROUTES: [&str; 8] = [
        "/v2/keys",
        "/v2/members",
        "/v2/auth",
        "/v2/stats",
        "/v2/machines",
        "/health",
        "/version",
        "/metrics",
    ];
    ROUTES
        .iter()
        .find(|r| {
            path.strip_prefix(**r)
                .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
        })
        .copied()
        .unwrap_or("other")
}

pub async fn request_tracing_middleware(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    info!(parent: &span, "Request started");
    let mut response = next.run(request).instrument(span.clone()).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    METRICS.record_request(route_label(&path), duration, !status.is_server_error());

    let status_code = status.as_u16();
    let duration_ms = duration.as_millis() as u64;
    if status.is_success() || status.is_redirection() {
        info!(parent: &span, status = status_code, duration_ms, "Request completed");
    } else if status.is_client_error() {
        warn!(parent: &span, status = status_code, duration_ms, "Client error");
    } else {
        warn!(parent: &span, status = status_code, duration_ms, "Server error");
    }

    response
}
