//! HTTP API
//!
//! One handler per resource; each matches on the method itself so the
//! key-space error format is used for every keys response, including
//! validation failures.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use chrono::Utc;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::common::auth_middleware::{auth_middleware, AuthExtension};
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, ErrorCode, KeyError};
use crate::membership::backend::STORE_KEYS_PREFIX;
use crate::membership::{Id, Member};
use crate::server::auth_http;
use crate::server::request::{parse_key_request, Form, Method};
use crate::server::watch::{encode_event, WatchDispatcher};
use crate::server::{KvServer, Response as ServerResponse};
use crate::store::{Event, Watcher};

pub const CLUSTER_ID_HEADER: HeaderName = HeaderName::from_static("x-cluster-id");
pub const STORE_INDEX_HEADER: HeaderName = HeaderName::from_static("x-store-index");
pub const RAFT_INDEX_HEADER: HeaderName = HeaderName::from_static("x-raft-index");
pub const RAFT_TERM_HEADER: HeaderName = HeaderName::from_static("x-raft-term");

pub type AppState = Arc<KvServer>;

pub fn create_router(server: AppState) -> Router {
    let max_body = server.config().max_body_bytes;
    Router::new()
        .route("/v2/keys", any(keys_handler))
        .route("/v2/keys/", any(keys_handler))
        .route("/v2/keys/*key", any(keys_handler))
        .route("/v2/members", any(members_handler))
        .route("/v2/members/:id", any(member_handler))
        .route("/v2/stats/store", get(store_stats))
        .route("/v2/stats/self", get(self_stats))
        .route("/v2/stats/leader", get(leader_stats))
        .route("/v2/machines", get(machines))
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .merge(auth_http::routes())
        .layer(axum::middleware::from_fn(auth_middleware))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Credentials attached by the auth middleware, if any.
pub(crate) fn credentials(
    ext: &Option<Extension<AuthExtension>>,
) -> Option<&crate::common::Credentials> {
    ext.as_ref().and_then(|Extension(a)| a.credentials())
}

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "message": message.into() }))).into_response()
}

pub(crate) fn unauthorized() -> Response {
    let mut resp = json_error(StatusCode::UNAUTHORIZED, "Insufficient credentials");
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"quorumkv\""),
    );
    resp
}

pub(crate) fn method_not_allowed(allow: &'static str) -> Response {
    let mut resp = json_error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    resp.headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(allow));
    resp
}

pub(crate) fn has_content_type(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map_or(false, |v| v.trim().eq_ignore_ascii_case(expected))
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: impl ToString) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

fn cluster_headers(server: &KvServer, store_index: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, CLUSTER_ID_HEADER, server.cluster().id());
    insert_header(&mut headers, STORE_INDEX_HEADER, store_index);
    insert_header(&mut headers, RAFT_INDEX_HEADER, server.index());
    insert_header(&mut headers, RAFT_TERM_HEADER, server.term());
    headers
}

/// Render any failure in the key-space error format.
fn key_error_response(server: &KvServer, err: Error) -> Response {
    let mut key_err = err.into_key_error().trim_cause_prefix(STORE_KEYS_PREFIX);
    if key_err.index == 0 {
        key_err.index = server.store().index();
    }
    let mut resp = key_err.into_response();
    insert_header(resp.headers_mut(), CLUSTER_ID_HEADER, server.cluster().id());
    resp
}

async fn keys_handler(
    State(server): State<AppState>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(method) = Method::from_http(&method) else {
        return method_not_allowed("GET, HEAD, POST, PUT, DELETE");
    };

    let form_body =
        has_content_type(&headers, "application/x-www-form-urlencoded").then(|| body.as_ref());
    let form = match Form::parse(form_body, uri.query()) {
        Ok(f) => f,
        Err(e) => return key_error_response(&server, e.into()),
    };
    let path = match percent_decode_str(uri.path()).decode_utf8() {
        Ok(p) => p.into_owned(),
        Err(_) => {
            let e = KeyError::request(ErrorCode::InvalidForm, "path is not valid UTF-8");
            return key_error_response(&server, e.into());
        }
    };
    let request = match parse_key_request(method, &path, &form, Utc::now()) {
        Ok(r) => r,
        Err(e) => return key_error_response(&server, e.into()),
    };

    let client_key = match request.path.strip_prefix(STORE_KEYS_PREFIX) {
        Some("") | None => "/".to_string(),
        Some(k) => k.to_string(),
    };
    let allowed = server.auth().has_key_prefix_access(
        credentials(&auth),
        &client_key,
        request.recursive,
        !method.is_read(),
    );
    if !allowed {
        let e = KeyError::request(ErrorCode::Unauthorized, "Insufficient credentials");
        let mut resp = key_error_response(&server, e.into());
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"quorumkv\""),
        );
        return resp;
    }

    match server.do_request(request).await {
        Ok(ServerResponse::Event(event)) => event_response(&server, method, event),
        Ok(ServerResponse::Watcher(watcher)) => watch_response(&server, watcher),
        Ok(ServerResponse::Empty) => StatusCode::OK.into_response(),
        Err(e) => key_error_response(&server, e),
    }
}

fn event_response(server: &KvServer, method: Method, event: Event) -> Response {
    let mut headers = cluster_headers(server, event.store_index);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let status = if event.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    if method == Method::Head {
        return (status, headers).into_response();
    }
    match encode_event(event) {
        Ok(body) => (status, headers, body).into_response(),
        Err(e) => key_error_response(server, Error::Serialization(e)),
    }
}

fn watch_response(server: &KvServer, watcher: Watcher) -> Response {
    let mut headers = cluster_headers(server, watcher.start_index);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let body: Body = WatchDispatcher::new(watcher, server.config().watch_timeout()).spawn();
    (StatusCode::OK, headers, body).into_response()
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    #[serde(rename = "peerURLs")]
    peer_urls: Vec<String>,
}

fn parse_member_request(headers: &HeaderMap, body: &[u8]) -> Result<Vec<String>, Response> {
    if !has_content_type(headers, "application/json") {
        return Err(json_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Bad Content-Type",
        ));
    }
    let req: MemberRequest = serde_json::from_slice(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    if req.peer_urls.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "peerURLs must not be empty"));
    }
    if let Some(bad) = req.peer_urls.iter().find(|u| !is_valid_peer_url(u)) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            format!("invalid peer URL {:?}", bad),
        ));
    }
    Ok(req.peer_urls)
}

/// `http(s)://host:port` with nothing after the authority.
fn is_valid_peer_url(url: &str) -> bool {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        return false;
    };
    let authority = rest.trim_end_matches('/');
    if authority.contains('/') {
        return false;
    }
    let Some((host, port)) = authority.rsplit_once(':') else {
        return false;
    };
    let host_ok = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(ip) => ip.parse::<std::net::Ipv6Addr>().is_ok(),
        None => !host.is_empty() && !host.contains(&[':', '[', ']'][..]),
    };
    host_ok && port.parse::<u16>().is_ok()
}

async fn members_handler(
    State(server): State<AppState>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_read = method == HttpMethod::GET || method == HttpMethod::HEAD;
    if !server.auth().has_write_root_access(is_read, credentials(&auth)) {
        return unauthorized();
    }
    let mut cluster = HeaderMap::new();
    insert_header(&mut cluster, CLUSTER_ID_HEADER, server.cluster().id());

    match method {
        HttpMethod::GET | HttpMethod::HEAD => {
            let members = server.cluster().members();
            (cluster, Json(json!({ "members": members }))).into_response()
        }
        HttpMethod::POST => {
            let urls = match parse_member_request(&headers, &body) {
                Ok(urls) => urls,
                Err(resp) => return resp,
            };
            let member = Member::new("", urls, &server.cluster().token(), Some(Utc::now()));
            match server.add_member(member.clone()).await {
                Ok(()) => {
                    info!(member = %member.id, "Member added over HTTP");
                    (StatusCode::CREATED, cluster, Json(member)).into_response()
                }
                Err(e) => member_error(e),
            }
        }
        _ => method_not_allowed("GET, POST"),
    }
}

async fn member_handler(
    State(server): State<AppState>,
    Path(id): Path<String>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_read = method == HttpMethod::GET || method == HttpMethod::HEAD;
    if !server.auth().has_write_root_access(is_read, credentials(&auth)) {
        return unauthorized();
    }

    if id == "leader" {
        if !is_read {
            return method_not_allowed("GET");
        }
        return match server.leader().and_then(|l| server.cluster().member(l)) {
            Some(m) => Json(m).into_response(),
            None => json_error(StatusCode::SERVICE_UNAVAILABLE, "During election"),
        };
    }

    let id: Id = match id.parse() {
        Ok(id) => id,
        Err(_) => return json_error(StatusCode::NOT_FOUND, format!("No such member: {}", id)),
    };
    match method {
        HttpMethod::PUT => {
            let urls = match parse_member_request(&headers, &body) {
                Ok(urls) => urls,
                Err(resp) => return resp,
            };
            match server.update_member(id, urls).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => member_error(e),
            }
        }
        HttpMethod::DELETE => match server.remove_member(id).await {
            Ok(()) => {
                info!(member = %id, "Member removed over HTTP");
                StatusCode::NO_CONTENT.into_response()
            }
            Err(e) => member_error(e),
        },
        _ => method_not_allowed("PUT, DELETE"),
    }
}

fn member_error(e: Error) -> Response {
    let expected = e.is_membership_conflict() || matches!(e, Error::IdNotFound | Error::IdRemoved);
    if !expected {
        warn!(error = %e, "Membership change failed");
    }
    e.into_response()
}

async fn store_stats(State(server): State<AppState>) -> impl IntoResponse {
    Json(server.store_stats())
}

async fn self_stats(State(server): State<AppState>) -> impl IntoResponse {
    Json(server.self_stats())
}

async fn leader_stats(State(server): State<AppState>) -> Response {
    match server.leader_stats() {
        Some(stats) => Json(stats).into_response(),
        None => json_error(StatusCode::FORBIDDEN, "not current leader"),
    }
}

async fn machines(State(server): State<AppState>) -> impl IntoResponse {
    server.cluster().client_urls().join(", ")
}

async fn health(State(server): State<AppState>) -> Response {
    if server.health().await {
        Json(json!({ "health": "true" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "health": "false" })),
        )
            .into_response()
    }
}

async fn version(State(server): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "server": crate::VERSION,
        "cluster": server.cluster().version().unwrap_or_else(|| "not_decided".to_string()),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
