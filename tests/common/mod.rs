//! Shared helpers for the HTTP-level tests

#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine};
use quorumkv::common::ServerConfig;
use quorumkv::server::create_router;
use quorumkv::KvServer;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        name: "node1".into(),
        initial_advertise_peer_urls: vec!["http://127.0.0.1:2380".into()],
        advertise_client_urls: vec!["http://127.0.0.1:2379".into()],
        election_timeout_ms: 10,
        heartbeat_interval_ms: 5,
        request_timeout_ms: 1_000,
        sync_interval_ms: 50,
        ..Default::default()
    }
}

/// Start a single-member server and wait until it leads.
pub async fn start_server(config: ServerConfig) -> (Arc<KvServer>, Router) {
    let server = KvServer::new(config).unwrap();
    server.start();
    assert!(server.wait_for_leader(Duration::from_secs(2)).await);
    let router = create_router(server.clone());
    (server, router)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    TestResponse {
        status,
        headers,
        body: body.to_vec(),
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub fn form(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn with_basic_auth(mut request: Request<Body>, user: &str, password: &str) -> Request<Body> {
    let encoded = STANDARD.encode(format!("{}:{}", user, password));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Basic {}", encoded).parse().unwrap(),
    );
    request
}
