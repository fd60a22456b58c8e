//! Watch tests over HTTP: long polls, history replay and streaming bodies.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{form, get, send, start_server, test_config};
use quorumkv::common::ServerConfig;
use std::time::Duration;
use tower::ServiceExt;

fn watch_config() -> ServerConfig {
    ServerConfig {
        watch_timeout_ms: 300,
        ..test_config()
    }
}

async fn open_watch(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_lines(resp: axum::response::Response) -> Vec<serde_json::Value> {
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_long_poll_gets_next_change() {
    let (server, app) = start_server(watch_config()).await;

    let watch = open_watch(&app, "/v2/keys/foo?wait=true").await;
    assert_eq!(watch.status(), StatusCode::OK);
    assert!(watch.headers().contains_key("x-cluster-id"));

    let put = send(&app, form("PUT", "/v2/keys/foo", "value=bar")).await;
    assert_eq!(put.status, StatusCode::CREATED);

    let events = body_lines(watch).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["action"], "set");
    assert_eq!(events[0]["node"]["key"], "/foo");
    assert_eq!(events[0]["node"]["value"], "bar");

    server.stop().await;
}

#[tokio::test]
async fn test_wait_index_replays_history() {
    let (server, app) = start_server(watch_config()).await;

    let put = send(&app, form("PUT", "/v2/keys/foo", "value=one")).await;
    let index = put.json()["node"]["modifiedIndex"].as_u64().unwrap();
    send(&app, form("PUT", "/v2/keys/foo", "value=two")).await;

    let uri = format!("/v2/keys/foo?wait=true&waitIndex={}", index);
    let events = body_lines(open_watch(&app, &uri).await).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["node"]["value"], "one");
    assert_eq!(events[0]["node"]["modifiedIndex"], index);

    server.stop().await;
}

#[tokio::test]
async fn test_recursive_watch_sees_children() {
    let (server, app) = start_server(watch_config()).await;
    send(&app, form("PUT", "/v2/keys/dir/a", "value=1")).await;

    let plain = open_watch(&app, "/v2/keys/dir?wait=true").await;
    let recursive = open_watch(&app, "/v2/keys/dir?wait=true&recursive=true").await;
    send(&app, form("PUT", "/v2/keys/dir/b", "value=2")).await;

    let events = body_lines(recursive).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["node"]["key"], "/dir/b");

    // the non-recursive watch only ends at its deadline, empty
    assert!(body_lines(plain).await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_stream_delivers_until_deadline() {
    let (server, app) = start_server(watch_config()).await;

    let watch = open_watch(&app, "/v2/keys/counter?wait=true&stream=true").await;
    for v in ["1", "2", "3"] {
        send(&app, form("PUT", "/v2/keys/counter", &format!("value={}", v))).await;
    }

    let events = body_lines(watch).await;
    let values: Vec<&str> = events
        .iter()
        .map(|e| e["node"]["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["1", "2", "3"]);
    assert_eq!(server.store().watcher_count(), 0);

    server.stop().await;
}

async fn put_values(app: &axum::Router, count: usize) -> u64 {
    let mut first = 0;
    for v in 0..count {
        let put = send(app, form("PUT", "/v2/keys/foo", &format!("value={}", v))).await;
        if v == 0 {
            first = put.json()["node"]["modifiedIndex"].as_u64().unwrap();
        }
    }
    first
}

#[tokio::test]
async fn test_stream_replays_backlog_then_follows() {
    let (server, app) = start_server(watch_config()).await;
    let first = put_values(&app, 5).await;

    let uri = format!("/v2/keys/foo?wait=true&stream=true&waitIndex={}", first);
    let watch = open_watch(&app, &uri).await;
    send(&app, form("PUT", "/v2/keys/foo", "value=5")).await;

    let events = body_lines(watch).await;
    let values: Vec<&str> = events
        .iter()
        .map(|e| e["node"]["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["0", "1", "2", "3", "4", "5"]);

    server.stop().await;
}

#[tokio::test]
async fn test_stream_backlog_over_capacity_ends_early() {
    let config = ServerConfig {
        watch_capacity: 2,
        ..watch_config()
    };
    let (server, app) = start_server(config).await;
    let first = put_values(&app, 5).await;

    let uri = format!("/v2/keys/foo?wait=true&stream=true&waitIndex={}", first);
    let started = std::time::Instant::now();
    let events = body_lines(open_watch(&app, &uri).await).await;

    // only what fit in the channel, then the stream closes before its deadline
    let values: Vec<&str> = events
        .iter()
        .map(|e| e["node"]["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["0", "1"]);
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(server.store().watcher_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_cleared_history_is_rejected() {
    let config = ServerConfig {
        history_capacity: 2,
        ..watch_config()
    };
    let (server, app) = start_server(config).await;
    for v in 0..5 {
        send(&app, form("PUT", "/v2/keys/foo", &format!("value={}", v))).await;
    }

    let resp = send(&app, get("/v2/keys/foo?wait=true&waitIndex=1")).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.json()["errorCode"], 401);

    server.stop().await;
}

#[tokio::test]
async fn test_watch_ends_when_client_goes_away() {
    let (server, app) = start_server(test_config()).await;

    let watch = open_watch(&app, "/v2/keys/foo?wait=true").await;
    assert_eq!(server.store().watcher_count(), 1);
    drop(watch);

    let mut remaining = server.store().watcher_count();
    for _ in 0..50 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        remaining = server.store().watcher_count();
    }
    assert_eq!(remaining, 0);

    server.stop().await;
}
