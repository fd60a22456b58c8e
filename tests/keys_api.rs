//! Key-space API tests: request translation, write semantics and the
//! error format, driven through the router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{form, get, send, start_server, test_config};

#[tokio::test]
async fn test_put_then_get() {
    let (server, app) = start_server(test_config()).await;

    let resp = send(&app, form("PUT", "/v2/keys/foo", "value=bar")).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(
        resp.header("x-cluster-id"),
        Some(server.cluster().id().to_string().as_str())
    );
    assert!(resp.header("x-store-index").is_some());
    assert!(resp.header("x-raft-index").is_some());
    assert_eq!(resp.header("x-raft-term"), Some("1"));
    let body = resp.json();
    assert_eq!(body["action"], "set");
    assert_eq!(body["node"]["key"], "/foo");
    assert_eq!(body["node"]["value"], "bar");

    let resp = send(&app, form("PUT", "/v2/keys/foo", "value=baz")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["prevNode"]["value"], "bar");

    let resp = send(&app, get("/v2/keys/foo")).await;
    assert_eq!(resp.status, StatusCode::OK);
    let body = resp.json();
    assert_eq!(body["action"], "get");
    assert_eq!(body["node"]["value"], "baz");

    server.stop().await;
}

#[tokio::test]
async fn test_query_string_values() {
    let (server, app) = start_server(test_config()).await;

    let req = Request::put("/v2/keys/greeting?value=hello%20world")
        .body(Body::empty())
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.json()["node"]["value"], "hello world");

    // form body wins over the query string
    let resp = send(&app, form("PUT", "/v2/keys/greeting?value=query", "value=body")).await;
    assert_eq!(resp.json()["node"]["value"], "body");

    server.stop().await;
}

#[tokio::test]
async fn test_missing_key_error_format() {
    let (server, app) = start_server(test_config()).await;
    send(&app, form("PUT", "/v2/keys/present", "value=1")).await;

    let resp = send(&app, get("/v2/keys/missing")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    let index: u64 = resp.header("x-store-index").unwrap().parse().unwrap();
    assert_eq!(index, server.store().index());
    let body = resp.json();
    assert_eq!(body["errorCode"], 100);
    assert_eq!(body["message"], "Key not found");
    assert_eq!(body["cause"], "/missing");
    assert_eq!(body["index"], index);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_requests() {
    let (server, app) = start_server(test_config()).await;

    let cases = vec![
        (form("PUT", "/v2/keys/a", "value=1&ttl=soon"), 202),
        (form("PUT", "/v2/keys/a", "value=1&prevIndex=x"), 203),
        (form("PUT", "/v2/keys/a", "value=1&prevValue="), 201),
        (form("PUT", "/v2/keys/a", "value=1&prevExist=maybe"), 209),
        (form("POST", "/v2/keys/a", "value=1&wait=true"), 209),
        (get("/v2/keys/a?wait=true&waitIndex=abc"), 203),
        (get("/v2/keys/a?recursive=yes"), 209),
    ];
    for (i, (req, code)) in cases.into_iter().enumerate() {
        let resp = send(&app, req).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST, "case #{}", i);
        assert_eq!(resp.json()["errorCode"], code, "case #{}", i);
    }

    // nothing reached the log
    let resp = send(&app, get("/v2/keys/a")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_conditional_writes() {
    let (server, app) = start_server(test_config()).await;
    send(&app, form("PUT", "/v2/keys/lock", "value=owner1")).await;

    let resp = send(&app, form("PUT", "/v2/keys/lock", "value=owner2&prevExist=false")).await;
    assert_eq!(resp.status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(resp.json()["errorCode"], 105);

    let resp = send(&app, form("PUT", "/v2/keys/lock", "value=owner2&prevValue=nobody")).await;
    assert_eq!(resp.status, StatusCode::PRECONDITION_FAILED);
    let body = resp.json();
    assert_eq!(body["errorCode"], 101);
    assert_eq!(body["cause"], "[nobody != owner1]");

    let resp = send(&app, form("PUT", "/v2/keys/lock", "value=owner2&prevValue=owner1")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["action"], "compareAndSwap");

    let resp = send(&app, form("PUT", "/v2/keys/fresh", "value=x&prevExist=true")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = send(&app, form("PUT", "/v2/keys/lock", "value=owner3&prevExist=true")).await;
    assert_eq!(resp.json()["action"], "update");

    let req = Request::delete("/v2/keys/lock?prevValue=owner2")
        .body(Body::empty())
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::PRECONDITION_FAILED);

    let req = Request::delete("/v2/keys/lock?prevValue=owner3")
        .body(Body::empty())
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["action"], "compareAndDelete");

    server.stop().await;
}

#[tokio::test]
async fn test_post_creates_in_order_keys() {
    let (server, app) = start_server(test_config()).await;

    let first = send(&app, form("POST", "/v2/keys/queue", "value=job1")).await;
    let second = send(&app, form("POST", "/v2/keys/queue", "value=job2")).await;
    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(second.status, StatusCode::CREATED);
    let k1 = first.json()["node"]["key"].as_str().unwrap().to_string();
    let k2 = second.json()["node"]["key"].as_str().unwrap().to_string();
    assert!(k1.starts_with("/queue/"));
    assert_eq!(k1.len(), "/queue/".len() + 20);
    assert!(k1 < k2);

    let resp = send(&app, get("/v2/keys/queue?sorted=true")).await;
    let body = resp.json();
    let keys: Vec<&str> = body["node"]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, vec![k1.as_str(), k2.as_str()]);

    server.stop().await;
}

#[tokio::test]
async fn test_directories() {
    let (server, app) = start_server(test_config()).await;
    send(&app, form("PUT", "/v2/keys/dir/a", "value=1")).await;

    let resp = send(&app, Request::delete("/v2/keys/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(resp.json()["errorCode"], 102);

    let resp = send(&app, Request::delete("/v2/keys/dir?dir=true").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(resp.json()["errorCode"], 108);

    let req = Request::delete("/v2/keys/dir?recursive=true")
        .body(Body::empty())
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["node"]["dir"], true);

    let resp = send(&app, get("/v2/keys/dir/a")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    // membership data lives outside the client key space
    let resp = send(&app, get("/v2/keys/")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(!resp.text().contains("/0/members"));

    server.stop().await;
}

#[tokio::test]
async fn test_ttl_keys_expire() {
    let (server, app) = start_server(test_config()).await;

    let resp = send(&app, form("PUT", "/v2/keys/session", "value=s&ttl=1")).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.json()["node"]["ttl"], 1);

    tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
    let resp = send(&app, get("/v2/keys/session")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_head_and_unsupported_methods() {
    let (server, app) = start_server(test_config()).await;
    send(&app, form("PUT", "/v2/keys/foo", "value=bar")).await;

    let req = Request::head("/v2/keys/foo").body(Body::empty()).unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.body.is_empty());
    assert!(resp.header("x-store-index").is_some());

    let req = Request::patch("/v2/keys/foo").body(Body::empty()).unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(resp.header("allow").unwrap().contains("PUT"));

    server.stop().await;
}

#[tokio::test]
async fn test_quorum_get() {
    let (server, app) = start_server(test_config()).await;
    send(&app, form("PUT", "/v2/keys/foo", "value=bar")).await;

    let before = server.index();
    let resp = send(&app, get("/v2/keys/foo?quorum=true")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["node"]["value"], "bar");
    // the read went through the log
    assert!(server.index() > before);

    server.stop().await;
}
