//! Auth API tests: user and role management and enforcement on the
//! key-space and membership endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{form, get, json, send, start_server, test_config, with_basic_auth};
use serde_json::json;

#[tokio::test]
async fn test_role_and_user_validation() {
    let (server, app) = start_server(test_config()).await;

    let req = Request::put("/v2/auth/roles/ops")
        .body(Body::from(r#"{"role":"ops"}"#))
        .unwrap();
    assert_eq!(send(&app, req).await.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let resp = send(&app, json("PUT", "/v2/auth/roles/ops", json!({ "role": "dev" }))).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = send(&app, json("PUT", "/v2/auth/roles/root", json!({ "role": "root" }))).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    // a new role may be created from a grant
    let body = json!({ "role": "ops", "grant": { "kv": { "read": ["/ops/*"] } } });
    let resp = send(&app, json("PUT", "/v2/auth/roles/ops", body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.json()["permissions"]["kv"]["read"], json!(["/ops/*"]));

    let body = json!({ "role": "ops", "grant": { "kv": { "write": ["/ops/*"] } } });
    let resp = send(&app, json("PUT", "/v2/auth/roles/ops", body)).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["permissions"]["kv"]["write"], json!(["/ops/*"]));

    let body = json!({ "user": "bob", "password": "pw", "roles": ["missing"] });
    let resp = send(&app, json("PUT", "/v2/auth/users/bob", body)).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = send(&app, get("/v2/auth/roles")).await;
    let names: Vec<String> = resp.json()["roles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["ops", "root"]);

    let resp = send(&app, Request::delete("/v2/auth/roles/ops").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status, StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn test_enable_and_enforce() {
    let (server, app) = start_server(test_config()).await;

    let resp = send(&app, get("/v2/auth/enable")).await;
    assert_eq!(resp.json()["enabled"], false);

    // enabling needs a root user
    let resp = send(&app, Request::put("/v2/auth/enable").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let body = json!({ "user": "root", "password": "rootpw", "roles": ["root"] });
    let resp = send(&app, json("PUT", "/v2/auth/users/root", body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert!(resp.json().get("password").is_none());

    let body = json!({
        "role": "reader",
        "permissions": { "kv": { "read": ["/public/*"], "write": [] } }
    });
    let resp = send(&app, json("PUT", "/v2/auth/roles/reader", body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);

    let body = json!({ "user": "alice", "password": "alicepw", "roles": ["reader"] });
    let resp = send(&app, json("PUT", "/v2/auth/users/alice", body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);

    let resp = send(&app, Request::put("/v2/auth/enable").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(send(&app, get("/v2/auth/enable")).await.json()["enabled"], true);

    // management needs root credentials
    let resp = send(&app, get("/v2/auth/users")).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert!(resp.header("www-authenticate").is_some());
    let resp = send(&app, with_basic_auth(get("/v2/auth/users"), "root", "wrong")).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    let resp = send(&app, with_basic_auth(get("/v2/auth/users"), "root", "rootpw")).await;
    assert_eq!(resp.status, StatusCode::OK);
    let users: Vec<String> = resp.json()["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["user"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(users, vec!["alice", "root"]);

    // take write access away from guests
    let body = json!({ "role": "guest", "revoke": { "kv": { "write": ["*"] } } });
    let req = with_basic_auth(json("PUT", "/v2/auth/roles/guest", body), "root", "rootpw");
    assert_eq!(send(&app, req).await.status, StatusCode::OK);

    let resp = send(&app, form("PUT", "/v2/keys/public/x", "value=1")).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp.json()["errorCode"], 110);

    let resp = send(&app, get("/v2/keys/public/x")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let req = with_basic_auth(form("PUT", "/v2/keys/public/x", "value=1"), "alice", "alicepw");
    assert_eq!(send(&app, req).await.status, StatusCode::UNAUTHORIZED);

    let req = with_basic_auth(form("PUT", "/v2/keys/public/x", "value=1"), "root", "rootpw");
    assert_eq!(send(&app, req).await.status, StatusCode::CREATED);

    let req = with_basic_auth(get("/v2/keys/public/x"), "alice", "alicepw");
    let resp = send(&app, req).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["node"]["value"], "1");

    // membership writes need root, reads do not
    let body = json!({ "peerURLs": ["http://10.0.0.2:2380"] });
    let resp = send(&app, json("POST", "/v2/members", body)).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(send(&app, get("/v2/members")).await.status, StatusCode::OK);

    let req = with_basic_auth(
        Request::delete("/v2/auth/users/root").body(Body::empty()).unwrap(),
        "root",
        "rootpw",
    );
    assert_eq!(send(&app, req).await.status, StatusCode::FORBIDDEN);

    let req = with_basic_auth(
        Request::delete("/v2/auth/enable").body(Body::empty()).unwrap(),
        "root",
        "rootpw",
    );
    assert_eq!(send(&app, req).await.status, StatusCode::OK);

    let resp = send(&app, form("PUT", "/v2/keys/public/y", "value=2")).await;
    assert_eq!(resp.status, StatusCode::CREATED);

    server.stop().await;
}
