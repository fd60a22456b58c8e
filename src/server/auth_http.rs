//! `/v2/auth` endpoints: user and role management, enable/disable.
//!
//! Everything except reading the enabled flag needs root access.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method as HttpMethod, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Extension, Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::common::auth::{AuthError, AuthResult, Role, User};
use crate::common::auth_middleware::AuthExtension;
use crate::common::Error;
use crate::server::http::{
    credentials, has_content_type, json_error, method_not_allowed, unauthorized, AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v2/auth/roles", any(roles_handler))
        .route("/v2/auth/roles/:role", any(role_handler))
        .route("/v2/auth/users", any(users_handler))
        .route("/v2/auth/users/:user", any(user_handler))
        .route("/v2/auth/enable", any(enable_handler))
}

fn auth_error(e: AuthError) -> Response {
    Error::Auth(e).into_response()
}

fn reply<T: serde::Serialize>(status: StatusCode, result: AuthResult<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => auth_error(e),
    }
}

fn parse_json<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> Result<T, Response> {
    if !has_content_type(headers, "application/json") {
        return Err(json_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Bad Content-Type",
        ));
    }
    serde_json::from_slice(body).map_err(|e| json_error(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn roles_handler(
    State(server): State<AppState>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
) -> Response {
    if method != HttpMethod::GET {
        return method_not_allowed("GET");
    }
    let store = server.auth();
    if !store.has_root_access(credentials(&auth)) {
        return unauthorized();
    }
    let roles: AuthResult<Vec<Role>> = store.all_roles().iter().map(|r| store.get_role(r)).collect();
    match roles {
        Ok(roles) => Json(json!({ "roles": roles })).into_response(),
        Err(e) => auth_error(e),
    }
}

async fn role_handler(
    State(server): State<AppState>,
    Path(name): Path<String>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let store = server.auth();
    if !store.has_root_access(credentials(&auth)) {
        return unauthorized();
    }
    match method {
        HttpMethod::GET => reply(StatusCode::OK, store.get_role(&name)),
        HttpMethod::PUT => {
            let mut role: Role = match parse_json(&headers, &body) {
                Ok(r) => r,
                Err(resp) => return resp,
            };
            if role.role != name {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "role JSON name does not match the name in the URL",
                );
            }
            if store.get_role(&name).is_ok() {
                return reply(StatusCode::OK, store.update_role(role));
            }
            if role.permissions.is_empty() {
                if let Some(grant) = role.grant.take() {
                    role.permissions = grant;
                }
            }
            reply(StatusCode::CREATED, store.create_role(role))
        }
        HttpMethod::DELETE => match store.delete_role(&name) {
            Ok(()) => StatusCode::OK.into_response(),
            Err(e) => auth_error(e),
        },
        _ => method_not_allowed("GET, PUT, DELETE"),
    }
}

async fn users_handler(
    State(server): State<AppState>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
) -> Response {
    if method != HttpMethod::GET {
        return method_not_allowed("GET");
    }
    let store = server.auth();
    if !store.has_root_access(credentials(&auth)) {
        return unauthorized();
    }
    let users: AuthResult<Vec<User>> = store.all_users().iter().map(|u| store.get_user(u)).collect();
    match users {
        Ok(users) => Json(json!({ "users": users })).into_response(),
        Err(e) => auth_error(e),
    }
}

async fn user_handler(
    State(server): State<AppState>,
    Path(name): Path<String>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let store = server.auth();
    if !store.has_root_access(credentials(&auth)) {
        return unauthorized();
    }
    match method {
        HttpMethod::GET => reply(StatusCode::OK, store.get_user(&name)),
        HttpMethod::PUT => {
            let user: User = match parse_json(&headers, &body) {
                Ok(u) => u,
                Err(resp) => return resp,
            };
            if user.user != name {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "user JSON name does not match the name in the URL",
                );
            }
            match store.create_or_update_user(user) {
                Ok((user, true)) => (StatusCode::CREATED, Json(user)).into_response(),
                Ok((user, false)) => Json(user).into_response(),
                Err(e) => auth_error(e),
            }
        }
        HttpMethod::DELETE => match store.delete_user(&name) {
            Ok(()) => StatusCode::OK.into_response(),
            Err(e) => auth_error(e),
        },
        _ => method_not_allowed("GET, PUT, DELETE"),
    }
}

async fn enable_handler(
    State(server): State<AppState>,
    auth: Option<Extension<AuthExtension>>,
    method: HttpMethod,
) -> Response {
    let store = server.auth();
    let is_read = method == HttpMethod::GET;
    if !store.has_write_root_access(is_read, credentials(&auth)) {
        return unauthorized();
    }
    let result = match method {
        HttpMethod::GET => {
            return Json(json!({ "enabled": store.auth_enabled() })).into_response()
        }
        HttpMethod::PUT => store.enable_auth(),
        HttpMethod::DELETE => store.disable_auth(),
        _ => return method_not_allowed("GET, PUT, DELETE"),
    };
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => auth_error(e),
    }
}
