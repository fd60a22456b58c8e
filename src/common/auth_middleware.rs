//! Credential extraction middleware for axum
//!
//! Parses `Authorization: Basic ...` and stores the result in the request
//! extensions. Nothing is rejected here; handlers ask the [`AuthStore`]
//! whether the presented credentials (or their absence) suffice.
//!
//! [`AuthStore`]: crate::common::auth::AuthStore

use axum::{
    body::Body,
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::common::auth::Credentials;

/// Extension type for passing credentials to handlers
#[derive(Clone, Debug, Default)]
pub struct AuthExtension(pub Option<Credentials>);

impl AuthExtension {
    pub fn credentials(&self) -> Option<&Credentials> {
        self.0.as_ref()
    }
}

/// Decode HTTP Basic credentials. Malformed headers count as absent.
pub fn basic_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

pub async fn auth_middleware(mut request: Request<Body>, next: Next) -> Response {
    let creds = basic_credentials(request.headers());
    request.extensions_mut().insert(AuthExtension(creds));
    next.run(request).await
}
