//! Key-space request translation
//!
//! Turns an HTTP method, a `/v2/keys/...` path and decoded form values into a
//! normalized [`Request`]. Nothing here touches the store or consensus, so a
//! request that fails validation never gets proposed.

use chrono::{DateTime, Duration, Utc};
use percent_encoding::percent_decode;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::error::{ErrorCode, KeyError};
use crate::common::utils::{join_path, parse_bool, parse_u64};
use crate::membership::backend::STORE_KEYS_PREFIX;

pub const KEYS_PREFIX: &str = "/v2/keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
    /// Quorum read, ordered through consensus like a write.
    QGet,
    /// Clock tick proposed by the leader to expire TTL keys.
    Sync,
}

impl Method {
    /// Map an HTTP method onto a key-space method. Only the five verbs the
    /// keys endpoint serves are accepted.
    pub fn from_http(method: &axum::http::Method) -> Option<Self> {
        match *method {
            axum::http::Method::GET => Some(Method::Get),
            axum::http::Method::HEAD => Some(Method::Head),
            axum::http::Method::PUT => Some(Method::Put),
            axum::http::Method::POST => Some(Method::Post),
            axum::http::Method::DELETE => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::QGet => "QGET",
            Method::Sync => "SYNC",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated key-space request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    /// Internal store path, rooted at the keys prefix.
    pub path: String,
    pub val: String,
    pub dir: bool,
    /// Never `Some("")`.
    pub prev_value: Option<String>,
    pub prev_index: u64,
    pub prev_exist: Option<bool>,
    pub expiration: Option<DateTime<Utc>>,
    pub wait: bool,
    pub since: u64,
    pub recursive: bool,
    pub sorted: bool,
    pub quorum: bool,
    pub stream: bool,
    pub time: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: 0,
            method,
            path: path.into(),
            val: String::new(),
            dir: false,
            prev_value: None,
            prev_index: 0,
            prev_exist: None,
            expiration: None,
            wait: false,
            since: 0,
            recursive: false,
            sorted: false,
            quorum: false,
            stream: false,
            time: None,
        }
    }

    pub fn sync(time: DateTime<Utc>) -> Self {
        let mut r = Self::new(Method::Sync, "/");
        r.time = Some(time);
        r
    }

    /// Does a PUT or DELETE carry a compare precondition?
    pub fn has_compare(&self) -> bool {
        self.prev_index > 0 || self.prev_value.is_some()
    }
}

/// Decoded `application/x-www-form-urlencoded` pairs, body first then query.
#[derive(Debug, Clone, Default)]
pub struct Form {
    pairs: Vec<(String, String)>,
}

impl Form {
    /// Merge a request body and query string. Body values come first so they
    /// win when a field is repeated.
    pub fn parse(body: Option<&[u8]>, query: Option<&str>) -> Result<Self, KeyError> {
        let mut pairs = Vec::new();
        if let Some(body) = body {
            let body = std::str::from_utf8(body)
                .map_err(|_| KeyError::request(ErrorCode::InvalidForm, "body is not UTF-8"))?;
            decode_into(body, &mut pairs)?;
        }
        if let Some(query) = query {
            decode_into(query, &mut pairs)?;
        }
        Ok(Self { pairs })
    }

    /// First value of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Value of a field, or the empty string when absent.
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }
}

fn decode_into(input: &str, pairs: &mut Vec<(String, String)>) -> Result<(), KeyError> {
    for part in input.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        pairs.push((decode_component(k)?, decode_component(v)?));
    }
    Ok(())
}

fn decode_component(s: &str) -> Result<String, KeyError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(KeyError::request(
                    ErrorCode::InvalidForm,
                    format!("invalid URL escape {:?}", &s[i..s.len().min(i + 3)]),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let plus_decoded = s.replace('+', " ");
    percent_decode(plus_decoded.as_bytes())
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|_| KeyError::request(ErrorCode::InvalidForm, "invalid UTF-8 in form value"))
}

fn get_u64(form: &Form, key: &str) -> Result<Option<u64>, ()> {
    match form.get(key) {
        None => Ok(None),
        Some(v) => parse_u64(v).map(Some).ok_or(()),
    }
}

fn get_bool(form: &Form, key: &str) -> Result<bool, KeyError> {
    match form.get(key) {
        None => Ok(false),
        Some(v) => parse_bool(v).ok_or_else(|| {
            KeyError::request(ErrorCode::InvalidField, format!("invalid value for {}", key))
        }),
    }
}

/// Translate an inbound keys request.
///
/// `path` is the full URL path including [`KEYS_PREFIX`]; `now` anchors TTL
/// expiration.
pub fn parse_key_request(
    method: Method,
    path: &str,
    form: &Form,
    now: DateTime<Utc>,
) -> Result<Request, KeyError> {
    let rest = path
        .strip_prefix(KEYS_PREFIX)
        .ok_or_else(|| KeyError::request(ErrorCode::InvalidForm, "incorrect key prefix"))?;
    let store_path = join_path(STORE_KEYS_PREFIX, rest);

    let prev_index = get_u64(form, "prevIndex").map_err(|_| {
        KeyError::request(ErrorCode::IndexNaN, "invalid value for prevIndex")
    })?;
    let since = get_u64(form, "waitIndex").map_err(|_| {
        KeyError::request(ErrorCode::IndexNaN, "invalid value for waitIndex")
    })?;

    let recursive = get_bool(form, "recursive")?;
    let sorted = get_bool(form, "sorted")?;
    let wait = get_bool(form, "wait")?;
    let dir = get_bool(form, "dir")?;
    let quorum = get_bool(form, "quorum")?;
    let stream = get_bool(form, "stream")?;

    let ttl = match form.get("ttl") {
        Some(v) if !v.is_empty() => Some(parse_u64(v).ok_or_else(|| {
            KeyError::request(ErrorCode::TtlNaN, "invalid value for ttl")
        })?),
        _ => None,
    };

    if wait && method != Method::Get {
        return Err(KeyError::request(
            ErrorCode::InvalidField,
            "\"wait\" can only be used with GET requests",
        ));
    }

    let prev_value = match form.get("prevValue") {
        Some("") => {
            return Err(KeyError::request(
                ErrorCode::PrevValueRequired,
                "\"prevValue\" cannot be empty",
            ))
        }
        other => other.map(str::to_string),
    };

    let prev_exist = if form.contains("prevExist") {
        Some(get_bool(form, "prevExist")?)
    } else {
        None
    };

    let expiration = match ttl {
        Some(secs) => {
            let secs = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| KeyError::request(ErrorCode::TtlNaN, "invalid value for ttl"))?;
            Some(now + secs)
        }
        None => None,
    };

    Ok(Request {
        id: 0,
        method,
        path: store_path,
        val: form.value("value").to_string(),
        dir,
        prev_value,
        prev_index: prev_index.unwrap_or(0),
        prev_exist,
        expiration,
        wait,
        since: since.unwrap_or(0),
        recursive,
        sorted,
        quorum,
        stream,
        time: None,
    })
}
