//! Error types for quorumkv

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::common::auth::AuthError;

pub type Result<T> = std::result::Result<T, Error>;

/// Numeric codes reported to key-space clients.
///
/// The 1xx range covers command failures against the key store, 2xx is
/// request-form validation, 3xx is consensus trouble and 4xx is watch
/// history trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    KeyNotFound,
    TestFailed,
    NotFile,
    NotDir,
    NodeExist,
    RootReadOnly,
    DirNotEmpty,
    Unauthorized,

    PrevValueRequired,
    TtlNaN,
    IndexNaN,
    InvalidField,
    InvalidForm,

    RaftInternal,
    LeaderElect,

    WatcherCleared,
    EventIndexCleared,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::KeyNotFound => 100,
            ErrorCode::TestFailed => 101,
            ErrorCode::NotFile => 102,
            ErrorCode::NotDir => 104,
            ErrorCode::NodeExist => 105,
            ErrorCode::RootReadOnly => 107,
            ErrorCode::DirNotEmpty => 108,
            ErrorCode::Unauthorized => 110,
            ErrorCode::PrevValueRequired => 201,
            ErrorCode::TtlNaN => 202,
            ErrorCode::IndexNaN => 203,
            ErrorCode::InvalidField => 209,
            ErrorCode::InvalidForm => 210,
            ErrorCode::RaftInternal => 300,
            ErrorCode::LeaderElect => 301,
            ErrorCode::WatcherCleared => 400,
            ErrorCode::EventIndexCleared => 401,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::KeyNotFound => "Key not found",
            ErrorCode::TestFailed => "Compare failed",
            ErrorCode::NotFile => "Not a file",
            ErrorCode::NotDir => "Not a directory",
            ErrorCode::NodeExist => "Key already exists",
            ErrorCode::RootReadOnly => "Root is read only",
            ErrorCode::DirNotEmpty => "Directory not empty",
            ErrorCode::Unauthorized => "The request requires user authentication",
            ErrorCode::PrevValueRequired => "PrevValue is Required in POST form",
            ErrorCode::TtlNaN => "The given TTL in POST form is not a number",
            ErrorCode::IndexNaN => "The given index in POST form is not a number",
            ErrorCode::InvalidField => "Invalid field",
            ErrorCode::InvalidForm => "Invalid POST form",
            ErrorCode::RaftInternal => "Raft Internal Error",
            ErrorCode::LeaderElect => "During Leader Election",
            ErrorCode::WatcherCleared => "watcher is cleared due to etcd recovery",
            ErrorCode::EventIndexCleared => {
                "The event in requested index is outdated and cleared"
            }
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::KeyNotFound => StatusCode::NOT_FOUND,
            ErrorCode::NotFile | ErrorCode::DirNotEmpty | ErrorCode::RootReadOnly => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::NotDir => StatusCode::FORBIDDEN,
            ErrorCode::NodeExist | ErrorCode::TestFailed => StatusCode::PRECONDITION_FAILED,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::RaftInternal | ErrorCode::LeaderElect => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Error surfaced to key-space clients as `{"errorCode","message","cause","index"}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {} ({}) [{}]", .code.as_u16(), .code.message(), .cause, .index)]
pub struct KeyError {
    pub code: ErrorCode,
    pub cause: String,
    pub index: u64,
}

#[derive(Serialize)]
struct KeyErrorBody<'a> {
    #[serde(rename = "errorCode")]
    error_code: u16,
    message: &'static str,
    cause: &'a str,
    index: u64,
}

impl KeyError {
    pub fn new(code: ErrorCode, cause: impl Into<String>, index: u64) -> Self {
        Self {
            code,
            cause: cause.into(),
            index,
        }
    }

    /// Validation failures detected before a request reaches the store.
    pub fn request(code: ErrorCode, cause: impl Into<String>) -> Self {
        Self::new(code, cause, 0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!(KeyErrorBody {
            error_code: self.code.as_u16(),
            message: self.code.message(),
            cause: &self.cause,
            index: self.index,
        })
    }

    /// Strip the internal store root from the cause so clients see their own paths.
    pub fn trim_cause_prefix(mut self, prefix: &str) -> Self {
        if let Some(rest) = self.cause.strip_prefix(prefix) {
            self.cause = rest.to_string();
        }
        self
    }
}

impl IntoResponse for KeyError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let index = self.index.to_string();
        (
            status,
            [("X-Store-Index", index.as_str())],
            Json(self.to_json()),
        )
            .into_response()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === Membership Errors ===
    #[error("member ID exists")]
    IdExists,

    #[error("member ID not found")]
    IdNotFound,

    #[error("member ID removed")]
    IdRemoved,

    #[error("peer URL exists")]
    PeerUrlExists,

    #[error("bad configuration change context: {0}")]
    BadContext(String),

    #[error("cluster mismatch: {0}")]
    ClusterMismatch(String),

    // === Key-space Errors ===
    #[error(transparent)]
    Key(#[from] KeyError),

    // === Auth Errors ===
    #[error(transparent)]
    Auth(#[from] AuthError),

    // === Operational Errors ===
    #[error("request cancelled")]
    Canceled,

    #[error("request timed out")]
    Timeout,

    #[error("request timed out, possibly due to previous leader failure")]
    TimeoutDueToLeaderFail,

    #[error("server stopped")]
    Stopped,

    #[error("unknown method")]
    UnknownMethod,

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // === Plumbing ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only timeouts qualify, and callers may retry only idempotent reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::TimeoutDueToLeaderFail)
    }

    /// Is this a membership conflict the caller can resolve by changing the request?
    pub fn is_membership_conflict(&self) -> bool {
        matches!(self, Error::IdExists | Error::PeerUrlExists)
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::IdExists | Error::PeerUrlExists | Error::ClusterMismatch(_) => {
                StatusCode::CONFLICT
            }
            Error::IdNotFound => StatusCode::NOT_FOUND,
            Error::IdRemoved => StatusCode::GONE,
            Error::BadContext(_) | Error::InvalidConfig(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Key(e) => e.code.http_status(),
            Error::Auth(e) => e.http_status(),
            Error::Timeout | Error::TimeoutDueToLeaderFail => StatusCode::REQUEST_TIMEOUT,
            Error::Stopped | Error::NotLeader(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownMethod => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a key-space error, wrapping operational failures as raft-internal.
    pub fn into_key_error(self) -> KeyError {
        match self {
            Error::Key(e) => e,
            other => KeyError::new(ErrorCode::RaftInternal, other.to_string(), 0),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
