//! Common utilities and types shared across quorumkv

pub mod auth;
pub mod auth_middleware;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use auth::{AuthError, AuthStore, Credentials};
pub use config::{Config, ServerConfig};
pub use error::{Error, ErrorCode, KeyError, Result};
pub use utils::{clean_path, parse_bool};
