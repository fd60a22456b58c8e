//! # quorumkv
//!
//! The client-facing coordination layer of a consensus-backed key-value
//! service:
//! - cluster membership with configuration-change validation
//! - translation of `/v2/keys` requests into validated internal requests
//! - role-based authorization of key-space access
//! - streaming watches with deadline, disconnect and overrun handling
//!
//! ## Architecture
//!
//! ```text
//!  HTTP client
//!      │
//! ┌────▼─────────────────────────────┐
//! │ server::http   (axum routes)     │
//! │  request translator + auth gate  │
//! └────┬─────────────────────────────┘
//!      │ Request
//! ┌────▼─────────────┐  propose   ┌─────────────────┐
//! │ server::KvServer ├───────────►│ raft_node       │
//! │  wait registry   │◄───────────┤ committed log   │
//! └────┬─────────┬───┘   apply    └─────────────────┘
//!      │         │
//! ┌────▼───┐ ┌───▼────────────────┐
//! │ store  │ │ membership::Cluster│
//! │ + hub  │ │  (records in /0)   │
//! └────┬───┘ └────────────────────┘
//!      │ events
//! ┌────▼───────────────┐
//! │ watch dispatcher   │──► newline-delimited JSON
//! └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! quorumkv serve \
//!   --name node1 \
//!   --listen-client 0.0.0.0:2379 \
//!   --advertise-client-urls http://10.0.0.1:2379 \
//!   --initial-advertise-peer-urls http://10.0.0.1:2380 \
//!   --initial-cluster node1=http://10.0.0.1:2380
//!
//! curl -XPUT http://localhost:2379/v2/keys/message -d value=hello
//! curl 'http://localhost:2379/v2/keys/message?wait=true'
//! curl http://localhost:2379/v2/members
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod membership;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use membership::Cluster;
pub use server::KvServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest cluster version this server can join
pub const MIN_CLUSTER_VERSION: &str = "2.0.0";

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
