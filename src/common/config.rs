//! Configuration for quorumkv

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};

/// Default config file name (extension resolved by the `config` crate)
const DEFAULT_CONFIG_FILE: &str = "quorumkv";

/// Prefix for environment overrides, e.g. `QUORUMKV_SERVER__NAME=node1`
const ENV_PREFIX: &str = "QUORUMKV";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Member server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Member server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable member name
    #[serde(default = "default_name")]
    pub name: String,

    /// Bind address for the client HTTP API
    #[serde(default = "default_client_addr")]
    pub client_addr: SocketAddr,

    /// Client URLs advertised to the rest of the cluster
    #[serde(default = "default_client_urls")]
    pub advertise_client_urls: Vec<String>,

    /// Peer URLs advertised to the rest of the cluster
    #[serde(default = "default_peer_urls")]
    pub initial_advertise_peer_urls: Vec<String>,

    /// Initial cluster as `name=url,name=url`; empty means this member alone
    #[serde(default)]
    pub initial_cluster: String,

    /// Token mixed into member IDs so separate clusters never share IDs
    #[serde(default = "default_cluster_token")]
    pub initial_cluster_token: String,

    /// Timeout for one proposal round
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for long-poll and streaming watches
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_ms: u64,

    /// Extra attempts for quorum reads that time out
    #[serde(default = "default_quorum_read_retries")]
    pub quorum_read_retries: u32,

    /// Interval between SYNC proposals (TTL expiry)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Raft election timeout
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Raft heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Buffered events per watcher before it is dropped as overrun
    #[serde(default = "default_watch_capacity")]
    pub watch_capacity: usize,

    /// Events retained for `waitIndex` catch-up
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Maximum accepted request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_name() -> String {
    "default".to_string()
}
fn default_client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2379))
}
fn default_client_urls() -> Vec<String> {
    vec!["http://localhost:2379".to_string()]
}
fn default_peer_urls() -> Vec<String> {
    vec!["http://localhost:2380".to_string()]
}
fn default_cluster_token() -> String {
    "quorumkv-cluster".to_string()
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_watch_timeout() -> u64 {
    300_000
}
fn default_quorum_read_retries() -> u32 {
    1
}
fn default_sync_interval() -> u64 {
    500
}
fn default_election_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_watch_capacity() -> usize {
    100
}
fn default_history_capacity() -> usize {
    1000
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            client_addr: default_client_addr(),
            advertise_client_urls: default_client_urls(),
            initial_advertise_peer_urls: default_peer_urls(),
            initial_cluster: String::new(),
            initial_cluster_token: default_cluster_token(),
            request_timeout_ms: default_request_timeout(),
            watch_timeout_ms: default_watch_timeout(),
            quorum_read_retries: default_quorum_read_retries(),
            sync_interval_ms: default_sync_interval(),
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            watch_capacity: default_watch_capacity(),
            history_capacity: default_history_capacity(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The initial cluster string, defaulting to this member and its peer URLs.
    pub fn initial_cluster_or_self(&self) -> String {
        if !self.initial_cluster.trim().is_empty() {
            return self.initial_cluster.clone();
        }
        self.initial_advertise_peer_urls
            .iter()
            .map(|u| format!("{}={}", self.name, u))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("member name cannot be empty".into()));
        }
        for (field, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("watch_timeout_ms", self.watch_timeout_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("election_timeout_ms", self.election_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", field)));
            }
        }
        if self.watch_capacity == 0 || self.history_capacity == 0 {
            return Err(Error::InvalidConfig(
                "watch_capacity and history_capacity must be positive".into(),
            ));
        }
        if self.initial_advertise_peer_urls.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one advertised peer URL is required".into(),
            ));
        }
        let cluster = self.initial_cluster_or_self();
        let has_self = cluster
            .split(',')
            .filter_map(|entry| entry.split_once('='))
            .any(|(name, _)| name.trim() == self.name);
        if !has_self {
            return Err(Error::InvalidConfig(format!(
                "initial cluster {:?} does not contain member {:?}",
                cluster, self.name
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load `quorumkv.{toml,...}` from the working directory (optional)
    /// layered with `QUORUMKV_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load an explicit config file layered with environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(config::File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}
