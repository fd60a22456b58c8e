//! Member records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 64-bit identifier for members and clusters, displayed as lowercase hex.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Id)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Self {
        Id(v)
    }
}

/// Attributes that change only through a consensus-ordered configuration change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftAttributes {
    #[serde(rename = "peerURLs", default, deserialize_with = "nullable_urls")]
    pub peer_urls: Vec<String>,
}

/// Attributes a member publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "clientURLs", default, deserialize_with = "nullable_urls")]
    pub client_urls: Vec<String>,
}

/// A single cluster member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Id,
    #[serde(flatten)]
    pub raft_attributes: RaftAttributes,
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// `null` URL lists decode as empty.
fn nullable_urls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Member {
    /// Build a member whose ID is derived from its peer URLs and the cluster token.
    ///
    /// Passing `now` mixes a timestamp into the ID, which runtime-added members
    /// need so that re-adding the same URLs after removal yields a fresh ID.
    pub fn new(
        name: &str,
        peer_urls: Vec<String>,
        cluster_token: &str,
        now: Option<DateTime<Utc>>,
    ) -> Self {
        let mut sorted = peer_urls.clone();
        sorted.sort();

        let mut hasher = Sha256::new();
        for url in &sorted {
            hasher.update(url.as_bytes());
        }
        hasher.update(cluster_token.as_bytes());
        if let Some(t) = now {
            hasher.update(t.timestamp().to_be_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);

        Self {
            id: Id(u64::from_be_bytes(head)),
            raft_attributes: RaftAttributes { peer_urls },
            attributes: Attributes {
                name: name.to_string(),
                client_urls: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    pub fn peer_urls(&self) -> &[String] {
        &self.raft_attributes.peer_urls
    }

    pub fn client_urls(&self) -> &[String] {
        &self.attributes.client_urls
    }

    /// Peer URLs sorted, the form used for cross-cluster comparison.
    pub fn sorted_peer_urls(&self) -> Vec<String> {
        let mut urls = self.raft_attributes.peer_urls.clone();
        urls.sort();
        urls
    }

    /// Encode as configuration-change context.
    pub fn to_context(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from configuration-change context.
    pub fn from_context(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
