//! Persistence seam for membership records.
//!
//! Each member lives as a directory holding two independent records so a
//! partial write of one never corrupts the other:
//!
//! ```text
//! /0/members/<hex id>/raftAttributes   {"peerURLs":[...]}
//! /0/members/<hex id>/attributes       {"name":"...","clientURLs":[...]}
//! /0/removed_members/<hex id>          ""
//! ```

use crate::common::{Error, Result};
use crate::membership::member::{Attributes, Id, Member, RaftAttributes};

/// Root of client keys in the underlying store
pub const STORE_KEYS_PREFIX: &str = "/1";

pub const STORE_MEMBERS_PREFIX: &str = "/0/members";
pub const STORE_REMOVED_MEMBERS_PREFIX: &str = "/0/removed_members";
pub const STORE_VERSION_KEY: &str = "/0/version";

pub const RAFT_ATTRIBUTES_SUFFIX: &str = "raftAttributes";
pub const ATTRIBUTES_SUFFIX: &str = "attributes";

pub fn member_store_key(id: Id) -> String {
    format!("{}/{}", STORE_MEMBERS_PREFIX, id)
}

pub fn member_raft_attributes_key(id: Id) -> String {
    format!("{}/{}", member_store_key(id), RAFT_ATTRIBUTES_SUFFIX)
}

pub fn member_attributes_key(id: Id) -> String {
    format!("{}/{}", member_store_key(id), ATTRIBUTES_SUFFIX)
}

pub fn removed_member_store_key(id: Id) -> String {
    format!("{}/{}", STORE_REMOVED_MEMBERS_PREFIX, id)
}

/// A directory or leaf read back from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub key: String,
    pub value: Option<String>,
    pub nodes: Vec<NodeRecord>,
}

impl NodeRecord {
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            nodes: Vec::new(),
        }
    }

    pub fn dir(key: impl Into<String>, nodes: Vec<NodeRecord>) -> Self {
        Self {
            key: key.into(),
            value: None,
            nodes,
        }
    }

    /// Last path element.
    pub fn base_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Storage the membership state is written through to.
pub trait MemberBackend: Send + Sync {
    /// Create a leaf; fails if it already exists.
    fn create(&self, path: &str, value: &str) -> Result<()>;

    /// Create or replace a leaf.
    fn set(&self, path: &str, value: &str) -> Result<()>;

    /// Delete a directory and everything beneath it. Missing paths are not an error.
    fn delete_dir(&self, path: &str) -> Result<()>;

    /// List the children of `path`, each directory child expanded one level.
    /// A missing `path` yields an empty list.
    fn read_dir(&self, path: &str) -> Result<Vec<NodeRecord>>;
}

/// Rebuild a member from its stored directory.
///
/// The directory must contain a `raftAttributes` record and may contain an
/// `attributes` record; anything else, or undecodable JSON, is an error.
pub fn member_from_node(node: &NodeRecord) -> Result<Member> {
    let id: Id = node
        .base_name()
        .parse()
        .map_err(|e| Error::Internal(format!("bad member key {}: {}", node.key, e)))?;

    let mut raft: Option<RaftAttributes> = None;
    let mut attrs: Option<Attributes> = None;
    for child in &node.nodes {
        let value = child.value.as_deref().unwrap_or_default();
        match child.base_name() {
            RAFT_ATTRIBUTES_SUFFIX => {
                raft = Some(serde_json::from_str(value).map_err(|e| {
                    Error::Internal(format!("unmarshal raftAttributes of {}: {}", id, e))
                })?);
            }
            ATTRIBUTES_SUFFIX => {
                attrs = Some(serde_json::from_str(value).map_err(|e| {
                    Error::Internal(format!("unmarshal attributes of {}: {}", id, e))
                })?);
            }
            other => {
                return Err(Error::Internal(format!(
                    "unknown record {} under member {}",
                    other, id
                )))
            }
        }
    }

    let raft_attributes =
        raft.ok_or_else(|| Error::Internal(format!("raftAttributes of {} missing", id)))?;
    Ok(Member {
        id,
        raft_attributes,
        attributes: attrs.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_keys() {
        assert_eq!(member_store_key(Id(0x1234)), "/0/members/1234");
        assert_eq!(
            member_raft_attributes_key(Id(0x1234)),
            "/0/members/1234/raftAttributes"
        );
        assert_eq!(
            member_attributes_key(Id(0x1234)),
            "/0/members/1234/attributes"
        );
        assert_eq!(removed_member_store_key(Id(1)), "/0/removed_members/1");
    }

    #[test]
    fn test_member_from_node() {
        let node = NodeRecord::dir(
            "/1234",
            vec![
                NodeRecord::leaf("/1234/attributes", r#"{"name":"node1","clientURLs":null}"#),
                NodeRecord::leaf("/1234/raftAttributes", r#"{"peerURLs":null}"#),
            ],
        );
        let m = member_from_node(&node).unwrap();
        assert_eq!(m.id, Id(0x1234));
        assert_eq!(m.name(), "node1");
        assert!(m.peer_urls().is_empty());
    }

    #[test]
    fn test_member_from_node_bad() {
        let cases = vec![
            NodeRecord::dir("/1234", vec![NodeRecord::dir("/1234/strange", vec![])]),
            NodeRecord::dir(
                "/1234",
                vec![NodeRecord::leaf("/1234/raftAttributes", "garbage")],
            ),
            NodeRecord::dir(
                "/1234",
                vec![NodeRecord::leaf(
                    "/1234/attributes",
                    r#"{"name":"node1","clientURLs":null}"#,
                )],
            ),
            NodeRecord::dir(
                "/1234",
                vec![
                    NodeRecord::leaf("/1234/raftAttributes", r#"{"peerURLs":null}"#),
                    NodeRecord::dir("/1234/strange", vec![]),
                ],
            ),
            NodeRecord::dir(
                "/1234",
                vec![
                    NodeRecord::leaf("/1234/raftAttributes", r#"{"peerURLs":null}"#),
                    NodeRecord::leaf("/1234/attributes", "garbage"),
                ],
            ),
            NodeRecord::dir(
                "/1234",
                vec![
                    NodeRecord::leaf("/1234/raftAttributes", r#"{"peerURLs":null}"#),
                    NodeRecord::leaf("/1234/attributes", r#"{"name":"node1","clientURLs":null}"#),
                    NodeRecord::dir("/1234/strange", vec![]),
                ],
            ),
        ];
        for (i, node) in cases.iter().enumerate() {
            assert!(member_from_node(node).is_err(), "case #{}", i);
        }
    }
}
