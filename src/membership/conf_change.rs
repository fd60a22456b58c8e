//! Membership configuration changes carried through consensus

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::membership::member::{Id, Member};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
    UpdateNode,
}

/// A proposed membership mutation.
///
/// `context` holds the JSON-encoded [`Member`] for add and update changes
/// and is empty for removals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub id: u64,
    pub kind: ConfChangeKind,
    pub node_id: Id,
    #[serde(default)]
    pub context: Vec<u8>,
}

impl ConfChange {
    pub fn add(id: u64, member: &Member) -> Result<Self> {
        Ok(Self {
            id,
            kind: ConfChangeKind::AddNode,
            node_id: member.id,
            context: member.to_context()?,
        })
    }

    pub fn remove(id: u64, node_id: Id) -> Self {
        Self {
            id,
            kind: ConfChangeKind::RemoveNode,
            node_id,
            context: Vec::new(),
        }
    }

    pub fn update(id: u64, member: &Member) -> Result<Self> {
        Ok(Self {
            id,
            kind: ConfChangeKind::UpdateNode,
            node_id: member.id,
            context: member.to_context()?,
        })
    }

    /// Decode the member carried in the context.
    pub fn member(&self) -> Result<Member> {
        Member::from_context(&self.context).map_err(|e| Error::BadContext(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_carries_member() {
        let m = Member::new("n1", vec!["http://h1:2380".into()], "tok", None);
        let cc = ConfChange::add(7, &m).unwrap();
        assert_eq!(cc.node_id, m.id);
        assert_eq!(cc.member().unwrap(), m);
    }

    #[test]
    fn test_remove_has_no_context() {
        let cc = ConfChange::remove(1, Id(3));
        assert!(cc.context.is_empty());
        assert!(matches!(cc.member(), Err(Error::BadContext(_))));
    }
}
