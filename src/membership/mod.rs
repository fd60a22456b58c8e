//! Cluster membership: member records, the authoritative member set,
//! configuration-change validation and cluster identity.

pub mod backend;
pub mod cluster;
pub mod conf_change;
pub mod member;

pub use backend::{MemberBackend, NodeRecord};
pub use cluster::{validate_cluster_and_assign_ids, Cluster};
pub use conf_change::{ConfChange, ConfChangeKind};
pub use member::{Attributes, Id, Member, RaftAttributes};
