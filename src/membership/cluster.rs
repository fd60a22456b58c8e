//! Authoritative cluster membership
//!
//! [`Cluster`] owns every member record and the set of permanently removed
//! IDs. All reads take a snapshot under one read lock and every mutation,
//! including its write-through to the backend, happens under one write lock,
//! so no caller ever sees a member that is neither active nor removed.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::common::{Error, Result};
use crate::membership::backend::{
    member_attributes_key, member_from_node, member_raft_attributes_key, member_store_key,
    removed_member_store_key, MemberBackend, STORE_MEMBERS_PREFIX, STORE_REMOVED_MEMBERS_PREFIX,
    STORE_VERSION_KEY,
};
use crate::membership::conf_change::{ConfChange, ConfChangeKind};
use crate::membership::member::{Attributes, Id, Member, RaftAttributes};

#[derive(Default)]
struct ClusterInner {
    id: Id,
    token: String,
    members: BTreeMap<Id, Member>,
    removed: HashSet<Id>,
    version: Option<String>,
    backend: Option<Arc<dyn MemberBackend>>,
}

impl ClusterInner {
    fn gen_id(&mut self) {
        self.id = compute_cluster_id(self.members.values());
    }

    fn peer_url_owner(&self, url: &str) -> Option<Id> {
        self.members
            .values()
            .find(|m| m.peer_urls().iter().any(|u| u == url))
            .map(|m| m.id)
    }
}

/// Cluster identifier derived from the active peer URL sets.
///
/// Each member contributes its sorted peer URLs joined by `,`; those strings
/// are sorted and hashed newline-terminated, and the first eight bytes of the
/// SHA-256 digest form the ID. Insertion order and member IDs never matter.
fn compute_cluster_id<'a>(members: impl Iterator<Item = &'a Member>) -> Id {
    let mut sets: Vec<String> = members.map(|m| m.sorted_peer_urls().join(",")).collect();
    sets.sort();

    let mut hasher = Sha256::new();
    for set in &sets {
        hasher.update(set.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Id(u64::from_be_bytes(head))
}

pub struct Cluster {
    inner: RwLock<ClusterInner>,
}

impl Cluster {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(ClusterInner {
                token: token.into(),
                ..Default::default()
            }),
        }
    }

    /// Build an in-memory cluster from known members, without persistence.
    pub fn from_members(token: impl Into<String>, members: Vec<Member>) -> Self {
        let cluster = Self::new(token);
        {
            let mut inner = cluster.inner.write();
            for m in members {
                inner.members.insert(m.id, m);
            }
            inner.gen_id();
        }
        cluster
    }

    /// Parse an initial cluster description of the form `name=url,name=url`.
    ///
    /// URLs sharing a name belong to one member; member IDs are derived from
    /// the URLs and the token.
    pub fn from_initial_cluster(token: &str, initial: &str) -> Result<Self> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in initial.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, url) = entry.split_once('=').ok_or_else(|| {
                Error::InvalidConfig(format!("initial cluster entry {:?} is not name=url", entry))
            })?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "initial cluster entry {:?} has an empty name or URL",
                    entry
                )));
            }
            grouped
                .entry(name.to_string())
                .or_default()
                .push(url.to_string());
        }

        let cluster = Self::new(token);
        {
            let mut inner = cluster.inner.write();
            for (name, urls) in grouped {
                let m = Member::new(&name, urls, token, None);
                if inner.members.contains_key(&m.id) {
                    return Err(Error::InvalidConfig(format!(
                        "member {} ({}) is listed more than once",
                        m.id, name
                    )));
                }
                if let Some(url) = m
                    .peer_urls()
                    .iter()
                    .find(|u| inner.peer_url_owner(u).is_some())
                {
                    return Err(Error::InvalidConfig(format!(
                        "peer URL {} is shared by more than one member",
                        url
                    )));
                }
                inner.members.insert(m.id, m);
            }
            inner.gen_id();
        }
        Ok(cluster)
    }

    /// Attach the store membership changes are written through to.
    pub fn set_backend(&self, backend: Arc<dyn MemberBackend>) {
        self.inner.write().backend = Some(backend);
    }

    /// Reload members and removed IDs from the backend, replacing memory.
    pub fn recover(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let backend = inner
            .backend
            .clone()
            .ok_or_else(|| Error::Internal("cluster has no backend to recover from".into()))?;

        let mut members = BTreeMap::new();
        for node in backend.read_dir(STORE_MEMBERS_PREFIX)? {
            let m = member_from_node(&node)?;
            members.insert(m.id, m);
        }
        let mut removed = HashSet::new();
        for node in backend.read_dir(STORE_REMOVED_MEMBERS_PREFIX)? {
            let id: Id = node
                .base_name()
                .parse()
                .map_err(|e| Error::Internal(format!("bad removed member key {}: {}", node.key, e)))?;
            removed.insert(id);
        }

        inner.members = members;
        inner.removed = removed;
        inner.gen_id();
        info!(
            cluster_id = %inner.id,
            members = inner.members.len(),
            removed = inner.removed.len(),
            "Recovered cluster membership"
        );
        Ok(())
    }

    pub fn id(&self) -> Id {
        self.inner.read().id
    }

    pub fn token(&self) -> String {
        self.inner.read().token.clone()
    }

    pub fn member(&self, id: Id) -> Option<Member> {
        self.inner.read().members.get(&id).cloned()
    }

    /// Look a member up by name. Names are not required to be unique; the
    /// member with the lowest ID wins and the ambiguity is logged.
    pub fn member_by_name(&self, name: &str) -> Option<Member> {
        let inner = self.inner.read();
        let mut found = inner.members.values().filter(|m| m.name() == name);
        let first = found.next().cloned();
        if found.next().is_some() {
            warn!(name, "Two or more members share the same name");
        }
        first
    }

    /// All active members, sorted by ID.
    pub fn members(&self) -> Vec<Member> {
        self.inner.read().members.values().cloned().collect()
    }

    /// Active member IDs in ascending order.
    pub fn member_ids(&self) -> Vec<Id> {
        self.inner.read().members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All peer URLs of active members, sorted.
    pub fn peer_urls(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut urls: Vec<String> = inner
            .members
            .values()
            .flat_map(|m| m.peer_urls().iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    /// All client URLs of active members, sorted.
    pub fn client_urls(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut urls: Vec<String> = inner
            .members
            .values()
            .flat_map(|m| m.client_urls().iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    pub fn is_id_removed(&self, id: Id) -> bool {
        self.inner.read().removed.contains(&id)
    }

    pub fn version(&self) -> Option<String> {
        self.inner.read().version.clone()
    }

    pub fn set_version(&self, version: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(backend) = &inner.backend {
            backend.set(STORE_VERSION_KEY, version)?;
        }
        if inner.version.as_deref() != Some(version) {
            info!(version, "Set cluster version");
        }
        inner.version = Some(version.to_string());
        Ok(())
    }

    /// Recompute the cluster ID from the current membership.
    pub fn gen_id(&self) {
        self.inner.write().gen_id();
    }

    /// Check a proposed change against the current membership. Never mutates.
    pub fn validate_configuration_change(&self, cc: &ConfChange) -> Result<()> {
        let inner = self.inner.read();
        let id = cc.node_id;
        if inner.removed.contains(&id) {
            return Err(Error::IdRemoved);
        }
        match cc.kind {
            ConfChangeKind::AddNode => {
                if inner.members.contains_key(&id) {
                    return Err(Error::IdExists);
                }
                let m = cc.member()?;
                if m.peer_urls()
                    .iter()
                    .any(|u| inner.peer_url_owner(u).is_some())
                {
                    return Err(Error::PeerUrlExists);
                }
            }
            ConfChangeKind::RemoveNode => {
                if !inner.members.contains_key(&id) {
                    return Err(Error::IdNotFound);
                }
            }
            ConfChangeKind::UpdateNode => {
                if !inner.members.contains_key(&id) {
                    return Err(Error::IdNotFound);
                }
                let m = cc.member()?;
                let taken = m.peer_urls().iter().any(|u| {
                    inner
                        .peer_url_owner(u)
                        .map_or(false, |owner| owner != id)
                });
                if taken {
                    return Err(Error::PeerUrlExists);
                }
            }
        }
        Ok(())
    }

    /// Validate and apply a committed change.
    ///
    /// Validation here is authoritative: two changes that both passed the
    /// pre-propose check are resolved by commit order, and the loser is
    /// rejected without touching membership.
    pub fn apply_configuration_change(&self, cc: &ConfChange) -> Result<()> {
        self.validate_configuration_change(cc)?;
        match cc.kind {
            ConfChangeKind::AddNode => self.add_member(cc.member()?),
            ConfChangeKind::RemoveNode => self.remove_member(cc.node_id),
            ConfChangeKind::UpdateNode => {
                let m = cc.member()?;
                self.update_raft_attributes(cc.node_id, m.raft_attributes)
            }
        }
    }

    /// Add a member and persist its two records.
    pub fn add_member(&self, m: Member) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.removed.contains(&m.id) {
            return Err(Error::IdRemoved);
        }
        if inner.members.contains_key(&m.id) {
            return Err(Error::IdExists);
        }
        if let Some(backend) = &inner.backend {
            let raft = serde_json::to_string(&m.raft_attributes)?;
            let attrs = serde_json::to_string(&m.attributes)?;
            backend.create(&member_raft_attributes_key(m.id), &raft)?;
            if let Err(e) = backend.create(&member_attributes_key(m.id), &attrs) {
                // leave no half-written member directory behind
                if let Err(cleanup) = backend.delete_dir(&member_store_key(m.id)) {
                    warn!(member_id = %m.id, error = %cleanup, "Failed to clean up member record");
                }
                return Err(e);
            }
        }
        info!(member_id = %m.id, peer_urls = ?m.peer_urls(), "Added member");
        inner.members.insert(m.id, m);
        inner.gen_id();
        Ok(())
    }

    /// Evict a member and tombstone its ID in the same critical section.
    pub fn remove_member(&self, id: Id) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.removed.contains(&id) {
            return Err(Error::IdRemoved);
        }
        if let Some(backend) = &inner.backend {
            backend.delete_dir(&member_store_key(id))?;
            backend.create(&removed_member_store_key(id), "")?;
        }
        if inner.members.remove(&id).is_none() {
            warn!(member_id = %id, "Tombstoned an ID that was not an active member");
        }
        inner.removed.insert(id);
        inner.gen_id();
        info!(member_id = %id, "Removed member");
        Ok(())
    }

    /// Replace a member's published attributes.
    ///
    /// Updates racing a removal are dropped with a warning.
    pub fn update_attributes(&self, id: Id, attrs: Attributes) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.removed.contains(&id) {
            warn!(member_id = %id, "Skipped attribute update of removed member");
            return Ok(());
        }
        if !inner.members.contains_key(&id) {
            return Err(Error::IdNotFound);
        }
        if let Some(backend) = &inner.backend {
            backend.set(&member_attributes_key(id), &serde_json::to_string(&attrs)?)?;
        }
        if let Some(m) = inner.members.get_mut(&id) {
            m.attributes = attrs;
        }
        Ok(())
    }

    /// Replace a member's peer URLs.
    pub fn update_raft_attributes(&self, id: Id, raft: RaftAttributes) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.removed.contains(&id) {
            return Err(Error::IdRemoved);
        }
        if !inner.members.contains_key(&id) {
            return Err(Error::IdNotFound);
        }
        if let Some(backend) = &inner.backend {
            backend.set(&member_raft_attributes_key(id), &serde_json::to_string(&raft)?)?;
        }
        if let Some(m) = inner.members.get_mut(&id) {
            info!(member_id = %id, peer_urls = ?raft.peer_urls, "Updated member peer URLs");
            m.raft_attributes = raft;
        }
        inner.gen_id();
        Ok(())
    }
}

impl fmt::Display for Cluster {
    /// `name=url,name=url` in member ID order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        let entries: Vec<String> = inner
            .members
            .values()
            .flat_map(|m| {
                m.peer_urls()
                    .iter()
                    .map(move |u| format!("{}={}", m.name(), u))
            })
            .collect();
        write!(f, "{}", entries.join(","))
    }
}

/// Check that `local` describes the same members as `existing` and adopt the
/// existing member IDs.
///
/// Both sides are compared as sorted peer URL sets; a size or URL mismatch
/// is a [`Error::ClusterMismatch`] and leaves `local` untouched.
pub fn validate_cluster_and_assign_ids(local: &Cluster, existing: &Cluster) -> Result<()> {
    let mut lms = local.members();
    let mut ems = existing.members();
    if lms.len() != ems.len() {
        return Err(Error::ClusterMismatch(format!(
            "member count is unequal ({} local, {} existing)",
            lms.len(),
            ems.len()
        )));
    }
    let key = |m: &Member| m.sorted_peer_urls().join(",");
    lms.sort_by_key(key);
    ems.sort_by_key(key);

    for (l, e) in lms.iter().zip(ems.iter()) {
        if l.sorted_peer_urls() != e.sorted_peer_urls() {
            return Err(Error::ClusterMismatch(format!(
                "unmatched member while checking peer URLs: {:?} vs {:?}",
                l.peer_urls(),
                e.peer_urls()
            )));
        }
    }

    let mut inner = local.inner.write();
    inner.members.clear();
    for (mut l, e) in lms.into_iter().zip(ems.iter()) {
        l.id = e.id;
        inner.members.insert(l.id, l);
    }
    inner.gen_id();
    Ok(())
}
