//! In-memory hierarchical key store
//!
//! A tree of directories and values addressed by absolute slash-separated
//! paths. Every mutation advances a single store index, is recorded in the
//! event history and is delivered to matching watchers before the write lock
//! is released, so watchers observe mutations in index order.

pub mod event;
pub mod stats;
pub mod watcher;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use crate::common::utils::clean_path;
use crate::common::{Error, ErrorCode, KeyError, Result};
use crate::membership::backend::{MemberBackend, NodeRecord};

pub use event::{Event, NodeExtern};
pub use stats::StoreStatsSnapshot;
pub use watcher::{Watcher, WatcherHub};

use event::{COMPARE_AND_DELETE, COMPARE_AND_SWAP, CREATE, DELETE, EXPIRE, GET, SET, UPDATE};
use stats::{tally, StoreStats};

#[derive(Debug, Clone)]
struct Node {
    /// `None` for directories
    value: Option<String>,
    created_index: u64,
    modified_index: u64,
    expiration: Option<DateTime<Utc>>,
}

impl Node {
    fn dir(index: u64) -> Self {
        Self {
            value: None,
            created_index: index,
            modified_index: index,
            expiration: None,
        }
    }

    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Remaining lifetime in whole seconds, rounded up.
fn ttl_of(expiration: DateTime<Utc>) -> i64 {
    let ms = (expiration - Utc::now()).num_milliseconds();
    ((ms + 999) / 1000).max(0)
}

/// Describe which preconditions failed, e.g. `[old != cur] [3 != 5]`.
fn compare_fail_cause(node: &Node, prev_value: Option<&str>, prev_index: u64) -> String {
    let current = node.value.as_deref().unwrap_or_default();
    let mut parts = Vec::new();
    if let Some(pv) = prev_value {
        if pv != current {
            parts.push(format!("[{} != {}]", pv, current));
        }
    }
    if prev_index != 0 && prev_index != node.modified_index {
        parts.push(format!("[{} != {}]", prev_index, node.modified_index));
    }
    parts.join(" ")
}

fn compare_ok(node: &Node, prev_value: Option<&str>, prev_index: u64) -> bool {
    let value_ok = prev_value.map_or(true, |pv| node.value.as_deref() == Some(pv));
    let index_ok = prev_index == 0 || prev_index == node.modified_index;
    value_ok && index_ok
}

struct StoreInner {
    nodes: BTreeMap<String, Node>,
    index: u64,
}

impl StoreInner {
    fn error(&self, code: ErrorCode, cause: &str) -> KeyError {
        KeyError::new(code, cause, self.index)
    }

    fn lookup(&self, path: &str) -> std::result::Result<&Node, KeyError> {
        self.nodes
            .get(path)
            .ok_or_else(|| self.error(ErrorCode::KeyNotFound, path))
    }

    /// Keys strictly below `dir`, in order.
    fn descendants(&self, dir: &str) -> Vec<String> {
        let prefix = child_prefix(dir);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != "/")
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = child_prefix(dir);
        self.descendants(dir)
            .into_iter()
            .filter(|k| !k[prefix.len()..].contains('/'))
            .collect()
    }

    fn has_children(&self, dir: &str) -> bool {
        !self.children(dir).is_empty()
    }

    /// Every ancestor of `path` must be a directory or absent.
    fn check_parents(&self, path: &str) -> std::result::Result<(), KeyError> {
        let mut cur = parent_of(path);
        while let Some(p) = cur {
            if let Some(node) = self.nodes.get(p) {
                if !node.is_dir() {
                    return Err(self.error(ErrorCode::NotDir, p));
                }
            }
            cur = parent_of(p);
        }
        Ok(())
    }

    fn create_parents(&mut self, path: &str, index: u64) {
        let mut cur = parent_of(path);
        while let Some(p) = cur {
            self.nodes
                .entry(p.to_string())
                .or_insert_with(|| Node::dir(index));
            cur = parent_of(p);
        }
    }

    fn remove_subtree(&mut self, path: &str) {
        for key in self.descendants(path) {
            self.nodes.remove(&key);
        }
        self.nodes.remove(path);
    }

    fn to_extern(&self, path: &str, node: &Node) -> NodeExtern {
        NodeExtern {
            key: path.to_string(),
            value: node.value.clone(),
            dir: node.is_dir(),
            expiration: node.expiration,
            ttl: node.expiration.map(ttl_of),
            nodes: None,
            modified_index: node.modified_index,
            created_index: node.created_index,
        }
    }

    /// Extern view with one level of children, or the whole subtree when
    /// `recursive`.
    fn to_extern_tree(&self, path: &str, node: &Node, recursive: bool) -> NodeExtern {
        let mut ext = self.to_extern(path, node);
        if node.is_dir() {
            let children: Vec<NodeExtern> = self
                .children(path)
                .iter()
                .filter_map(|k| self.nodes.get(k).map(|n| (k, n)))
                .map(|(k, n)| {
                    if recursive {
                        self.to_extern_tree(k, n, true)
                    } else {
                        self.to_extern(k, n)
                    }
                })
                .collect();
            if !children.is_empty() {
                ext.nodes = Some(children);
            }
        }
        ext
    }
}

pub struct Store {
    inner: RwLock<StoreInner>,
    hub: WatcherHub,
    stats: StoreStats,
}

impl Store {
    pub fn new(watch_capacity: usize, history_capacity: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::dir(0));
        Self {
            inner: RwLock::new(StoreInner { nodes, index: 0 }),
            hub: WatcherHub::new(watch_capacity, history_capacity),
            stats: StoreStats::default(),
        }
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.inner.read().index
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.set_watchers(self.hub.count());
        self.stats.snapshot()
    }

    /// Read a node. Directory listings are always ordered by key.
    pub fn get(&self, path: &str, recursive: bool) -> std::result::Result<Event, KeyError> {
        let path = clean_path(path);
        let inner = self.inner.read();
        let result = inner
            .lookup(&path)
            .map(|node| Event::new(GET, inner.to_extern_tree(&path, node, recursive), inner.index));
        tally(&self.stats.get_success, &self.stats.get_fail, &result);
        result
    }

    /// Create or replace `path`.
    pub fn set(
        &self,
        path: &str,
        dir: bool,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let result = self.write_node(SET, path, dir, value, true, expiration);
        tally(&self.stats.set_success, &self.stats.set_fail, &result);
        result
    }

    /// Create `path`, failing if it exists. With `unique`, a new child named
    /// after the next index is created under `path` instead.
    pub fn create(
        &self,
        path: &str,
        dir: bool,
        value: &str,
        unique: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let path = if unique {
            let next = self.inner.read().index + 1;
            format!("{}{:020}", child_prefix(&clean_path(path)), next)
        } else {
            path.to_string()
        };
        let result = self.write_node(CREATE, &path, dir, value, false, expiration);
        tally(&self.stats.create_success, &self.stats.create_fail, &result);
        result
    }

    fn write_node(
        &self,
        action: &str,
        path: &str,
        dir: bool,
        value: &str,
        replace: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let path = clean_path(path);
        let mut inner = self.inner.write();
        if path == "/" {
            return Err(inner.error(ErrorCode::RootReadOnly, "/"));
        }
        let prev = inner.nodes.get(&path).cloned();
        if let Some(p) = &prev {
            if !replace {
                return Err(inner.error(ErrorCode::NodeExist, &path));
            }
            if p.is_dir() {
                return Err(inner.error(ErrorCode::NotFile, &path));
            }
        }
        inner.check_parents(&path)?;

        let next = inner.index + 1;
        inner.index = next;
        inner.create_parents(&path, next);
        let node = Node {
            value: if dir { None } else { Some(value.to_string()) },
            created_index: next,
            modified_index: next,
            expiration,
        };
        let mut event = Event::new(action, inner.to_extern(&path, &node), next);
        event.prev_node = prev.map(|p| inner.to_extern(&path, &p));
        inner.nodes.insert(path.clone(), node);

        debug!(action, key = %path, index = next, "Store write");
        self.hub.notify(&event);
        Ok(event)
    }

    /// Replace the value (files) and expiration of an existing node.
    pub fn update(
        &self,
        path: &str,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let result = self.update_inner(path, value, expiration);
        tally(&self.stats.update_success, &self.stats.update_fail, &result);
        result
    }

    fn update_inner(
        &self,
        path: &str,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let path = clean_path(path);
        let mut inner = self.inner.write();
        if path == "/" {
            return Err(inner.error(ErrorCode::RootReadOnly, "/"));
        }
        let prev = inner.lookup(&path)?.clone();
        if prev.is_dir() && !value.is_empty() {
            return Err(inner.error(ErrorCode::NotFile, &path));
        }

        let next = inner.index + 1;
        inner.index = next;
        let node = Node {
            value: if prev.is_dir() { None } else { Some(value.to_string()) },
            created_index: prev.created_index,
            modified_index: next,
            expiration,
        };
        let mut event = Event::new(UPDATE, inner.to_extern(&path, &node), next);
        event.prev_node = Some(inner.to_extern(&path, &prev));
        inner.nodes.insert(path, node);

        self.hub.notify(&event);
        Ok(event)
    }

    pub fn compare_and_swap(
        &self,
        path: &str,
        prev_value: Option<&str>,
        prev_index: u64,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let result = self.compare_and_swap_inner(path, prev_value, prev_index, value, expiration);
        tally(
            &self.stats.compare_and_swap_success,
            &self.stats.compare_and_swap_fail,
            &result,
        );
        result
    }

    fn compare_and_swap_inner(
        &self,
        path: &str,
        prev_value: Option<&str>,
        prev_index: u64,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> std::result::Result<Event, KeyError> {
        let path = clean_path(path);
        let mut inner = self.inner.write();
        if path == "/" {
            return Err(inner.error(ErrorCode::RootReadOnly, "/"));
        }
        let prev = inner.lookup(&path)?.clone();
        if prev.is_dir() {
            return Err(inner.error(ErrorCode::NotFile, &path));
        }
        if !compare_ok(&prev, prev_value, prev_index) {
            let cause = compare_fail_cause(&prev, prev_value, prev_index);
            return Err(inner.error(ErrorCode::TestFailed, &cause));
        }

        let next = inner.index + 1;
        inner.index = next;
        let node = Node {
            value: Some(value.to_string()),
            created_index: prev.created_index,
            modified_index: next,
            expiration,
        };
        let mut event = Event::new(COMPARE_AND_SWAP, inner.to_extern(&path, &node), next);
        event.prev_node = Some(inner.to_extern(&path, &prev));
        inner.nodes.insert(path, node);

        self.hub.notify(&event);
        Ok(event)
    }

    /// Delete `path`. Directories need `dir`, non-empty ones `recursive`.
    pub fn delete(
        &self,
        path: &str,
        dir: bool,
        recursive: bool,
    ) -> std::result::Result<Event, KeyError> {
        let result = self.delete_inner(DELETE, path, dir || recursive, recursive, None);
        tally(&self.stats.delete_success, &self.stats.delete_fail, &result);
        result
    }

    pub fn compare_and_delete(
        &self,
        path: &str,
        prev_value: Option<&str>,
        prev_index: u64,
    ) -> std::result::Result<Event, KeyError> {
        let result = self.delete_inner(
            COMPARE_AND_DELETE,
            path,
            false,
            false,
            Some((prev_value, prev_index)),
        );
        tally(
            &self.stats.compare_and_delete_success,
            &self.stats.compare_and_delete_fail,
            &result,
        );
        result
    }

    fn delete_inner(
        &self,
        action: &str,
        path: &str,
        dir: bool,
        recursive: bool,
        compare: Option<(Option<&str>, u64)>,
    ) -> std::result::Result<Event, KeyError> {
        let path = clean_path(path);
        let mut inner = self.inner.write();
        if path == "/" {
            return Err(inner.error(ErrorCode::RootReadOnly, "/"));
        }
        let prev = inner.lookup(&path)?.clone();
        if prev.is_dir() {
            if !dir {
                return Err(inner.error(ErrorCode::NotFile, &path));
            }
            if !recursive && inner.has_children(&path) {
                return Err(inner.error(ErrorCode::DirNotEmpty, &path));
            }
        }
        if let Some((prev_value, prev_index)) = compare {
            if !compare_ok(&prev, prev_value, prev_index) {
                let cause = compare_fail_cause(&prev, prev_value, prev_index);
                return Err(inner.error(ErrorCode::TestFailed, &cause));
            }
        }

        let next = inner.index + 1;
        inner.index = next;
        let event = Self::removal_event(&inner, action, &path, &prev, next);
        inner.remove_subtree(&path);

        self.hub.notify(&event);
        Ok(event)
    }

    fn removal_event(inner: &StoreInner, action: &str, path: &str, prev: &Node, index: u64) -> Event {
        let node = NodeExtern {
            key: path.to_string(),
            dir: prev.is_dir(),
            modified_index: index,
            created_index: prev.created_index,
            ..Default::default()
        };
        let mut event = Event::new(action, node, index);
        event.prev_node = Some(inner.to_extern(path, prev));
        event
    }

    /// Remove every node whose expiration is at or before `now`, emitting one
    /// `expire` event per removed subtree.
    pub fn delete_expired_keys(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.expiration.map_or(false, |e| e <= now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut count = 0;
        for path in expired {
            // gone already if an ancestor expired first
            let Some(prev) = inner.nodes.get(&path).cloned() else {
                continue;
            };
            let next = inner.index + 1;
            inner.index = next;
            let event = Self::removal_event(&inner, EXPIRE, &path, &prev, next);
            inner.remove_subtree(&path);
            self.stats.expire_count.inc();
            self.hub.notify(&event);
            count += 1;
        }
        if count > 0 {
            debug!(count, index = inner.index, "Expired keys");
        }
        count
    }

    /// Watch `key` for changes from index `since` (0 means the next change).
    pub fn watch(
        &self,
        key: &str,
        recursive: bool,
        stream: bool,
        since: u64,
    ) -> std::result::Result<Watcher, KeyError> {
        let key = clean_path(key);
        // hold the read lock so no mutation slips between index and registration
        let inner = self.inner.read();
        let since = if since == 0 { inner.index + 1 } else { since };
        self.hub.watch(&key, recursive, stream, since, inner.index)
    }

    pub fn watcher_count(&self) -> usize {
        self.hub.count()
    }
}

fn to_record(node: NodeExtern) -> NodeRecord {
    NodeRecord {
        value: if node.dir {
            None
        } else {
            Some(node.value.unwrap_or_default())
        },
        nodes: node
            .nodes
            .unwrap_or_default()
            .into_iter()
            .map(to_record)
            .collect(),
        key: node.key,
    }
}

impl MemberBackend for Store {
    fn create(&self, path: &str, value: &str) -> Result<()> {
        Store::create(self, path, false, value, false, None)?;
        Ok(())
    }

    fn set(&self, path: &str, value: &str) -> Result<()> {
        Store::set(self, path, false, value, None)?;
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> Result<()> {
        match Store::delete(self, path, true, true) {
            Ok(_) => Ok(()),
            Err(e) if e.code == ErrorCode::KeyNotFound => Ok(()),
            Err(e) => Err(Error::Key(e)),
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<NodeRecord>> {
        match Store::get(self, path, true) {
            Ok(event) => Ok(event
                .node
                .nodes
                .unwrap_or_default()
                .into_iter()
                .map(to_record)
                .collect()),
            Err(e) if e.code == ErrorCode::KeyNotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Key(e)),
        }
    }
}
