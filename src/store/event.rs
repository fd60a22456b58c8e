//! Change events and the bounded event history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::common::{ErrorCode, KeyError};

pub const GET: &str = "get";
pub const CREATE: &str = "create";
pub const SET: &str = "set";
pub const UPDATE: &str = "update";
pub const DELETE: &str = "delete";
pub const COMPARE_AND_SWAP: &str = "compareAndSwap";
pub const COMPARE_AND_DELETE: &str = "compareAndDelete";
pub const EXPIRE: &str = "expire";

/// Client-facing view of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExtern {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeExtern>>,
    #[serde(rename = "modifiedIndex", default)]
    pub modified_index: u64,
    #[serde(rename = "createdIndex", default)]
    pub created_index: u64,
}

impl NodeExtern {
    fn trim_prefix(&mut self, prefix: &str) {
        if let Some(rest) = self.key.strip_prefix(prefix) {
            self.key = rest.to_string();
        }
        if let Some(nodes) = self.nodes.as_mut() {
            for n in nodes {
                n.trim_prefix(prefix);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub action: String,
    pub node: NodeExtern,
    #[serde(rename = "prevNode", default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<NodeExtern>,
    /// Store index when the event was produced or read
    #[serde(skip)]
    pub store_index: u64,
}

impl Event {
    pub fn new(action: &str, node: NodeExtern, store_index: u64) -> Self {
        Self {
            action: action.to_string(),
            node,
            prev_node: None,
            store_index,
        }
    }

    /// Index the event happened at.
    pub fn index(&self) -> u64 {
        self.node.modified_index
    }

    /// True when the event brought a key into existence.
    pub fn is_created(&self) -> bool {
        self.action == CREATE || (self.action == SET && self.prev_node.is_none())
    }

    /// Strip the store root from every key so clients see their own paths.
    pub fn trim_prefix(mut self, prefix: &str) -> Self {
        self.node.trim_prefix(prefix);
        if let Some(prev) = self.prev_node.as_mut() {
            prev.trim_prefix(prefix);
        }
        self
    }
}

/// Whether an event on `event_key` concerns a watch on `watch_key`.
pub fn key_matches(watch_key: &str, event_key: &str, recursive: bool) -> bool {
    if event_key == watch_key {
        return true;
    }
    if !recursive {
        return false;
    }
    if watch_key == "/" {
        return true;
    }
    event_key
        .strip_prefix(watch_key)
        .map_or(false, |rest| rest.starts_with('/'))
}

/// Ring of the most recent events, used to serve `waitIndex` from the past.
pub struct EventHistory {
    queue: VecDeque<Event>,
    capacity: usize,
    /// Index of the oldest retained event
    start_index: u64,
    /// Index of the newest retained event
    last_index: u64,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            start_index: 0,
            last_index: 0,
        }
    }

    pub fn add(&mut self, event: Event) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
        }
        self.last_index = event.index();
        self.queue.push_back(event);
        self.start_index = self.queue.front().map_or(self.last_index, Event::index);
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Matching events at or after `index`, oldest first, at most `limit`.
    ///
    /// Fails with `EventIndexCleared` if `index` predates the retained window.
    pub fn scan(
        &self,
        key: &str,
        recursive: bool,
        index: u64,
        limit: usize,
    ) -> Result<Vec<Event>, KeyError> {
        if self.queue.is_empty() || index > self.last_index {
            return Ok(Vec::new());
        }
        if index < self.start_index {
            return Err(KeyError::new(
                ErrorCode::EventIndexCleared,
                format!(
                    "the requested history has been cleared [{}/{}]",
                    self.start_index, index
                ),
                0,
            ));
        }
        Ok(self
            .queue
            .iter()
            .filter(|e| e.index() >= index && key_matches(key, &e.node.key, recursive))
            .take(limit)
            .cloned()
            .collect())
    }
}
