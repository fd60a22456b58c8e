//! Server and leader statistics served under `/v2/stats`

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::common::metrics::Counter;
use crate::membership::Id;
use crate::server::raft_node::RaftRole;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub leader: String,
    pub uptime: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfStats {
    pub name: String,
    pub id: String,
    pub state: String,
    pub start_time: DateTime<Utc>,
    pub leader_info: LeaderInfo,
    pub recv_append_request_cnt: u64,
    pub send_append_request_cnt: u64,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub current: f64,
    pub average: f64,
    pub standard_deviation: f64,
    pub minimum: f64,
    pub maximum: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct CountsStats {
    pub success: u64,
    pub fail: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct FollowerStats {
    pub latency: LatencyStats,
    pub counts: CountsStats,
}

#[derive(Debug, Serialize)]
pub struct LeaderStats {
    pub leader: String,
    pub followers: BTreeMap<String, FollowerStats>,
}

/// Counters for the local member.
pub struct ServerStats {
    name: String,
    id: Id,
    start_time: DateTime<Utc>,
    /// When the current leader was first observed
    leader_since: Mutex<(Option<Id>, DateTime<Utc>)>,
    pub send_append: Counter,
    pub recv_append: Counter,
}

impl ServerStats {
    pub fn new(name: impl Into<String>, id: Id) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            id,
            start_time: now,
            leader_since: Mutex::new((None, now)),
            send_append: Counter::new(),
            recv_append: Counter::new(),
        }
    }

    pub fn self_stats(&self, role: RaftRole, leader: Option<Id>) -> SelfStats {
        let now = Utc::now();
        let since = {
            let mut seen = self.leader_since.lock();
            if seen.0 != leader {
                *seen = (leader, now);
            }
            seen.1
        };
        let uptime = (now - since).to_std().unwrap_or_default();
        SelfStats {
            name: self.name.clone(),
            id: self.id.to_string(),
            state: format!("State{}", capitalize(&role.to_string())),
            start_time: self.start_time,
            leader_info: LeaderInfo {
                leader: leader.map(|l| l.to_string()).unwrap_or_default(),
                uptime: format!("{:?}", uptime),
                start_time: since,
            },
            recv_append_request_cnt: self.recv_append.get(),
            send_append_request_cnt: self.send_append.get(),
        }
    }

    /// Follower table for a leader; every other member shows up even if
    /// nothing was ever sent to it.
    pub fn leader_stats(&self, members: &[Id]) -> LeaderStats {
        LeaderStats {
            leader: self.id.to_string(),
            followers: members
                .iter()
                .filter(|id| **id != self.id)
                .map(|id| (id.to_string(), FollowerStats::default()))
                .collect(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
