//! Consensus node (single-voter stand-in)
//!
//! Tracks role, term, leader and the log indexes, and hands every committed
//! entry to the apply loop in log order. The local member is the only voter:
//! it elects itself once the election timeout passes without a leader, and a
//! proposal commits as soon as it is appended.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::membership::{ConfChange, Id};
use crate::server::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Payload of a log entry.
#[derive(Debug, Clone)]
pub enum EntryData {
    Request(Request),
    ConfChange(ConfChange),
}

impl EntryData {
    /// Proposal id the proposer waits on.
    pub fn id(&self) -> u64 {
        match self {
            EntryData::Request(r) => r.id,
            EntryData::ConfChange(cc) => cc.id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: EntryData,
}

struct RaftState {
    role: RaftRole,
    term: u64,
    voted_for: Option<Id>,
    leader: Option<Id>,
    last_index: u64,
    commit_index: u64,
    last_heartbeat: Instant,
    /// Drawn from `[election_timeout, 2 * election_timeout)` on every reset
    randomized_timeout: Duration,
    /// Set once the local member leaves the cluster; never cleared
    removed: bool,
}

pub struct RaftNode {
    id: Id,
    state: Mutex<RaftState>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
    election_timeout: Duration,
}

impl RaftNode {
    /// Create a follower. The receiver yields committed entries in order.
    pub fn new(id: Id, election_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let node = Self {
            id,
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                term: 0,
                voted_for: None,
                leader: None,
                last_index: 0,
                commit_index: 0,
                last_heartbeat: Instant::now(),
                randomized_timeout: randomized(election_timeout),
                removed: false,
            }),
            apply_tx,
            election_timeout,
        };
        (node, apply_rx)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn leader(&self) -> Option<Id> {
        self.state.lock().leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    /// Become a candidate for the next term and vote for ourselves.
    pub fn start_election(&self) -> u64 {
        let mut s = self.state.lock();
        s.term += 1;
        s.role = RaftRole::Candidate;
        s.voted_for = Some(self.id);
        s.leader = None;
        s.last_heartbeat = Instant::now();
        s.randomized_timeout = randomized(self.election_timeout);
        s.term
    }

    pub fn become_leader(&self) {
        let mut s = self.state.lock();
        if s.role != RaftRole::Leader {
            METRICS.leader_changes.inc();
        }
        s.role = RaftRole::Leader;
        s.leader = Some(self.id);
        info!(member = %self.id, term = s.term, "Became leader");
    }

    /// Revert to follower in `term`, following `leader` if one is known.
    pub fn step_down(&self, term: u64, leader: Option<Id>) {
        let mut s = self.state.lock();
        if term > s.term {
            s.voted_for = None;
        }
        s.term = s.term.max(term);
        s.role = RaftRole::Follower;
        s.leader = leader;
        s.last_heartbeat = Instant::now();
        s.randomized_timeout = randomized(self.election_timeout);
        info!(member = %self.id, term = s.term, leader = ?leader.map(|l| l.to_string()), "Stepped down");
    }

    /// Step down for good. A removed member neither campaigns nor accepts
    /// proposals.
    pub fn mark_removed(&self) {
        let term = {
            let mut s = self.state.lock();
            s.removed = true;
            s.term
        };
        self.step_down(term, None);
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Run an election. With a single voter our own vote is the majority.
    pub fn campaign(&self) -> bool {
        if self.is_removed() {
            return false;
        }
        let term = self.start_election();
        debug!(member = %self.id, term, "Won election with own vote");
        self.become_leader();
        true
    }

    /// Append and commit an entry, returning its log index.
    pub fn propose(&self, data: EntryData) -> Result<u64> {
        let mut s = self.state.lock();
        if s.removed {
            return Err(Error::Stopped);
        }
        if s.role != RaftRole::Leader {
            let leader = s.leader.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(leader));
        }
        s.last_index += 1;
        let entry = LogEntry {
            term: s.term,
            index: s.last_index,
            data,
        };
        // sending under the lock keeps channel order equal to log order
        self.apply_tx
            .send(entry)
            .map_err(|_| Error::Stopped)?;
        s.commit_index = s.last_index;
        Ok(s.last_index)
    }

    fn election_due(&self) -> bool {
        let s = self.state.lock();
        !s.removed
            && s.role != RaftRole::Leader
            && s.last_heartbeat.elapsed() >= s.randomized_timeout
    }
}

fn randomized(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(base_ms + rand::thread_rng().gen_range(0..base_ms))
}

/// Drive elections until `shutdown` flips to true.
pub fn start_raft_tasks(
    node: Arc<RaftNode>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if node.election_due() {
                        info!(member = %node.id, "Election timeout elapsed, campaigning");
                        node.campaign();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(member = %node.id, "Raft ticker stopped");
    })
}
