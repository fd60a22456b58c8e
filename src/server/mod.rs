//! Server facade
//!
//! [`KvServer`] ties the pieces together: validated requests are either
//! served from the local store or proposed through the consensus node, and
//! the apply loop executes committed entries in log order, waking the
//! proposer through a per-request oneshot.

pub mod auth_http;
pub mod http;
pub mod raft_node;
pub mod request;
pub mod stats;
pub mod watch;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch as signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::auth::AuthStore;
use crate::common::metrics::METRICS;
use crate::common::utils::timestamp_now_millis;
use crate::common::{Error, Result, ServerConfig};
use crate::membership::backend::{
    member_attributes_key, ATTRIBUTES_SUFFIX, STORE_MEMBERS_PREFIX, STORE_VERSION_KEY,
};
use crate::membership::{
    Attributes, Cluster, ConfChange, ConfChangeKind, Id, Member, RaftAttributes,
};
use crate::store::{Event, Store, StoreStatsSnapshot, Watcher};
use raft_node::{start_raft_tasks, EntryData, LogEntry, RaftNode};
use request::{Method, Request};
use stats::{LeaderStats, SelfStats, ServerStats};

pub use http::create_router;

/// Outcome of [`KvServer::do_request`].
pub enum Response {
    Event(Event),
    Watcher(Watcher),
    /// Internal requests (SYNC) that carry no event.
    Empty,
}

type ApplyResult = Result<Option<Event>>;

/// Proposers waiting for their entry to be applied, keyed by request ID.
#[derive(Default)]
struct Wait {
    pending: Mutex<HashMap<u64, oneshot::Sender<ApplyResult>>>,
}

impl Wait {
    fn register(&self, id: u64) -> oneshot::Receiver<ApplyResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    fn trigger(&self, id: u64, result: ApplyResult) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn cancel(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Drop every sender; waiters observe the server stopping.
    fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// Request IDs: the low 16 bits of the member ID in the top 16 bits, then a
/// millisecond-seeded counter, so IDs from different members never collide.
struct RequestIdGen {
    prefix: u64,
    suffix: AtomicU64,
}

impl RequestIdGen {
    const SUFFIX_BITS: u32 = 48;

    fn new(member: Id, now_ms: u64) -> Self {
        Self {
            prefix: (member.0 & 0xffff) << Self::SUFFIX_BITS,
            suffix: AtomicU64::new((now_ms & 0xff_ffff_ffff) << 8),
        }
    }

    fn next(&self) -> u64 {
        let suffix = self.suffix.fetch_add(1, Ordering::Relaxed) + 1;
        self.prefix | (suffix & ((1 << Self::SUFFIX_BITS) - 1))
    }
}

pub struct KvServer {
    id: Id,
    name: String,
    config: ServerConfig,
    cluster: Arc<Cluster>,
    store: Arc<Store>,
    raft: Arc<RaftNode>,
    auth: AuthStore,
    stats: ServerStats,
    wait: Wait,
    req_ids: RequestIdGen,
    applied_index: AtomicU64,
    apply_rx: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
    shutdown: signal::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KvServer {
    /// Build a server for a new cluster described by `config`. Nothing runs
    /// until [`KvServer::start`].
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let initial = Cluster::from_initial_cluster(
            &config.initial_cluster_token,
            &config.initial_cluster_or_self(),
        )?;
        let local = initial.member_by_name(&config.name).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "member {:?} is not in the initial cluster",
                config.name
            ))
        })?;

        let store = Arc::new(Store::new(config.watch_capacity, config.history_capacity));
        let cluster = Arc::new(Cluster::new(config.initial_cluster_token.clone()));
        cluster.set_backend(store.clone());
        for m in initial.members() {
            cluster.add_member(m)?;
        }

        let (raft, apply_rx) = RaftNode::new(local.id, config.election_timeout());
        let (shutdown, _) = signal::channel(false);

        info!(
            member = %local.id,
            name = %config.name,
            cluster_id = %cluster.id(),
            members = cluster.len(),
            "Created server"
        );

        Ok(Arc::new(Self {
            id: local.id,
            name: config.name.clone(),
            stats: ServerStats::new(config.name.clone(), local.id),
            req_ids: RequestIdGen::new(local.id, timestamp_now_millis()),
            config,
            cluster,
            store,
            raft: Arc::new(raft),
            auth: AuthStore::new(),
            wait: Wait::default(),
            applied_index: AtomicU64::new(0),
            apply_rx: Mutex::new(Some(apply_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the apply loop, election ticker, SYNC ticker and the one-shot
    /// attribute publication. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(apply_rx) = self.apply_rx.lock().take() else {
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.clone().run_apply_loop(apply_rx, self.shutdown.subscribe()),
        ));
        tasks.push(start_raft_tasks(
            self.raft.clone(),
            self.config.heartbeat_interval(),
            self.shutdown.subscribe(),
        ));
        tasks.push(tokio::spawn(self.clone().run_sync_ticker(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(self.clone().publish(self.shutdown.subscribe())));
        info!(member = %self.id, "Server started");
    }

    /// Start the background tasks and serve the HTTP API on the configured
    /// client address until ctrl-c.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.start();
        let listener = tokio::net::TcpListener::bind(self.config.client_addr).await?;
        info!(
            member = %self.id,
            addr = %self.config.client_addr,
            client_urls = ?self.config.advertise_client_urls,
            "Serving client requests"
        );
        let app = create_router(self.clone());
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await;
        self.stop().await;
        result.map_err(Error::Io)
    }

    /// Stop background tasks and fail every pending proposal with `Stopped`.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.wait.clear();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(member = %self.id, "Server stopped");
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn raft(&self) -> &RaftNode {
        &self.raft
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn leader(&self) -> Option<Id> {
        self.raft.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Last applied log index.
    pub fn index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn term(&self) -> u64 {
        self.raft.term()
    }

    pub fn store_stats(&self) -> StoreStatsSnapshot {
        self.store.stats()
    }

    pub fn self_stats(&self) -> SelfStats {
        self.stats.self_stats(self.raft.role(), self.raft.leader())
    }

    /// Follower table, or `None` when this member is not the leader.
    pub fn leader_stats(&self) -> Option<LeaderStats> {
        self.is_leader()
            .then(|| self.stats.leader_stats(&self.cluster.member_ids()))
    }

    /// Wait until some member leads, or give up after `timeout`.
    pub async fn wait_for_leader(&self, timeout: std::time::Duration) -> bool {
        let poll = self.config.heartbeat_interval();
        tokio::time::timeout(timeout, async {
            while self.leader().is_none() {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn next_request_id(&self) -> u64 {
        self.req_ids.next()
    }

    /// Serve a translated key-space request.
    pub async fn do_request(&self, mut r: Request) -> Result<Response> {
        r.id = self.next_request_id();
        if r.method == Method::Get && r.quorum {
            r.method = Method::QGet;
        }
        match r.method {
            Method::Put | Method::Post | Method::Delete | Method::Sync => {
                match self.propose_and_wait(EntryData::Request(r)).await? {
                    Some(event) => Ok(Response::Event(event)),
                    None => Ok(Response::Empty),
                }
            }
            Method::QGet => self.quorum_get(r).await,
            Method::Get | Method::Head => {
                if r.wait {
                    let watcher = self.store.watch(&r.path, r.recursive, r.stream, r.since)?;
                    Ok(Response::Watcher(watcher))
                } else {
                    Ok(Response::Event(self.store.get(&r.path, r.recursive)?))
                }
            }
        }
    }

    /// Quorum reads are idempotent, so timeouts are retried.
    async fn quorum_get(&self, mut r: Request) -> Result<Response> {
        let mut attempt = 0;
        loop {
            match self.propose_and_wait(EntryData::Request(r.clone())).await {
                Ok(Some(event)) => return Ok(Response::Event(event)),
                Ok(None) => return Err(Error::Internal("quorum read produced no event".into())),
                Err(e) if e.is_retryable() && attempt < self.config.quorum_read_retries => {
                    attempt += 1;
                    warn!(path = %r.path, attempt, error = %e, "Retrying quorum read");
                    r.id = self.next_request_id();
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn propose_and_wait(&self, data: EntryData) -> ApplyResult {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let id = data.id();
        let rx = self.wait.register(id);
        METRICS.proposals_pending.inc();

        let result = match self.raft.propose(data) {
            Err(e) => {
                self.wait.cancel(id);
                Err(e)
            }
            Ok(index) => {
                self.stats.send_append.inc();
                debug!(request_id = id, index, "Proposed");
                match tokio::time::timeout(self.config.request_timeout(), rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(Error::Stopped),
                    Err(_) => {
                        self.wait.cancel(id);
                        Err(self.timeout_error())
                    }
                }
            }
        };

        METRICS.proposals_pending.dec();
        if matches!(&result, Err(e) if !matches!(e, Error::Key(_))) {
            METRICS.proposals_failed.inc();
        }
        result
    }

    fn timeout_error(&self) -> Error {
        if self.leader().is_none() {
            Error::TimeoutDueToLeaderFail
        } else {
            Error::Timeout
        }
    }

    /// Add a member through consensus.
    pub async fn add_member(&self, member: Member) -> Result<()> {
        let cc = ConfChange::add(self.next_request_id(), &member)?;
        self.configure(cc).await
    }

    pub async fn remove_member(&self, id: Id) -> Result<()> {
        let cc = ConfChange::remove(self.next_request_id(), id);
        self.configure(cc).await
    }

    /// Replace a member's peer URLs through consensus.
    pub async fn update_member(&self, id: Id, peer_urls: Vec<String>) -> Result<()> {
        let member = Member {
            id,
            raft_attributes: RaftAttributes { peer_urls },
            attributes: Attributes::default(),
        };
        let cc = ConfChange::update(self.next_request_id(), &member)?;
        self.configure(cc).await
    }

    async fn configure(&self, cc: ConfChange) -> Result<()> {
        // fast reject; the apply loop validates again
        self.cluster.validate_configuration_change(&cc)?;
        self.propose_and_wait(EntryData::ConfChange(cc)).await?;
        Ok(())
    }

    /// Whether the local member can serve health checks: a leader is known
    /// and a quorum read makes it through the log.
    pub async fn health(&self) -> bool {
        if self.leader().is_none() {
            return false;
        }
        let before = self.index();
        match self.do_request(Request::new(Method::QGet, "/")).await {
            Ok(_) => self.index() > before,
            Err(e) => {
                warn!(error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn run_apply_loop(
        self: Arc<Self>,
        mut apply_rx: mpsc::UnboundedReceiver<LogEntry>,
        mut shutdown: signal::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                entry = apply_rx.recv() => match entry {
                    Some(entry) => self.apply_entry(entry),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(member = %self.id, "Apply loop stopped");
    }

    fn apply_entry(&self, entry: LogEntry) {
        let id = entry.data.id();
        let result = match entry.data {
            EntryData::Request(r) => self.apply_request(&r),
            EntryData::ConfChange(cc) => self.apply_conf_change(&cc).map(|()| None),
        };
        self.applied_index.store(entry.index, Ordering::Release);
        METRICS.applied_index.set(entry.index);
        METRICS.proposals_applied.inc();
        self.wait.trigger(id, result);
    }

    fn apply_request(&self, r: &Request) -> ApplyResult {
        let store = &self.store;
        let exp = r.expiration;
        let event = match r.method {
            Method::Post => store.create(&r.path, r.dir, &r.val, true, exp)?,
            Method::Put => {
                if let Some(id) = member_attributes_id(&r.path) {
                    let attrs: Attributes = serde_json::from_str(&r.val)?;
                    self.cluster.update_attributes(id, attrs)?;
                    return Ok(Some(store.get(&r.path, false)?));
                }
                if r.path == STORE_VERSION_KEY {
                    self.cluster.set_version(&r.val)?;
                    return Ok(Some(store.get(&r.path, false)?));
                }
                match r.prev_exist {
                    Some(false) => store.create(&r.path, r.dir, &r.val, false, exp)?,
                    Some(true) if !r.has_compare() => store.update(&r.path, &r.val, exp)?,
                    _ if r.has_compare() => store.compare_and_swap(
                        &r.path,
                        r.prev_value.as_deref(),
                        r.prev_index,
                        &r.val,
                        exp,
                    )?,
                    _ => store.set(&r.path, r.dir, &r.val, exp)?,
                }
            }
            Method::Delete => {
                if r.has_compare() {
                    store.compare_and_delete(&r.path, r.prev_value.as_deref(), r.prev_index)?
                } else {
                    store.delete(&r.path, r.dir, r.recursive)?
                }
            }
            Method::QGet => store.get(&r.path, r.recursive)?,
            Method::Sync => {
                let now = r.time.unwrap_or_else(Utc::now);
                store.delete_expired_keys(now);
                return Ok(None);
            }
            Method::Get | Method::Head => return Err(Error::UnknownMethod),
        };
        Ok(Some(event))
    }

    fn apply_conf_change(&self, cc: &ConfChange) -> Result<()> {
        if let Err(e) = self.cluster.apply_configuration_change(cc) {
            warn!(member = %cc.node_id, kind = ?cc.kind, error = %e, "Rejected configuration change");
            return Err(e);
        }
        info!(
            member = %cc.node_id,
            kind = ?cc.kind,
            cluster_id = %self.cluster.id(),
            "Applied configuration change"
        );
        if cc.kind == ConfChangeKind::RemoveNode && cc.node_id == self.id {
            warn!(member = %self.id, "Local member was removed from the cluster; stopping consensus");
            self.raft.mark_removed();
        }
        Ok(())
    }

    async fn run_sync_ticker(self: Arc<Self>, mut shutdown: signal::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_leader() {
                        self.sync();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Propose a clock tick without waiting for it to apply.
    fn sync(&self) {
        let mut r = Request::sync(Utc::now());
        r.id = self.next_request_id();
        if let Err(e) = self.raft.propose(EntryData::Request(r)) {
            debug!(error = %e, "SYNC proposal dropped");
        }
    }

    /// Publish this member's name and client URLs, then settle the cluster
    /// version if nobody has.
    async fn publish(self: Arc<Self>, shutdown: signal::Receiver<bool>) {
        let attrs = Attributes {
            name: self.name.clone(),
            client_urls: self.config.advertise_client_urls.clone(),
        };
        let val = match serde_json::to_string(&attrs) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to encode member attributes");
                return;
            }
        };
        let mut put = Request::new(Method::Put, member_attributes_key(self.id));
        put.val = val;
        if !self.propose_until_applied(put, &shutdown).await {
            return;
        }
        info!(member = %self.id, client_urls = ?attrs.client_urls, "Published member attributes");

        if self.cluster.version().is_none() {
            let mut put = Request::new(Method::Put, STORE_VERSION_KEY);
            put.val = crate::MIN_CLUSTER_VERSION.to_string();
            self.propose_until_applied(put, &shutdown).await;
        }
    }

    async fn propose_until_applied(
        &self,
        r: Request,
        shutdown: &signal::Receiver<bool>,
    ) -> bool {
        let retry = self.config.heartbeat_interval();
        loop {
            if *shutdown.borrow() {
                return false;
            }
            let mut r = r.clone();
            r.id = self.next_request_id();
            match self.propose_and_wait(EntryData::Request(r)).await {
                Ok(_) => return true,
                Err(Error::Stopped) => return false,
                Err(e) => {
                    debug!(error = %e, "Proposal not applied yet, retrying");
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }
}

/// `/0/members/<hex id>/attributes` → the member ID.
fn member_attributes_id(path: &str) -> Option<Id> {
    let rest = path.strip_prefix(STORE_MEMBERS_PREFIX)?.strip_prefix('/')?;
    let (id, suffix) = rest.split_once('/')?;
    if suffix != ATTRIBUTES_SUFFIX {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCode;
    use std::time::Duration;

    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            name: "node1".into(),
            initial_advertise_peer_urls: vec!["http://127.0.0.1:2380".into()],
            advertise_client_urls: vec!["http://127.0.0.1:2379".into()],
            election_timeout_ms: 10,
            heartbeat_interval_ms: 5,
            request_timeout_ms: 1_000,
            sync_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn started() -> Arc<KvServer> {
        let server = KvServer::new(test_config()).unwrap();
        server.start();
        assert!(server.wait_for_leader(Duration::from_secs(2)).await);
        server
    }

    fn put(path: &str, val: &str) -> Request {
        let mut r = Request::new(Method::Put, path);
        r.val = val.into();
        r
    }

    fn event(resp: Response) -> Event {
        match resp {
            Response::Event(e) => e,
            _ => panic!("expected an event"),
        }
    }

    #[test]
    fn test_request_ids_unique_and_prefixed() {
        let gen = RequestIdGen::new(Id(0x1234_abcd), 1_000);
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert_eq!(a >> 48, 0xabcd);
        assert_eq!(b >> 48, 0xabcd);
    }

    #[test]
    fn test_member_attributes_id() {
        assert_eq!(member_attributes_id("/0/members/ab12/attributes"), Some(Id(0xab12)));
        assert_eq!(member_attributes_id("/0/members/ab12/raftAttributes"), None);
        assert_eq!(member_attributes_id("/1/members/ab12/attributes"), None);
        assert_eq!(member_attributes_id("/0/members/zz/attributes"), None);
    }

    #[test]
    fn test_new_rejects_unknown_local_member() {
        let mut cfg = test_config();
        cfg.initial_cluster = "other=http://10.0.0.1:2380".into();
        assert!(KvServer::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_initial_members_persisted() {
        let server = KvServer::new(test_config()).unwrap();
        assert_eq!(server.cluster().len(), 1);
        let ev = server
            .store()
            .get(&format!("{}/{}", STORE_MEMBERS_PREFIX, server.id()), true)
            .unwrap();
        assert_eq!(ev.node.nodes.map(|n| n.len()), Some(2));
    }

    #[tokio::test]
    async fn test_proposal_rejected_before_election() {
        let server = KvServer::new(test_config()).unwrap();
        let err = server.do_request(put("/1/foo", "bar")).await.err().unwrap();
        assert!(matches!(err, Error::NotLeader(_)));
    }

    #[tokio::test]
    async fn test_put_semantics() {
        let server = started().await;

        let ev = event(server.do_request(put("/1/foo", "a")).await.unwrap());
        assert_eq!(ev.action, "set");
        assert!(ev.is_created());

        let mut r = put("/1/foo", "b");
        r.prev_exist = Some(false);
        let err = server.do_request(r).await.err().unwrap();
        assert_eq!(err.into_key_error().code, ErrorCode::NodeExist);

        let mut r = put("/1/foo", "c");
        r.prev_exist = Some(true);
        assert_eq!(event(server.do_request(r).await.unwrap()).action, "update");

        let mut r = put("/1/foo", "d");
        r.prev_value = Some("c".into());
        assert_eq!(event(server.do_request(r).await.unwrap()).action, "compareAndSwap");

        let mut r = put("/1/foo", "e");
        r.prev_value = Some("nope".into());
        let err = server.do_request(r).await.err().unwrap();
        assert_eq!(err.into_key_error().code, ErrorCode::TestFailed);

        let mut r = put("/1/dir", "");
        r.dir = true;
        assert!(event(server.do_request(r).await.unwrap()).node.dir);

        let ev = event(
            server
                .do_request(Request::new(Method::Get, "/1/foo"))
                .await
                .unwrap(),
        );
        assert_eq!(ev.node.value.as_deref(), Some("d"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_post_creates_in_order_keys() {
        let server = started().await;
        let a = event(server.do_request(put_post("/1/queue", "1")).await.unwrap());
        let b = event(server.do_request(put_post("/1/queue", "2")).await.unwrap());
        assert_eq!(a.action, "create");
        assert!(a.node.key < b.node.key);
        assert!(a.node.key.starts_with("/1/queue/"));
        server.stop().await;
    }

    fn put_post(path: &str, val: &str) -> Request {
        let mut r = Request::new(Method::Post, path);
        r.val = val.into();
        r
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let server = started().await;
        server.do_request(put("/1/a", "x")).await.unwrap();

        let mut r = Request::new(Method::Delete, "/1/a");
        r.prev_value = Some("y".into());
        let err = server.do_request(r).await.err().unwrap();
        assert_eq!(err.into_key_error().code, ErrorCode::TestFailed);

        let mut r = Request::new(Method::Delete, "/1/a");
        r.prev_value = Some("x".into());
        assert_eq!(
            event(server.do_request(r).await.unwrap()).action,
            "compareAndDelete"
        );

        let err = server
            .do_request(Request::new(Method::Delete, "/1/a"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_key_error().code, ErrorCode::KeyNotFound);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_quorum_get_goes_through_log() {
        let server = started().await;
        server.do_request(put("/1/q", "v")).await.unwrap();
        let before = server.index();
        let mut r = Request::new(Method::Get, "/1/q");
        r.quorum = true;
        let ev = event(server.do_request(r).await.unwrap());
        assert_eq!(ev.node.value.as_deref(), Some("v"));
        assert!(server.index() > before);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_wait_returns_watcher() {
        let server = started().await;
        let mut r = Request::new(Method::Get, "/1/w");
        r.wait = true;
        let mut watcher = match server.do_request(r).await.unwrap() {
            Response::Watcher(w) => w,
            _ => panic!("expected a watcher"),
        };
        server.do_request(put("/1/w", "1")).await.unwrap();
        let ev = watcher.events.recv().await.unwrap();
        assert_eq!(ev.node.key, "/1/w");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sync_expires_keys() {
        let server = started().await;
        let mut r = put("/1/ttl", "v");
        r.expiration = Some(Utc::now() - chrono::Duration::seconds(1));
        server.do_request(r).await.unwrap();

        let resp = server.do_request(Request::sync(Utc::now())).await.unwrap();
        assert!(matches!(resp, Response::Empty));
        let err = server.store().get("/1/ttl", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::KeyNotFound);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_publish_sets_attributes_and_version() {
        let server = started().await;
        let cluster_ready = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let published = server
                    .cluster()
                    .member(server.id())
                    .map_or(false, |m| !m.client_urls().is_empty());
                if published && server.cluster().version().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(cluster_ready.is_ok());
        let m = server.cluster().member(server.id()).unwrap();
        assert_eq!(m.name(), "node1");
        assert_eq!(m.client_urls(), ["http://127.0.0.1:2379".to_string()]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_member_changes() {
        let server = started().await;
        let m = Member::new("node2", vec!["http://127.0.0.1:3380".into()], "t", Some(Utc::now()));
        server.add_member(m.clone()).await.unwrap();
        assert_eq!(server.cluster().len(), 2);

        let dup = Member::new("node3", vec!["http://127.0.0.1:3380".into()], "t", None);
        assert!(matches!(
            server.add_member(dup).await,
            Err(Error::PeerUrlExists)
        ));

        server
            .update_member(m.id, vec!["http://127.0.0.1:4380".into()])
            .await
            .unwrap();
        assert_eq!(
            server.cluster().member(m.id).unwrap().peer_urls(),
            ["http://127.0.0.1:4380".to_string()]
        );

        server.remove_member(m.id).await.unwrap();
        assert!(matches!(server.remove_member(m.id).await, Err(Error::IdRemoved)));
        assert!(matches!(server.remove_member(Id(42)).await, Err(Error::IdNotFound)));
        assert!(server.cluster().is_id_removed(m.id));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_removed_local_member_stops_serving() {
        let server = started().await;
        server.remove_member(server.id()).await.unwrap();
        assert!(server.cluster().is_id_removed(server.id()));

        // several election timeouts pass without a new leader
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!server.is_leader());
        assert!(server.raft().is_removed());
        let err = server.do_request(put("/1/foo", "bar")).await.err().unwrap();
        assert!(matches!(err, Error::Stopped));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let server = started().await;
        assert!(server.health().await);
        assert!(server.leader_stats().is_some());
        assert_eq!(server.self_stats().state, "StateLeader");

        // with the tickers stopped nobody re-elects
        server.stop().await;
        server.raft().step_down(server.term() + 1, None);
        assert!(server.leader_stats().is_none());
        assert!(!server.health().await);
        assert_eq!(server.self_stats().state, "StateFollower");
    }

    #[tokio::test]
    async fn test_stop_fails_new_requests() {
        let server = started().await;
        server.stop().await;
        let err = server.do_request(put("/1/x", "y")).await.err().unwrap();
        assert!(matches!(err, Error::Stopped));
    }
}
