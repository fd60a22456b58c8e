//! Watcher registry
//!
//! Every watcher owns a bounded channel. Producers never block: a watcher
//! whose channel is full is unregistered and its sender dropped, which the
//! consumer observes as the channel closing once the buffered events drain.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::metrics::METRICS;
use crate::common::KeyError;
use crate::store::event::{key_matches, Event, EventHistory};

struct Registration {
    key: String,
    recursive: bool,
    stream: bool,
    since: u64,
    tx: mpsc::Sender<Event>,
}

struct HubInner {
    watchers: HashMap<u64, Registration>,
    next_id: u64,
    history: EventHistory,
}

impl HubInner {
    fn unregister(&mut self, id: u64) -> bool {
        let removed = self.watchers.remove(&id).is_some();
        if removed {
            METRICS.watchers_active.dec();
        }
        removed
    }
}

/// Shared registry of watchers plus the event history.
#[derive(Clone)]
pub struct WatcherHub {
    inner: Arc<Mutex<HubInner>>,
    capacity: usize,
}

/// Deregisters its watcher when dropped.
pub struct WatchGuard {
    hub: Option<Arc<Mutex<HubInner>>>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.take() {
            if hub.lock().unregister(self.id) {
                debug!(watcher = self.id, "Watcher released");
            }
        }
    }
}

/// A subscription handed to the consumer.
pub struct Watcher {
    pub events: mpsc::Receiver<Event>,
    /// Store index when the watch was registered
    pub start_index: u64,
    pub stream: bool,
    guard: WatchGuard,
}

impl Watcher {
    /// Release the registration now rather than on drop.
    pub fn remove(&mut self) {
        if let Some(hub) = self.guard.hub.take() {
            hub.lock().unregister(self.guard.id);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.guard
            .hub
            .as_ref()
            .map_or(false, |hub| hub.lock().watchers.contains_key(&self.guard.id))
    }
}

impl WatcherHub {
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                watchers: HashMap::new(),
                next_id: 1,
                history: EventHistory::new(history_capacity),
            })),
            capacity: capacity.max(1),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Register interest in `key`.
    ///
    /// `since` is the first index the caller wants. Events already in the
    /// history are delivered immediately; a single-event watch satisfied from
    /// history is never registered. A stream whose matching backlog does not
    /// fit in its channel gets the first `capacity` events and a closed
    /// channel, the same outcome as falling behind later.
    pub fn watch(
        &self,
        key: &str,
        recursive: bool,
        stream: bool,
        since: u64,
        store_index: u64,
    ) -> Result<Watcher, KeyError> {
        let mut inner = self.inner.lock();
        let limit = if stream { self.capacity + 1 } else { 1 };
        let mut past = inner
            .history
            .scan(key, recursive, since, limit)
            .map_err(|mut e| {
                e.index = store_index;
                e
            })?;
        let overrun = past.len() > self.capacity;
        past.truncate(self.capacity);

        let (tx, rx) = mpsc::channel(self.capacity);
        let satisfied = !past.is_empty();
        for mut event in past {
            event.store_index = store_index;
            // at most `capacity` events, so this cannot fail
            let _ = tx.try_send(event);
        }

        if overrun || (!stream && satisfied) {
            if overrun {
                warn!(key, since, "Watch backlog exceeds channel capacity, dropping");
                METRICS.watch_overruns.inc();
            }
            return Ok(Watcher {
                events: rx,
                start_index: store_index,
                stream,
                guard: WatchGuard { hub: None, id: 0 },
            });
        }

        // every matching event up to `store_index` has been replayed
        let next = since.max(store_index + 1);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.watchers.insert(
            id,
            Registration {
                key: key.to_string(),
                recursive,
                stream,
                since: next,
                tx,
            },
        );
        METRICS.watchers_active.inc();
        debug!(watcher = id, key, recursive, stream, since = next, "Watcher registered");

        Ok(Watcher {
            events: rx,
            start_index: store_index,
            stream,
            guard: WatchGuard {
                hub: Some(self.inner.clone()),
                id,
            },
        })
    }

    /// Record `event` and deliver it to every interested watcher.
    pub fn notify(&self, event: &Event) {
        let mut inner = self.inner.lock();
        inner.history.add(event.clone());

        let mut done = Vec::new();
        for (id, w) in inner.watchers.iter() {
            if event.index() < w.since || !key_matches(&w.key, &event.node.key, w.recursive) {
                continue;
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) if w.stream => {}
                Ok(()) => done.push(*id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(watcher = id, key = %w.key, "Watcher overrun, dropping");
                    METRICS.watch_overruns.inc();
                    done.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => done.push(*id),
            }
        }
        for id in done {
            inner.unregister(id);
        }
    }
}
