//! Watch dispatch
//!
//! A [`WatchDispatcher`] owns one registered [`Watcher`] and pumps its events
//! to the client as newline-delimited JSON until one of:
//! - the client goes away,
//! - the watch deadline passes,
//! - the store hub closes the channel because the client fell behind,
//! - a single-event watch has delivered its event.
//!
//! The watcher is deregistered on every one of those paths.

use axum::body::Body;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::common::metrics::METRICS;
use crate::membership::backend::STORE_KEYS_PREFIX;
use crate::store::{Event, Watcher};

/// Chunks buffered between the dispatcher and the HTTP body.
const BODY_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    ClientClosed,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Completed,
    Cancelled(CancelReason),
    /// The hub dropped the watcher because its channel filled up.
    Overrun,
}

pub type BodySender = mpsc::Sender<Result<Bytes, std::io::Error>>;

pub struct WatchDispatcher {
    watcher: Watcher,
    timeout: Duration,
}

impl WatchDispatcher {
    pub fn new(watcher: Watcher, timeout: Duration) -> Self {
        Self { watcher, timeout }
    }

    /// Run the dispatcher on its own task and hand back the response body it
    /// writes into. Dropping the body (client disconnect) cancels the watch.
    pub fn spawn(self) -> Body {
        let (tx, rx) = mpsc::channel(BODY_BUFFER);
        tokio::spawn(self.run(tx));
        Body::from_stream(ReceiverStream::new(rx))
    }

    pub async fn run(mut self, sink: BodySender) -> WatchOutcome {
        let deadline = Instant::now() + self.timeout;
        let stream = self.watcher.stream;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = sink.closed() => break WatchOutcome::Cancelled(CancelReason::ClientClosed),
                _ = tokio::time::sleep_until(deadline) => {
                    break WatchOutcome::Cancelled(CancelReason::Deadline)
                }
                event = self.watcher.events.recv() => {
                    let Some(event) = event else {
                        break WatchOutcome::Overrun;
                    };
                    let chunk = match encode_event(event) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            error!(error = %e, "Failed to encode watch event");
                            break WatchOutcome::Completed;
                        }
                    };
                    match tokio::time::timeout_at(deadline, sink.send(Ok(chunk))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break WatchOutcome::Cancelled(CancelReason::ClientClosed),
                        Err(_) => break WatchOutcome::Cancelled(CancelReason::Deadline),
                    }
                    if !stream {
                        break WatchOutcome::Completed;
                    }
                }
            }
        };

        self.watcher.remove();
        match outcome {
            WatchOutcome::Completed => METRICS.watch_completed.inc(),
            WatchOutcome::Cancelled(_) => METRICS.watch_cancelled.inc(),
            // counted by the hub when it dropped the sender
            WatchOutcome::Overrun => {}
        }
        debug!(?outcome, stream, "Watch finished");
        outcome
    }
}

/// Strip the keys root and render one event line.
pub fn encode_event(event: Event) -> serde_json::Result<Bytes> {
    let event = event.trim_prefix(STORE_KEYS_PREFIX);
    let mut buf = serde_json::to_vec(&event)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn store(capacity: usize) -> Store {
        Store::new(capacity, 100)
    }

    fn decode(chunk: Result<Bytes, std::io::Error>) -> serde_json::Value {
        let bytes = chunk.unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_single_event_completes() {
        let store = store(10);
        let watcher = store.watch("/1/foo", false, false, 0).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(WatchDispatcher::new(watcher, Duration::from_secs(5)).run(tx));

        store.set("/1/foo", false, "bar", None).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome, WatchOutcome::Completed);
        let event = decode(rx.recv().await.unwrap());
        assert_eq!(event["action"], "set");
        assert_eq!(event["node"]["key"], "/foo");
        assert_eq!(event["node"]["value"], "bar");
        assert!(rx.recv().await.is_none());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_delivers_until_deadline() {
        let store = store(10);
        let watcher = store.watch("/1/dir", true, true, 0).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(
            WatchDispatcher::new(watcher, Duration::from_millis(200)).run(tx),
        );

        store.set("/1/dir/a", false, "1", None).unwrap();
        store.set("/1/dir/b", false, "2", None).unwrap();
        store.set("/1/other", false, "x", None).unwrap();

        assert_eq!(decode(rx.recv().await.unwrap())["node"]["key"], "/dir/a");
        assert_eq!(decode(rx.recv().await.unwrap())["node"]["key"], "/dir/b");

        let outcome = task.await.unwrap();
        assert_eq!(outcome, WatchOutcome::Cancelled(CancelReason::Deadline));
        assert!(rx.recv().await.is_none());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_client_close_cancels() {
        let store = store(10);
        let watcher = store.watch("/1/foo", false, true, 0).unwrap();
        assert_eq!(store.watcher_count(), 1);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(WatchDispatcher::new(watcher, Duration::from_secs(30)).run(tx));

        drop(rx);
        let outcome = task.await.unwrap();
        assert_eq!(outcome, WatchOutcome::Cancelled(CancelReason::ClientClosed));
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_overrun_ends_stream() {
        let store = store(1);
        let watcher = store.watch("/1/foo", false, true, 0).unwrap();
        // first event fills the channel, the second overflows it
        store.set("/1/foo", false, "a", None).unwrap();
        store.set("/1/foo", false, "b", None).unwrap();
        assert_eq!(store.watcher_count(), 0);

        let (tx, mut rx) = mpsc::channel(4);
        let outcome = WatchDispatcher::new(watcher, Duration::from_secs(30))
            .run(tx)
            .await;
        assert_eq!(outcome, WatchOutcome::Overrun);
        assert_eq!(decode(rx.recv().await.unwrap())["node"]["value"], "a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_spawned_body_streams_history() {
        let store = store(10);
        store.set("/1/foo", false, "v1", None).unwrap();
        let watcher = store.watch("/1/foo", false, false, 1).unwrap();
        let body = WatchDispatcher::new(watcher, Duration::from_secs(5)).spawn();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(event["node"]["value"], "v1");
        assert_eq!(event["node"]["modifiedIndex"], 1);
    }
}
