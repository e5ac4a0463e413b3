//! Per-connection session state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mego_protocol::{Response, encode_message};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::chunk::PendingUpload;

struct Frame {
    bytes: Bytes,
    push: bool,
}

/// Receiving half of a session's outbound queue, drained by the writer task.
///
/// Replies and pushes share one ordered queue. Only pushes count against the
/// session's buffer limit, so a reply is never dropped.
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    queued_pushes: Arc<AtomicUsize>,
}

impl Outbox {
    /// Waits for the next frame. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let frame = self.rx.recv().await?;
        Some(self.take(frame))
    }

    /// Takes the next frame if one is queued.
    pub fn try_recv(&mut self) -> Result<Bytes, TryRecvError> {
        let frame = self.rx.try_recv()?;
        Ok(self.take(frame))
    }

    fn take(&self, frame: Frame) -> Bytes {
        if frame.push {
            self.queued_pushes.fetch_sub(1, Ordering::AcqRel);
        }
        frame.bytes
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("queued_pushes", &self.queued_pushes.load(Ordering::Relaxed))
            .finish()
    }
}

/// One connected client.
///
/// Created by the [`Hub`](crate::Hub) when a transport connects and removed
/// from every channel when it disconnects.
pub struct Session {
    id: String,
    keys: RwLock<HashMap<String, Value>>,
    tx: mpsc::UnboundedSender<Frame>,
    queued_pushes: Arc<AtomicUsize>,
    push_limit: usize,
    last_reply: AtomicU64,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    dropped_frames: AtomicU64,
    disconnect: Notify,
    /// Reverse index of `(event, channel)` memberships.
    pub(crate) subscriptions: Mutex<HashSet<(String, String)>>,
    /// Chunked uploads in progress, keyed by request id.
    pub(crate) uploads: Mutex<HashMap<u64, PendingUpload>>,
}

impl Session {
    /// Creates a session whose queue holds at most `push_limit` undelivered pushes.
    pub(crate) fn new(id: String, push_limit: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued_pushes = Arc::new(AtomicUsize::new(0));
        let outbox = Outbox {
            rx,
            queued_pushes: queued_pushes.clone(),
        };
        let session = Self {
            id,
            keys: RwLock::new(HashMap::new()),
            tx,
            queued_pushes,
            push_limit: push_limit.max(1),
            last_reply: AtomicU64::new(0),
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            disconnect: Notify::new(),
            subscriptions: Mutex::new(HashSet::new()),
            uploads: Mutex::new(HashMap::new()),
        };
        (session, outbox)
    }

    /// Session id (UUID v4).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the transport connected.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Returns true once the session has been removed from the hub.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Stores a session-wide key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.keys.write().insert(key.into(), value.into());
    }

    /// Reads a session-wide key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.keys.read().get(key).cloned()
    }

    /// Removes a session-wide key.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.keys.write().remove(key)
    }

    /// Snapshot of every session key.
    pub fn keys(&self) -> HashMap<String, Value> {
        self.keys.read().clone()
    }

    pub(crate) fn merge_keys(&self, keys: impl IntoIterator<Item = (String, Value)>) {
        self.keys.write().extend(keys);
    }

    /// `(event, channel)` pairs this session is subscribed to.
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        let mut subs: Vec<_> = self.subscriptions.lock().iter().cloned().collect();
        subs.sort();
        subs
    }

    /// Queues an encoded event push for the writer task.
    ///
    /// Returns `false` if the session is closed or already holds its limit of
    /// undelivered pushes.
    pub fn push_frame(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        let queued = self.queued_pushes.fetch_add(1, Ordering::AcqRel);
        if queued < self.push_limit
            && self.tx.send(Frame { bytes: frame, push: true }).is_ok()
        {
            return true;
        }
        self.queued_pushes.fetch_sub(1, Ordering::AcqRel);
        let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(session = %self.id, dropped, "Outbound queue full or closed, push dropped");
        false
    }

    /// Encodes and queues an event push, see [`push_frame`](Self::push_frame).
    pub fn push(&self, response: &Response) -> bool {
        match encode_message(response) {
            Ok(frame) => self.push_frame(frame),
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to encode push");
                false
            }
        }
    }

    /// Encodes and queues a reply or chunk control frame.
    ///
    /// Replies bypass the push limit; `false` only when the session is gone.
    pub fn send(&self, response: &Response) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = match encode_message(response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to encode response");
                return false;
            }
        };
        if response.id != 0 && !response.is_chunk_next() {
            self.last_reply.store(response.id, Ordering::Release);
        }
        if self.tx.send(Frame { bytes: frame, push: false }).is_err() {
            debug!(session = %self.id, id = response.id, "Writer gone, reply dropped");
            return false;
        }
        true
    }

    /// Id of the last request that got a terminal reply.
    pub(crate) fn last_reply(&self) -> u64 {
        self.last_reply.load(Ordering::Acquire)
    }

    pub(crate) fn clear_last_reply(&self) {
        self.last_reply.store(0, Ordering::Release);
    }

    /// Asks the transport to close this connection.
    pub fn disconnect(&self) {
        self.disconnect.notify_one();
    }

    /// Resolves once [`disconnect`](Self::disconnect) was called.
    pub(crate) async fn disconnect_requested(&self) {
        self.disconnect.notified().await;
    }

    /// Pushes dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Records inbound activity (frame or pong).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Discards chunked uploads that received no part for `ttl`.
    ///
    /// Returns how many were dropped.
    pub(crate) fn sweep_uploads(&self, ttl: Duration) -> usize {
        let stale: Vec<PendingUpload> = {
            let mut uploads = self.uploads.lock();
            let ids: Vec<u64> = uploads
                .iter()
                .filter(|(_, upload)| upload.idle_for() >= ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| uploads.remove(id)).collect()
        };
        for upload in &stale {
            debug!(session = %self.id, file_id = upload.file_id, "Discarding stale upload");
            upload.discard(&self.id);
        }
        stale.len()
    }

    /// Drops every pending chunked upload, letting processors discard partial data.
    pub(crate) fn discard_uploads(&self) {
        let uploads: Vec<_> = self.uploads.lock().drain().map(|(_, u)| u).collect();
        for upload in uploads {
            debug!(session = %self.id, file_id = upload.file_id, "Discarding pending upload");
            upload.discard(&self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
