//! A live duplex connection and its outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use duel_core::ConnectionId;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Number of pumps that run per connection.
const PUMPS_PER_CONNECTION: usize = 2;

/// Why a frame could not be queued.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The outbound queue has been closed.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,
    /// The payload could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// One connected peer.
///
/// Application code never writes to the transport directly: frames are
/// queued here and the write pump is the only writer.
pub struct Connection {
    id: ConnectionId,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    cancel: CancellationToken,
    pumps: PumpTracker,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` frames.
    ///
    /// The connection's cancellation token is a child of `parent`. The
    /// returned receiver belongs to the write pump.
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let now = Instant::now();
        let conn = Arc::new(Self {
            id,
            outbound: Mutex::new(Some(tx)),
            cancel: parent.child_token(),
            pumps: PumpTracker::new(PUMPS_PER_CONNECTION),
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue counts as a dropped frame.
    pub fn try_send(&self, payload: Bytes) -> Result<(), ConnectionError> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ConnectionError::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                ConnectionError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Queue a frame, waiting for space.
    pub async fn send(&self, payload: Bytes) -> Result<(), ConnectionError> {
        let tx = self.outbound.lock().clone().ok_or(ConnectionError::Closed)?;
        tx.send(payload).await.map_err(|_| ConnectionError::Closed)
    }

    /// Serialize `value` as JSON and queue it without waiting.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ConnectionError> {
        let json = serde_json::to_vec(value).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.try_send(Bytes::from(json))
    }

    /// Close the outbound queue.
    ///
    /// The write pump drains what is already queued, sends a close frame,
    /// and exits. Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    /// Whether [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Signal both pumps to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone of the connection's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the connection is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Block until both pumps have exited and run their teardown hooks.
    pub async fn wait(&self) {
        self.pumps.wait().await;
    }

    /// Pumps that have not exited yet.
    pub fn pumps_running(&self) -> usize {
        self.pumps.running()
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// When the last inbound frame or pong arrived.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Time since the last inbound frame or pong.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn pump_exited(&self) {
        self.pumps.finish();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("cancelled", &self.is_cancelled())
            .field("pumps_running", &self.pumps_running())
            .finish_non_exhaustive()
    }
}

/// Completion counter for a connection's pumps.
struct PumpTracker {
    running: AtomicUsize,
    done: Notify,
}

impl PumpTracker {
    fn new(count: usize) -> Self {
        Self {
            running: AtomicUsize::new(count),
            done: Notify::new(),
        }
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn finish(&self) {
        let prev = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.done.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            // Register before checking so a finish in between is not missed
            let notified = self.done.notified();
            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }
}
