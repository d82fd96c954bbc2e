//! The live-connection set.
//!
//! A single loop ([`ConnectionRegistry::run`]) owns the table. Register,
//! unregister, and snapshot requests are messages processed one at a time,
//! so a snapshot never reflects a half-applied mutation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use duel_core::ConnectionId;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionError};
use super::pump::{ConnectionHooks, PumpExit};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

/// Pending commands before callers wait for the loop.
const COMMAND_BUFFER: usize = 256;

/// Registry failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry loop is not running or has shut down.
    #[error("connection registry is shutting down")]
    ShuttingDown,
}

/// Result of [`ConnectionRegistry::broadcast`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that accepted the frame.
    pub delivered: usize,
    /// Connections whose queue was full or closed.
    pub dropped: usize,
}

enum Command {
    Register {
        conn: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        ack: oneshot::Sender<bool>,
    },
    Release {
        conn: Arc<Connection>,
        ack: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Arc<Connection>>>,
    },
}

/// Handle to the live-connection set. Cheap to share behind an `Arc`.
pub struct ConnectionRegistry {
    tx: mpsc::Sender<Command>,
    rx: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl ConnectionRegistry {
    /// Create a registry. Nothing is applied until [`run`](Self::run) is
    /// polled.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Add a connection, waiting until the loop has applied it.
    ///
    /// A connection with the same ID already present is replaced and torn
    /// down.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Register { conn, ack })
            .await
            .map_err(|_| RegistryError::ShuttingDown)?;
        done.await.map_err(|_| RegistryError::ShuttingDown)
    }

    /// Remove a connection, cancelling and closing it.
    ///
    /// Returns `true` if it was present. Removing an absent connection is a
    /// no-op, as is calling this after shutdown.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let (ack, done) = oneshot::channel();
        let cmd = Command::Unregister {
            id: id.clone(),
            ack,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Remove `conn` only if it is still the entry for its ID.
    ///
    /// A connection that was replaced by a later registration with the same
    /// ID leaves the replacement alone.
    pub async fn release(&self, conn: &Arc<Connection>) -> bool {
        let (ack, done) = oneshot::channel();
        let cmd = Command::Release {
            conn: conn.clone(),
            ack,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Point-in-time snapshot of every live connection.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        done.await.unwrap_or_default()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections().await.len()
    }

    /// Queue `payload` on every live connection without waiting.
    pub async fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.connections().await {
            match conn.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(ConnectionError::QueueFull | ConnectionError::Closed) => {
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(connection_id = %conn.id(), error = %e, "broadcast failed");
                    report.dropped += 1;
                }
            }
        }
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast"
        );
        report
    }

    /// The registry loop. Applies commands until `cancel` fires, then tears
    /// down every remaining connection and returns.
    ///
    /// Only the first call runs; later calls return immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("connection registry loop already started");
            return;
        };
        let mut live: HashMap<ConnectionId, Arc<Connection>> = HashMap::new();
        info!("connection registry running");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => apply(&mut live, cmd),
                    None => break,
                },
            }
        }

        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                // Dropping the ack reports ShuttingDown to the caller
                Command::Register { conn, .. } => teardown(&conn),
                Command::Unregister { ack, .. } | Command::Release { ack, .. } => {
                    let _ = ack.send(false);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(Vec::new());
                }
            }
        }

        let remaining = live.len();
        for (_, conn) in live.drain() {
            teardown(&conn);
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        }
        gauge!(WS_CONNECTIONS_ACTIVE).set(0.0);
        info!(remaining, "connection registry stopped");
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(live: &mut HashMap<ConnectionId, Arc<Connection>>, cmd: Command) {
    match cmd {
        Command::Register { conn, ack } => {
            let id = conn.id().clone();
            if let Some(prev) = live.insert(id.clone(), conn) {
                warn!(connection_id = %id, "replacing connection with duplicate id");
                teardown(&prev);
            } else {
                counter!(WS_CONNECTIONS_TOTAL).increment(1);
            }
            debug!(connection_id = %id, live = live.len(), "connection registered");
            let _ = ack.send(());
        }
        Command::Unregister { id, ack } => {
            let removed = remove(live, &id);
            let _ = ack.send(removed);
        }
        Command::Release { conn, ack } => {
            let id = conn.id();
            let current = live.get(id).is_some_and(|entry| Arc::ptr_eq(entry, &conn));
            let removed = current && remove(live, id);
            let _ = ack.send(removed);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(live.values().cloned().collect());
        }
    }
    #[allow(clippy::cast_precision_loss)]
    gauge!(WS_CONNECTIONS_ACTIVE).set(live.len() as f64);
}

fn remove(live: &mut HashMap<ConnectionId, Arc<Connection>>, id: &ConnectionId) -> bool {
    let Some(conn) = live.remove(id) else {
        return false;
    };
    teardown(&conn);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    debug!(connection_id = %id, live = live.len(), "connection unregistered");
    true
}

fn teardown(conn: &Connection) {
    conn.cancel();
    let _ = conn.close();
}

/// The registry as connection hooks: established registers, each pump's
/// exit unregisters.
#[async_trait]
impl ConnectionHooks for ConnectionRegistry {
    async fn on_established(&self, conn: &Arc<Connection>) -> bool {
        match self.register(conn.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = %conn.id(), error = %e, "connection refused");
                false
            }
        }
    }

    async fn on_torn_down(&self, conn: &Arc<Connection>, _exit: &PumpExit) {
        let _ = self.release(conn).await;
    }
}
