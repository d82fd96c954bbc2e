//! The per-connection pump pair.
//!
//! The write pump is the only writer to the transport. It multiplexes queued
//! frames, a keepalive ticker, and cancellation. The read pump runs a decode
//! task that feeds a relay; each decoded frame is fanned out to every handler
//! concurrently and the next frame is not processed until all of them return.
//! With a pong timeout set, a peer that stays silent that long is dropped.
//!
//! Each pump, on exit, cancels the connection (stopping its sibling), calls
//! [`ConnectionHooks::on_torn_down`] once, and then decrements the
//! connection's completion counter, so [`Connection::wait`] returning means
//! no handler or hook is still running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use super::connection::Connection;
use super::transport::{FrameSink, FrameSource, InboundFrame, OutboundFrame, TransportError};

/// Upper bound on the best-effort close frame sent after cancellation.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a pump stopped.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PumpExit {
    /// The connection was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The outbound queue was closed.
    #[error("outbound queue closed")]
    QueueClosed,
    /// Writing to the transport failed.
    #[error("write failed: {0}")]
    WriteFailed(TransportError),
    /// Reading from the transport failed or the peer closed.
    #[error("decode failed: {0}")]
    DecodeFailed(TransportError),
}

impl PumpExit {
    /// Whether this exit should be reported as a failure.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Cancelled | Self::QueueClosed => false,
            Self::WriteFailed(_) => true,
            Self::DecodeFailed(e) => !e.is_expected_closure(),
        }
    }
}

/// Receives every inbound payload on a connection.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload. Handlers for the same frame run concurrently.
    async fn handle(&self, conn: &Arc<Connection>, payload: Bytes);
}

/// Lifecycle callbacks invoked by the pumps.
#[async_trait]
pub trait ConnectionHooks: Send + Sync + 'static {
    /// Called once before the pumps start. Returning `false` rejects the
    /// connection and no pump runs.
    async fn on_established(&self, _conn: &Arc<Connection>) -> bool {
        true
    }

    /// Called once by each pump as it exits.
    async fn on_torn_down(&self, conn: &Arc<Connection>, exit: &PumpExit);
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

#[async_trait]
impl ConnectionHooks for NoHooks {
    async fn on_torn_down(&self, _conn: &Arc<Connection>, _exit: &PumpExit) {}
}

/// Everything the pumps need besides the connection and transport.
pub struct PumpContext {
    handlers: Vec<Arc<dyn MessageHandler>>,
    hooks: Arc<dyn ConnectionHooks>,
    keepalive_interval: Duration,
    pong_timeout: Option<Duration>,
}

impl PumpContext {
    /// No handlers, no hooks, no liveness deadline.
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            handlers: Vec::new(),
            hooks: Arc::new(NoHooks),
            keepalive_interval,
            pong_timeout: None,
        }
    }

    /// Drop the connection when nothing arrives from the peer for
    /// `timeout`. Pongs and data frames both count.
    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = Some(timeout);
        self
    }

    /// Add a message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replace the lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Join handles for a running pump pair.
pub struct PumpHandles {
    /// Write pump task.
    pub write: JoinHandle<PumpExit>,
    /// Read pump task.
    pub read: JoinHandle<PumpExit>,
}

impl PumpHandles {
    /// Wait for both pumps and return their exits as `(write, read)`.
    ///
    /// A pump that panicked is reported as [`PumpExit::Cancelled`].
    pub async fn join(self) -> (PumpExit, PumpExit) {
        let (write, read) = tokio::join!(self.write, self.read);
        let unwrap = |res: Result<PumpExit, tokio::task::JoinError>| {
            res.unwrap_or_else(|e| {
                warn!(error = %e, "pump task aborted");
                PumpExit::Cancelled
            })
        };
        (unwrap(write), unwrap(read))
    }
}

/// Run the established hook and spawn both pumps.
///
/// Returns `None` if the hook rejected the connection; the connection is
/// then cancelled, closed, and [`Connection::wait`] returns immediately.
pub async fn start<K, S>(
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Bytes>,
    sink: K,
    source: S,
    ctx: Arc<PumpContext>,
) -> Option<PumpHandles>
where
    K: FrameSink,
    S: FrameSource,
{
    if !ctx.hooks.on_established(&conn).await {
        debug!(connection_id = %conn.id(), "connection rejected");
        conn.cancel();
        let _ = conn.close();
        conn.pump_exited();
        conn.pump_exited();
        return None;
    }

    let write = tokio::spawn(write_pump(conn.clone(), outbound, sink, ctx.clone()));
    let read = tokio::spawn(read_pump(conn, source, ctx));
    Some(PumpHandles { write, read })
}

/// Drain the outbound queue to the transport until cancelled, the queue
/// closes, or a write fails.
#[instrument(skip_all, fields(connection_id = %conn.id()))]
pub async fn write_pump<K: FrameSink>(
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Bytes>,
    mut sink: K,
    ctx: Arc<PumpContext>,
) -> PumpExit {
    let exit = write_loop(&conn, &mut outbound, &mut sink, ctx.keepalive_interval).await;
    finish(&conn, &ctx, "write", exit).await
}

async fn write_loop<K: FrameSink>(
    conn: &Connection,
    outbound: &mut mpsc::Receiver<Bytes>,
    sink: &mut K,
    keepalive_interval: Duration,
) -> PumpExit {
    let mut keepalive = time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = keepalive.tick().await;

    loop {
        tokio::select! {
            biased;
            () = conn.cancelled() => {
                let _ = time::timeout(CLOSE_GRACE, sink.send_frame(OutboundFrame::Close)).await;
                return PumpExit::Cancelled;
            }
            frame = outbound.recv() => match frame {
                Some(payload) => {
                    if let Err(e) = sink.send_frame(OutboundFrame::Data(payload)).await {
                        return PumpExit::WriteFailed(e);
                    }
                }
                None => {
                    let _ = time::timeout(CLOSE_GRACE, sink.send_frame(OutboundFrame::Close)).await;
                    return PumpExit::QueueClosed;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = sink.send_frame(OutboundFrame::Ping).await {
                    return PumpExit::WriteFailed(e);
                }
            }
        }
    }
}

/// Decode frames and dispatch them to the handlers, one frame at a time.
#[instrument(skip_all, fields(connection_id = %conn.id()))]
pub async fn read_pump<S: FrameSource>(
    conn: Arc<Connection>,
    source: S,
    ctx: Arc<PumpContext>,
) -> PumpExit {
    let (relay_tx, mut relay_rx) = mpsc::channel(1);
    let decoder = tokio::spawn(decode_loop(source, relay_tx));

    let exit = loop {
        let next = tokio::select! {
            biased;
            () = conn.cancelled() => break PumpExit::Cancelled,
            next = relay_rx.recv() => next,
            () = peer_silent(&conn, ctx.pong_timeout) => {
                break PumpExit::DecodeFailed(TransportError::abnormal("pong timeout"));
            }
        };
        match next {
            Some(Ok(InboundFrame::Pong)) => conn.mark_alive(),
            Some(Ok(InboundFrame::Data(payload))) => {
                conn.mark_alive();
                dispatch(&conn, &ctx.handlers, payload).await;
            }
            Some(Err(e)) => break PumpExit::DecodeFailed(e),
            None => break PumpExit::DecodeFailed(TransportError::abnormal("decoder stopped")),
        }
    };

    decoder.abort();
    finish(&conn, &ctx, "read", exit).await
}

/// Resolves once the peer has been silent for `timeout`; never without one.
async fn peer_silent(conn: &Connection, timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => time::sleep_until(conn.last_seen() + timeout).await,
        None => std::future::pending().await,
    }
}

async fn decode_loop<S: FrameSource>(
    mut source: S,
    relay: mpsc::Sender<Result<InboundFrame, TransportError>>,
) {
    loop {
        let frame = source.next_frame().await;
        let failed = frame.is_err();
        if relay.send(frame).await.is_err() || failed {
            return;
        }
    }
}

async fn dispatch(conn: &Arc<Connection>, handlers: &[Arc<dyn MessageHandler>], payload: Bytes) {
    let _ = futures::future::join_all(handlers.iter().map(|h| h.handle(conn, payload.clone()))).await;
}

async fn finish(
    conn: &Arc<Connection>,
    ctx: &PumpContext,
    pump: &'static str,
    exit: PumpExit,
) -> PumpExit {
    match &exit {
        PumpExit::DecodeFailed(e) if e.is_expected_closure() => {
            debug!(pump, error = %e, "peer closed connection");
        }
        PumpExit::DecodeFailed(e) | PumpExit::WriteFailed(e) => {
            warn!(pump, error = %e, "connection failed");
        }
        PumpExit::Cancelled | PumpExit::QueueClosed => debug!(pump, %exit, "pump stopped"),
    }
    conn.cancel();
    ctx.hooks.on_torn_down(conn, &exit).await;
    conn.pump_exited();
    exit
}
