//! Frame transport seam between the pumps and the socket library.
//!
//! The pumps only see [`FrameSink`] and [`FrameSource`]. The axum adapter
//! lives in [`super::axum_ws`]; [`memory`] provides a channel-backed pair for
//! tests.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (page navigation, server restart).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// A frame handed to the transport by the write pump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Application payload.
    Data(Bytes),
    /// Keepalive probe.
    Ping,
    /// Close handshake.
    Close,
}

/// A frame decoded by the transport for the read pump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application payload.
    Data(Bytes),
    /// Reply to a keepalive probe.
    Pong,
}

/// Transport-level failure on either direction.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the connection (or it dropped, code 1006).
    #[error("connection closed with code {code}: {reason}")]
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// The underlying socket failed.
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Closure without a close frame.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::Closed {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
        }
    }

    /// Whether this is an ordinary goodbye rather than a failure.
    pub fn is_expected_closure(&self) -> bool {
        matches!(
            self,
            Self::Closed { code, .. }
                if matches!(*code, CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_NO_STATUS)
        )
    }
}

/// Write half of a connection. Only the write pump calls it.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame.
    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;
}

/// Read half of a connection. Only the read pump's decode task calls it.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Block until the next frame arrives or the transport fails.
    async fn next_frame(&mut self) -> Result<InboundFrame, TransportError>;
}

/// Channel-backed transport.
pub mod memory {
    use tokio::sync::mpsc;

    use super::{
        async_trait, Bytes, FrameSink, FrameSource, InboundFrame, OutboundFrame, TransportError,
    };

    /// Build a connected transport and the test peer that drives it.
    pub fn pair() -> (MemorySink, MemorySource, MemoryPeer) {
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        (
            MemorySink { written: written_tx },
            MemorySource { inbound: inject_rx },
            MemoryPeer {
                written: written_rx,
                inject: inject_tx,
            },
        )
    }

    /// Write half; fails once the peer drops its receiver.
    #[derive(Debug)]
    pub struct MemorySink {
        written: mpsc::UnboundedSender<OutboundFrame>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
            self.written
                .send(frame)
                .map_err(|_| TransportError::Io("peer receiver dropped".into()))
        }
    }

    /// Read half; reports an abnormal closure once the peer goes away.
    #[derive(Debug)]
    pub struct MemorySource {
        inbound: mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Result<InboundFrame, TransportError> {
            match self.inbound.recv().await {
                Some(frame) => frame,
                None => Err(TransportError::abnormal("peer went away")),
            }
        }
    }

    /// The far end: observes written frames and injects inbound ones.
    #[derive(Debug)]
    pub struct MemoryPeer {
        /// Frames the write pump put on the wire, in order.
        pub written: mpsc::UnboundedReceiver<OutboundFrame>,
        inject: mpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
    }

    impl MemoryPeer {
        /// Deliver an application frame to the read side.
        pub fn send(&self, payload: impl Into<Bytes>) -> bool {
            self.inject
                .send(Ok(InboundFrame::Data(payload.into())))
                .is_ok()
        }

        /// Deliver a pong.
        pub fn pong(&self) -> bool {
            self.inject.send(Ok(InboundFrame::Pong)).is_ok()
        }

        /// Close from the peer side with the given code.
        pub fn close(&self, code: u16) -> bool {
            self.inject
                .send(Err(TransportError::Closed {
                    code,
                    reason: String::new(),
                }))
                .is_ok()
        }

        /// Make the read side fail with an I/O error.
        pub fn fail(&self, reason: &str) -> bool {
            self.inject
                .send(Err(TransportError::Io(reason.to_string())))
                .is_ok()
        }

        /// Next frame written by the pump, or `None` once the sink is gone.
        pub async fn next_written(&mut self) -> Option<OutboundFrame> {
            self.written.recv().await
        }
    }
}
