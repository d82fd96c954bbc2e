//! [`FrameSink`] / [`FrameSource`] over axum's `WebSocket`.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::trace;

use super::transport::{
    CLOSE_NO_STATUS, CLOSE_NORMAL, FrameSink, FrameSource, InboundFrame, OutboundFrame,
    TransportError,
};

/// Split an upgraded socket into pump-facing halves.
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (tx, rx) = socket.split();
    (WsSink { inner: tx }, WsSource { inner: rx })
}

/// Write half of an axum `WebSocket`.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let msg = match frame {
            // Payloads are JSON; anything else goes out as binary
            OutboundFrame::Data(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => Message::Binary(bytes),
            },
            OutboundFrame::Ping => Message::Ping(Bytes::new()),
            OutboundFrame::Close => Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: Utf8Bytes::from_static(""),
            })),
        };
        self.inner
            .send(msg)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Read half of an axum `WebSocket`.
pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Result<InboundFrame, TransportError> {
        loop {
            let msg = match self.inner.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Err(TransportError::abnormal("stream ended")),
            };
            match msg {
                Message::Text(text) => {
                    return Ok(InboundFrame::Data(Bytes::copy_from_slice(
                        text.as_str().as_bytes(),
                    )));
                }
                Message::Binary(data) => return Ok(InboundFrame::Data(data)),
                Message::Pong(_) => return Ok(InboundFrame::Pong),
                // axum answers pings itself
                Message::Ping(_) => trace!("ping from peer"),
                Message::Close(frame) => {
                    let (code, reason) = frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                        (f.code, f.reason.as_str().to_owned())
                    });
                    return Err(TransportError::Closed { code, reason });
                }
            }
        }
    }
}
