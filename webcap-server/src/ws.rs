//! Bidirectional WebSocket sessions over axum's upgrade.

use crate::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};
use webcap_core::RpcSession;

pub(crate) async fn handle_upgrade(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    info!("websocket session opened");
    let transport = AxumWsTransport::new(socket);
    let session = RpcSession::with_config(
        Box::new(transport),
        Some(state.root.clone()),
        state.config.session_config(),
    );
    session.closed().await;
    debug!("websocket session ended");
}

/// Adapter from axum's WebSocket to the session transport contract.
pub struct AxumWsTransport {
    socket: WebSocket,
}

impl AxumWsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl RpcTransport for AxumWsTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(AxumWsSink { inner: sink }),
            Box::new(AxumWsStream { inner: stream }),
        )
    }
}

struct AxumWsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumWsSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|_| TransportError::Codec("frame is not valid UTF-8".into()))?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket send failed: {}", e)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = SinkExt::close(&mut self.inner).await;
        Ok(())
    }
}

struct AxumWsStream {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for AxumWsStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => {
                    return Err(TransportError::Protocol(format!(
                        "websocket receive failed: {}",
                        e
                    )))
                }
            }
        }
    }
}
