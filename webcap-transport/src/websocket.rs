//! WebSocket transport: one text message per NDJSON frame, long-lived
//! bidirectional sessions.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};

pub struct WebSocketTransport<S> {
    inner: WebSocketStream<S>,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Connect a client socket to `ws://...` or `wss://...`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (inner, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket connect failed: {}", e)))?;
        debug!(url, status = %response.status(), "websocket connected");
        Ok(Self { inner })
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an accepted server-side socket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

impl<S> RpcTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.inner.split();
        (
            Box::new(WsSink { inner: sink }),
            Box::new(WsStream { inner: stream }),
        )
    }
}

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|_| TransportError::Codec("frame is not valid UTF-8".into()))?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(ws_error)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        SinkExt::flush(&mut self.inner).await.map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.inner.send(Message::Close(None)).await;
        SinkExt::close(&mut self.inner).await.map_err(ws_error)
    }
}

struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                // Control frames are handled by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    match e {
        tokio_tungstenite::tungstenite::Error::ConnectionClosed
        | tokio_tungstenite::tungstenite::Error::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Protocol(format!("websocket error: {}", other)),
    }
}
