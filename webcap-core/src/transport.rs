//! The transport capability the session kernel depends on.
//!
//! A transport is a pair of ordered, reliable streams of NDJSON frames: a
//! sink for outbound frames and a stream of inbound ones. One frame is one
//! JSON message without the trailing newline; framing itself (the newline
//! delimiter, maximum sizes) belongs to the adapter. Loss or reordering
//! inside a transport is treated as an abort condition by the session.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Send a burst of frames. Adapters that can coalesce a burst into one
    /// write override this; the default just loops.
    async fn send_batch(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Mark the end of a write burst. Request/response adapters submit the
    /// accumulated request here; streaming adapters ignore it.
    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the transport.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame, or `None` on orderly end of stream.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// A connected transport, split into its two halves when a session attaches.
pub trait RpcTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}
