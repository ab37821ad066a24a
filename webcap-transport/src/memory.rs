//! In-memory transport pair, used by tests and the HTTP batch server glue.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};

/// Two connected in-memory transports; frames written to one side arrive on
/// the other in order.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl RpcTransport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(MemorySink { tx: Some(self.tx) }),
            Box::new(MemoryStream { rx: self.rx }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the peer's stream.
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (a, b) = memory_pair();
        let (mut a_sink, _) = Box::new(a).split();
        let (_, mut b_stream) = Box::new(b).split();

        a_sink.send(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&b_stream.recv().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&b_stream.recv().await.unwrap().unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn close_ends_peer_stream() {
        let (a, b) = memory_pair();
        let (mut a_sink, _) = Box::new(a).split();
        let (_, mut b_stream) = Box::new(b).split();

        a_sink.close().await.unwrap();
        assert!(b_stream.recv().await.unwrap().is_none());
    }
}
