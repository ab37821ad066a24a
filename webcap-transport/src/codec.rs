//! NDJSON framing over arbitrary byte streams.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};

/// One UTF-8 JSON value per `\n`-terminated line.
pub struct NdjsonCodec {
    max_frame_size: usize,
}

impl NdjsonCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: 1 << 20,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_frame_size {
                return Err(TransportError::Codec(format!(
                    "frame exceeds {} bytes without newline",
                    self.max_frame_size
                )));
            }
            return Ok(None);
        };

        if newline > self.max_frame_size {
            return Err(TransportError::Codec(format!(
                "frame of {} bytes exceeds maximum {}",
                newline, self.max_frame_size
            )));
        }

        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        // Tolerate \r\n peers.
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.is_empty() {
            return self.decode(src);
        }
        Ok(Some(line.freeze()))
    }
}

impl Encoder<Bytes> for NdjsonCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::Codec(format!(
                "frame of {} bytes exceeds maximum {}",
                frame.len(),
                self.max_frame_size
            )));
        }
        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// NDJSON transport over any `AsyncRead + AsyncWrite` byte stream (TCP,
/// Unix sockets, `tokio::io::duplex`, ...).
pub struct FramedTransport<T> {
    io: T,
    max_frame_size: usize,
}

impl<T> FramedTransport<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            max_frame_size: 1 << 20,
        }
    }

    pub fn with_max_frame_size(io: T, max_frame_size: usize) -> Self {
        Self { io, max_frame_size }
    }
}

impl<T> RpcTransport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (read, write) = tokio::io::split(self.io);
        let sink = FramedByteSink {
            inner: FramedWrite::new(write, NdjsonCodec::with_max_frame_size(self.max_frame_size)),
        };
        let stream = FramedByteStream {
            inner: FramedRead::new(read, NdjsonCodec::with_max_frame_size(self.max_frame_size)),
        };
        (Box::new(sink), Box::new(stream))
    }
}

struct FramedByteSink<W> {
    inner: FramedWrite<WriteHalf<W>, NdjsonCodec>,
}

#[async_trait]
impl<W> FrameSink for FramedByteSink<W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send(frame).await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        SinkExt::flush(&mut self.inner).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(&mut self.inner).await
    }
}

struct FramedByteStream<R> {
    inner: FramedRead<ReadHalf<R>, NdjsonCodec>,
}

#[async_trait]
impl<R> FrameStream for FramedByteStream<R>
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.inner.next().await.transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_line_by_line() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::from(&b"[\"pull\",1]\n[\"pull\",2]\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"[\"pull\",1]"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"[\"pull\",2]"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::from(&b"[1]\r\n\n[2]\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"[1]"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"[2]"[..]);
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = NdjsonCodec::with_max_frame_size(4);
        let mut buf = BytesMut::from(&b"[1,2,3,4]\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"[\"pull\",1]"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"[\"pull\",1]\n");
    }

    #[tokio::test]
    async fn framed_transport_round_trips_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut sink, _) = Box::new(FramedTransport::new(a)).split();
        let (_, mut stream) = Box::new(FramedTransport::new(b)).split();

        sink.send(Bytes::from_static(b"[\"pull\",1]")).await.unwrap();
        sink.flush().await.unwrap();
        let frame = stream.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"[\"pull\",1]");
    }
}
