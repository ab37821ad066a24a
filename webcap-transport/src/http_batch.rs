//! HTTP batch transport (client side).
//!
//! Outbound frames accumulate until the session flushes a write burst; the
//! whole burst then travels as one `POST` of newline-delimited JSON, and the
//! response lines feed the inbound stream. Each request is its own
//! micro-session on the server, so this adapter suits one-shot batches, not
//! long-lived bidirectional sessions.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};

pub struct HttpBatchTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpBatchTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Default)]
struct Shared {
    incoming: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl RpcTransport for HttpBatchTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let shared = Arc::new(Shared::default());
        (
            Box::new(HttpBatchSink {
                endpoint: self.endpoint,
                client: self.client,
                outgoing: Vec::new(),
                shared: shared.clone(),
            }),
            Box::new(HttpBatchStream { shared }),
        )
    }
}

struct HttpBatchSink {
    endpoint: String,
    client: reqwest::Client,
    outgoing: Vec<Bytes>,
    shared: Arc<Shared>,
}

impl HttpBatchSink {
    /// POST whatever has accumulated and queue the response lines.
    async fn submit(&mut self) -> Result<(), TransportError> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        let frames: Vec<Bytes> = self.outgoing.drain(..).collect();
        let body = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        debug!(endpoint = %self.endpoint, frames = frames.len(), "posting batch");

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Protocol(format!("batch request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Protocol(format!("batch response read failed: {}", e)))?;
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "batch request returned {}: {}",
                status, text
            )));
        }

        let mut incoming = self.shared.incoming.lock().expect("queue lock poisoned");
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            trace!(line, "batch response line");
            incoming.push_back(Bytes::from(line.to_string()));
        }
        drop(incoming);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl FrameSink for HttpBatchSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.outgoing.push(frame);
        Ok(())
    }

    /// Each POST is its own micro-session on the server, so frames keep
    /// accumulating until the burst contains a message that can produce a
    /// response (a pull or an abort); posting a bare push would strand its
    /// state on a dead micro-session.
    async fn flush(&mut self) -> Result<(), TransportError> {
        let complete = self
            .outgoing
            .iter()
            .any(|f| f.starts_with(b"[\"pull\"") || f.starts_with(b"[\"abort\""));
        if !complete {
            return Ok(());
        }
        self.submit().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.submit().await;
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct HttpBatchStream {
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameStream for HttpBatchStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(frame) = self
                .shared
                .incoming
                .lock()
                .expect("queue lock poisoned")
                .pop_front()
            {
                return Ok(Some(frame));
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            notified.await;
        }
    }
}
