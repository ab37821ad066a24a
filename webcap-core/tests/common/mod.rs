//! Shared fixtures: an in-memory frame transport and a raw peer end for
//! wire-level assertions.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};
use webcap_core::{RpcError, RpcTarget, Value};

pub struct TestTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Two connected in-memory transports.
pub fn pair() -> (TestTransport, TestTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        TestTransport { tx: a_tx, rx: b_rx },
        TestTransport { tx: b_tx, rx: a_rx },
    )
}

/// One transport plus a raw handle on the peer side, for speaking literal
/// NDJSON lines.
pub fn transport_with_raw_peer() -> (TestTransport, RawPeer) {
    let (ours, theirs) = pair();
    (
        ours,
        RawPeer {
            tx: theirs.tx,
            rx: theirs.rx,
        },
    )
}

impl RpcTransport for TestTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(TestSink { tx: Some(self.tx) }),
            Box::new(TestStream { rx: self.rx }),
        )
    }
}

struct TestSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl FrameSink for TestSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct TestStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameStream for TestStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

pub struct RawPeer {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl RawPeer {
    pub fn send_line(&self, line: &str) {
        self.tx
            .send(Bytes::from(line.to_string()))
            .expect("peer session is alive");
    }

    pub async fn recv_line(&mut self) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("peer closed the transport");
        String::from_utf8(frame.to_vec()).expect("frames are UTF-8")
    }

    pub async fn recv_json(&mut self) -> serde_json::Value {
        serde_json::from_str(&self.recv_line().await).expect("frames are JSON")
    }

    pub fn close(self) {
        drop(self.tx);
    }
}

/// Calculator root used by most scenarios. `add`/`subtract`/`divide`, an
/// `authenticate` returning a user record, profile lookups keyed by user id,
/// a `numbers` property, and `transform` which invokes a callback capability
/// passed as an argument.
#[derive(Debug)]
pub struct TestService;

#[async_trait]
impl RpcTarget for TestService {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "add" => {
                let a = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RpcError::bad_request("add requires numbers"))?;
                let b = args
                    .get(1)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RpcError::bad_request("add requires numbers"))?;
                Ok(Value::int(a + b))
            }

            "divide" => {
                let dividend = args.first().and_then(Value::as_i64).unwrap_or(0);
                let divisor = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                if divisor == 0 {
                    return Err(RpcError::with_data(
                        webcap_core::ErrorCode::BadRequest,
                        "Division by zero",
                        serde_json::json!({"divisor": 0}),
                    ));
                }
                Ok(Value::int(dividend / divisor))
            }

            "authenticate" => {
                let cookie = args.first().and_then(Value::as_str).unwrap_or_default();
                if cookie != "cookie-123" {
                    return Err(RpcError::permission_denied("bad cookie"));
                }
                Ok(Value::object([
                    ("id".to_string(), Value::from("u_1")),
                    ("name".to_string(), Value::from("Ada")),
                ]))
            }

            "getUserProfile" => {
                let id = args.first().and_then(Value::as_str).unwrap_or_default();
                if id != "u_1" {
                    return Err(RpcError::not_found(format!("no profile for {:?}", id)));
                }
                Ok(Value::object([(
                    "bio".to_string(),
                    Value::from("Countess of Lovelace"),
                )]))
            }

            "getNotifications" => {
                let id = args.first().and_then(Value::as_str).unwrap_or_default();
                if id != "u_1" {
                    return Err(RpcError::not_found(format!("no notifications for {:?}", id)));
                }
                Ok(Value::Array(vec![Value::from("welcome!")]))
            }

            "transform" => {
                // Applies a callback capability to a number.
                let Some(Value::Stub(callback)) = args.first() else {
                    return Err(RpcError::bad_request("transform requires a callback"));
                };
                let n = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                let result = callback.call(Vec::new(), vec![Value::int(n)]);
                let value = result.await_value().await?;
                result.dispose();
                Ok(value)
            }

            _ => Err(RpcError::not_found(format!("no method {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "numbers" => Ok(Value::Array(vec![
                Value::int(1),
                Value::int(2),
                Value::int(3),
            ])),
            "version" => Ok(Value::from("test-service/1")),
            _ => Err(RpcError::not_found(format!("no property {}", property))),
        }
    }
}

pub fn service() -> Arc<dyn RpcTarget> {
    Arc::new(TestService)
}
