//! The stateless HTTP batch executor.
//!
//! Each request spins up a full session over an in-memory transport, feeds
//! it the request frames, and collects outbound frames until every pull in
//! the request has been answered (or the session aborts, or the deadline
//! passes). Pushes are numbered sequentially by the session itself, so the
//! body is exactly a client's wire transcript.

use crate::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use webcap_core::transport::RpcTransport;
use webcap_core::wire::{parse_wire_batch, WireMessage};
use webcap_core::RpcSession;
use webcap_transport::memory_pair;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("malformed batch: {0}")]
    Malformed(String),
    #[error("batch of {0} messages exceeds maximum {1}")]
    TooLarge(usize, usize),
}

impl IntoResponse for BatchError {
    fn into_response(self) -> Response {
        let error = WireMessage::Abort(webcap_core::wire::WireExpression::Error {
            error_type: "bad_request".to_string(),
            message: self.to_string(),
            stack: None,
            data: None,
        });
        (
            StatusCode::BAD_REQUEST,
            [("content-type", "application/x-ndjson")],
            error.to_line(),
        )
            .into_response()
    }
}

pub(crate) async fn run_batch(
    state: &AppState,
    body: &str,
) -> Result<Option<String>, BatchError> {
    let messages = parse_wire_batch(body).map_err(|e| BatchError::Malformed(e.message))?;
    if messages.len() > state.config.max_batch_size {
        return Err(BatchError::TooLarge(
            messages.len(),
            state.config.max_batch_size,
        ));
    }

    // Pulls are answered exactly once each; that is our completion signal.
    let expected: HashSet<i64> = messages
        .iter()
        .filter_map(|msg| match msg {
            WireMessage::Pull(id) => Some(*id),
            _ => None,
        })
        .collect();

    let (client_side, server_side) = memory_pair();
    let session = RpcSession::with_config(
        Box::new(server_side),
        Some(state.root.clone()),
        state.config.session_config(),
    );
    let (mut sink, mut stream) = (Box::new(client_side) as Box<dyn RpcTransport>).split();

    for msg in &messages {
        if sink.send(Bytes::from(msg.to_line())).await.is_err() {
            break;
        }
    }

    let mut responses: Vec<String> = Vec::new();
    let mut remaining = expected.len();
    let deadline = tokio::time::Instant::now() + state.config.batch_timeout;

    while remaining > 0 {
        let frame = match tokio::time::timeout_at(deadline, stream.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(_) => break,
            Err(_) => {
                warn!("batch timed out with {} pulls unanswered", remaining);
                break;
            }
        };
        let line = String::from_utf8_lossy(&frame).into_owned();
        let parsed = WireMessage::parse_line(&line);
        let aborted = matches!(parsed, Ok(WireMessage::Abort(_)) | Err(_));
        if let Ok(WireMessage::Resolve(id, _) | WireMessage::Reject(id, _)) = &parsed {
            if expected.contains(id) {
                remaining -= 1;
            }
        }
        responses.push(line);
        if aborted {
            break;
        }
    }

    let _ = sink.close().await;
    session.shutdown().await;

    debug!(
        requests = messages.len(),
        responses = responses.len(),
        "batch complete"
    );
    if responses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(responses.join("\n")))
    }
}

/// Convenience for tests and embedding: run one batch body against a root
/// capability without the HTTP layer.
pub async fn execute_batch(
    root: Arc<dyn webcap_core::RpcTarget>,
    config: &crate::ServerConfig,
    body: &str,
) -> Result<Option<String>, BatchError> {
    let state = AppState {
        config: Arc::new(config.clone()),
        root,
    };
    run_batch(&state, body).await
}
