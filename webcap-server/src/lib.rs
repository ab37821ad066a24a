//! HTTP server glue for webcap sessions.
//!
//! Two endpoints, as in the protocol's reference deployments:
//! - `POST /rpc/batch`: stateless HTTP batch; each request is a
//!   micro-session that lives exactly as long as its pulls.
//! - `GET /rpc/ws`: a long-lived bidirectional WebSocket session; the
//!   server can call capabilities the client exports.

pub mod batch;
pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use webcap_core::{RpcTarget, SessionConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_batch_size: usize,
    /// Include error stacks on the wire. Development only.
    pub include_stack_traces: bool,
    /// How long a batch request may wait for its pulls to settle.
    pub batch_timeout: std::time::Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_batch_size: 100,
            include_stack_traces: false,
            batch_timeout: std::time::Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_batch_size: self.max_batch_size,
            include_stack_traces: self.include_stack_traces,
            ..SessionConfig::default()
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) root: Arc<dyn RpcTarget>,
}

/// A webcap server exposing one root capability.
pub struct Server {
    config: ServerConfig,
    root: Arc<dyn RpcTarget>,
}

impl Server {
    pub fn new(config: ServerConfig, root: Arc<dyn RpcTarget>) -> Self {
        Self { config, root }
    }

    /// The axum router, for embedding into a larger application.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::new(self.config.clone()),
            root: self.root.clone(),
        };
        Router::new()
            .route("/rpc/batch", post(handle_batch))
            .route("/rpc/ws", get(ws::handle_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "webcap server listening");
        axum::serve(listener, self.router()).await
    }
}

async fn handle_batch(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match batch::run_batch(&state, &body).await {
        Ok(Some(responses)) => (
            StatusCode::OK,
            [("content-type", "application/x-ndjson")],
            responses,
        )
            .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
