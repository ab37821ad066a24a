use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::debug;
use webcap_core::transport::RpcTransport;
use webcap_core::{
    Batch, PropertyKey, RpcSession, RpcTarget, SessionConfig, Stub, Value,
};
use webcap_transport::{HttpBatchTransport, WebSocketTransport};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint URL: `http(s)://.../rpc/batch` or `ws(s)://.../rpc/ws`.
    pub url: String,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: SessionConfig::default(),
        }
    }
}

/// A connected client session.
pub struct Client {
    session: RpcSession,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect using the transport implied by the URL scheme.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(ClientConfig::new(url), None).await
    }

    /// Connect while also exposing a local root capability to the server
    /// (bidirectional RPC; meaningful on WebSocket transports).
    pub async fn connect_with(
        config: ClientConfig,
        root: Option<Arc<dyn RpcTarget>>,
    ) -> Result<Self> {
        let transport: Box<dyn RpcTransport> = if config.url.starts_with("ws://")
            || config.url.starts_with("wss://")
        {
            Box::new(
                WebSocketTransport::connect(&config.url)
                    .await
                    .with_context(|| format!("connecting websocket to {}", config.url))?,
            )
        } else if config.url.starts_with("http://") || config.url.starts_with("https://") {
            Box::new(HttpBatchTransport::new(config.url.clone()))
        } else {
            bail!("unsupported URL scheme: {}", config.url);
        };

        debug!(url = %config.url, "client connected");
        Ok(Self::over(transport, root, config.session))
    }

    /// Attach to an already-built transport.
    pub fn over(
        transport: Box<dyn RpcTransport>,
        root: Option<Arc<dyn RpcTarget>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            session: RpcSession::with_config(transport, root, config),
        }
    }

    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    /// A stub on the server's root capability.
    pub fn root(&self) -> Stub {
        self.session.root_stub()
    }

    /// One pipelined call on the root, awaited to its value.
    pub async fn call(&self, path: Vec<PropertyKey>, args: Vec<Value>) -> Result<Value> {
        let root = self.root();
        let promise = root.call(path, args);
        let outcome = promise.await_value().await;
        promise.dispose();
        root.dispose();
        Ok(outcome?)
    }

    /// Start a pipelined batch; dependent calls flush as one write.
    pub fn batch(&self) -> Batch {
        Batch::new(&self.session)
    }

    /// Graceful shutdown.
    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }
}
