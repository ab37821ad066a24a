//! Transport adapters for webcap sessions.
//!
//! Everything here implements `webcap_core::transport::RpcTransport`: an
//! NDJSON codec over any byte stream, an in-memory pair for tests, a
//! WebSocket adapter, and an HTTP batch adapter.

pub mod codec;
pub mod http_batch;
pub mod memory;
pub mod websocket;

pub use codec::{FramedTransport, NdjsonCodec};
pub use http_batch::HttpBatchTransport;
pub use memory::{memory_pair, MemoryTransport};
pub use websocket::WebSocketTransport;

pub use webcap_core::transport::{FrameSink, FrameStream, RpcTransport, TransportError};
