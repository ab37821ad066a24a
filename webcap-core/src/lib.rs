//! webcap-core: session kernel for the Cap'n Web RPC protocol.
//!
//! Two symmetric peers exchange references to live objects, invoke methods
//! on them, chain dependent calls into a single round trip, and dispose of
//! references through explicit refcounting. This crate is the kernel:
//! import/export tables, the hook evaluation graph, the wire codec, the
//! message loop, pipeline batches, and the remap sub-language. Concrete
//! transports live in `webcap-transport`.

pub mod batch;
pub mod error;
pub mod hooks;
pub mod ids;
pub mod parser;
pub mod payload;
pub mod remap;
pub mod resume;
pub mod serializer;
pub mod session;
pub mod stubs;
pub mod tables;
pub mod transport;
pub mod value;
pub mod wire;

pub use batch::Batch;
pub use error::{ErrorCode, RpcError};
pub use ids::{ExportId, IdAllocator, ImportId};
pub use payload::{Payload, Provenance};
pub use remap::RemapBuilder;
pub use resume::{ResumeToken, ResumeTokenManager, SessionSnapshot};
pub use session::{RpcSession, SessionConfig, SessionState};
pub use stubs::{path, RpcPromise, Stub};
pub use transport::{RpcTransport, TransportError};
pub use value::Value;
pub use wire::{
    parse_wire_batch, serialize_wire_batch, PropertyKey, WireExpression, WireMessage,
};

pub use async_trait::async_trait;

/// A user-supplied object callable over RPC.
///
/// Implementations may be invoked concurrently from different sessions; the
/// core imposes no synchronization of its own. Within one session, calls on
/// the same stub are delivered in issue order.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Call a method on this capability. Multi-segment method paths arrive
    /// joined with `.`; invoking the capability itself (no path) arrives as
    /// the empty method name.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Get a property from this capability.
    async fn get_property(&self, property: &str) -> Result<Value, RpcError>;
}
