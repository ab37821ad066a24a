//! Client for webcap sessions.
//!
//! Thin bootstrap over the core session: pick a transport from the endpoint
//! URL, expose the peer's root capability, and hand out pipelined batches.

pub mod client;

pub use client::{Client, ClientConfig};
pub use webcap_core::{path, Batch, RpcError, RpcPromise, RpcTarget, Stub, Value};
