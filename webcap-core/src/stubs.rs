//! Application-facing stub and promise handles.
//!
//! These are thin refcounted wrappers over [`StubHook`]s exposing the
//! explicit API surface: `call(path, args)`, `get(path)`, `dup`, `dispose`,
//! and awaiting. Property-access sugar belongs to language bindings, not the
//! core.

use crate::error::RpcError;
use crate::hooks::{StubHook, TargetHook};
use crate::payload::Payload;
use crate::value::Value;
use crate::wire::PropertyKey;
use crate::RpcTarget;
use std::sync::Arc;

/// Build a property path from anything key-like: `path(["user", "id"])`.
pub fn path<I>(keys: I) -> Vec<PropertyKey>
where
    I: IntoIterator,
    I::Item: Into<PropertyKey>,
{
    keys.into_iter().map(Into::into).collect()
}

/// A handle to a (possibly remote) capability.
#[derive(Debug)]
pub struct Stub {
    hook: Arc<dyn StubHook>,
}

impl Stub {
    /// Wrap a hook whose refcount is already held by the caller.
    pub(crate) fn adopt(hook: Arc<dyn StubHook>) -> Self {
        Stub { hook }
    }

    /// Expose a local target object as a capability.
    pub fn from_target(target: Arc<dyn RpcTarget>) -> Self {
        Stub::adopt(TargetHook::new(target))
    }

    pub(crate) fn hook(&self) -> &Arc<dyn StubHook> {
        &self.hook
    }

    pub(crate) fn into_hook(self) -> Arc<dyn StubHook> {
        self.hook
    }

    pub(crate) fn same_hook(&self, other: &Arc<dyn StubHook>) -> bool {
        Arc::ptr_eq(&self.hook, other)
    }

    /// Invoke the method at `path` with `args`, returning a promise for the
    /// result. On remote stubs this pipelines without waiting.
    pub fn call(&self, path: Vec<PropertyKey>, args: Vec<Value>) -> RpcPromise {
        let args = Payload::from_app_params(Value::Array(args));
        RpcPromise::adopt(self.hook.clone().call(path, args))
    }

    /// Navigate to a property, returning a new stub. On remote stubs this is
    /// pure pipelined navigation and sends nothing.
    pub fn get(&self, path: Vec<PropertyKey>) -> Stub {
        Stub::adopt(self.hook.clone().get(path))
    }

    /// Take an additional reference to the same capability.
    pub fn dup(&self) -> Stub {
        Stub::adopt(self.hook.clone().dup())
    }

    /// Release this handle's reference.
    pub fn dispose(self) {
        self.hook.dispose();
    }

    /// Resolve the capability to a value.
    pub async fn await_value(&self) -> Result<Value, RpcError> {
        let payload = self.hook.clone().pull().await?;
        resolve_nested_promises(payload.into_value()).await
    }
}

impl Clone for Stub {
    fn clone(&self) -> Self {
        self.dup()
    }
}

/// A stub whose resolution is awaited before delivery to the application.
#[derive(Debug)]
pub struct RpcPromise {
    hook: Arc<dyn StubHook>,
}

impl RpcPromise {
    pub(crate) fn adopt(hook: Arc<dyn StubHook>) -> Self {
        RpcPromise { hook }
    }

    pub(crate) fn hook(&self) -> &Arc<dyn StubHook> {
        &self.hook
    }

    pub(crate) fn same_hook(&self, other: &Arc<dyn StubHook>) -> bool {
        Arc::ptr_eq(&self.hook, other)
    }

    /// Chain a call onto the eventual resolution.
    pub fn call(&self, path: Vec<PropertyKey>, args: Vec<Value>) -> RpcPromise {
        let args = Payload::from_app_params(Value::Array(args));
        RpcPromise::adopt(self.hook.clone().call(path, args))
    }

    /// Chain property navigation onto the eventual resolution.
    pub fn get(&self, path: Vec<PropertyKey>) -> RpcPromise {
        RpcPromise::adopt(self.hook.clone().get(path))
    }

    pub fn dup(&self) -> RpcPromise {
        RpcPromise::adopt(self.hook.clone().dup())
    }

    pub fn dispose(self) {
        self.hook.dispose();
    }

    /// Treat the promise as a stub without awaiting it.
    pub fn into_stub(self) -> Stub {
        Stub::adopt(self.hook)
    }

    /// Await the final value (or structured error).
    pub async fn await_value(&self) -> Result<Value, RpcError> {
        let payload = self.hook.clone().pull().await?;
        resolve_nested_promises(payload.into_value()).await
    }
}

impl Clone for RpcPromise {
    fn clone(&self) -> Self {
        self.dup()
    }
}

/// Await every promise embedded in a value tree before the value reaches the
/// application.
pub(crate) async fn resolve_nested_promises(value: Value) -> Result<Value, RpcError> {
    fn resolve(
        value: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, RpcError>> + Send>> {
        Box::pin(async move {
            match value {
                Value::Promise(promise) => {
                    let payload = promise.hook().clone().pull().await?;
                    resolve(payload.into_value()).await
                }
                Value::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(resolve(item).await?);
                    }
                    Ok(Value::Array(resolved))
                }
                Value::Object(map) => {
                    let mut resolved = std::collections::HashMap::with_capacity(map.len());
                    for (key, item) in map {
                        resolved.insert(key, Box::new(resolve(*item).await?));
                    }
                    Ok(Value::Object(resolved))
                }
                other => Ok(other),
            }
        })
    }
    resolve(value).await
}
