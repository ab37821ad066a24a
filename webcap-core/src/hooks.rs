//! The hook hierarchy backing stubs and promises.
//!
//! A hook is the internal implementation of a capability reference. Five
//! variants cover the whole evaluation graph: errors, locally-resolved
//! payloads, local target objects, remote imports, and promises chaining to
//! another hook. Stubs and promises are refcounted handles onto hooks.

use crate::error::RpcError;
use crate::ids::ImportId;
use crate::payload::Payload;
use crate::session::SessionCore;
use crate::stubs::Stub;
use crate::value::Value;
use crate::wire::PropertyKey;
use crate::RpcTarget;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// Resolution of a promise: the next hook in the chain, or a failure.
pub type HookResult = Result<Arc<dyn StubHook>, RpcError>;

/// Polymorphic capability reference.
///
/// `call` and `get` never block: remote variants enqueue pipelined work and
/// local variants hand work to a per-target worker, so both return a new hook
/// immediately. Only `pull` suspends.
#[async_trait]
pub trait StubHook: Send + Sync + fmt::Debug {
    /// Invoke the callable at `path` with `args`, yielding the result hook.
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, args: Payload) -> Arc<dyn StubHook>;

    /// Navigate to the property at `path`, yielding a hook for it.
    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook>;

    /// Resolve this hook to its final payload, waiting as needed.
    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError>;

    /// Take an additional refcount on the underlying resource.
    fn dup(self: Arc<Self>) -> Arc<dyn StubHook>;

    /// Drop one refcount, releasing the resource at zero.
    fn dispose(self: Arc<Self>);

    /// If this hook is a pipelined reference to a session import, its ID and
    /// pending navigation path. The serializer uses this to pass the
    /// reference back as `["import"|"pipeline", id, path]` instead of
    /// minting a fresh export.
    fn remote_ref(&self) -> Option<RemoteRef> {
        None
    }
}

/// A pipelined reference to an import of a particular session.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    pub(crate) session: std::sync::Weak<SessionCore>,
    pub id: ImportId,
    pub path: Vec<PropertyKey>,
}

fn concat_path(base: &[PropertyKey], rest: Vec<PropertyKey>) -> Vec<PropertyKey> {
    let mut path = base.to_vec();
    path.extend(rest);
    path
}

// ---------------------------------------------------------------------------
// ErrorHook

/// Holds an error; every operation propagates it.
#[derive(Debug)]
pub struct ErrorHook {
    error: RpcError,
}

impl ErrorHook {
    pub fn new(error: RpcError) -> Arc<Self> {
        Arc::new(ErrorHook { error })
    }

    pub fn error(&self) -> &RpcError {
        &self.error
    }
}

#[async_trait]
impl StubHook for ErrorHook {
    fn call(self: Arc<Self>, _path: Vec<PropertyKey>, _args: Payload) -> Arc<dyn StubHook> {
        self
    }

    fn get(self: Arc<Self>, _path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        self
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        Err(self.error.clone())
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        self
    }

    fn dispose(self: Arc<Self>) {}
}

// ---------------------------------------------------------------------------
// PayloadHook

/// Wraps a locally-resolved payload; navigation walks the value tree.
#[derive(Debug)]
pub struct PayloadHook {
    payload: Payload,
    refs: AtomicU32,
}

impl PayloadHook {
    pub fn new(mut payload: Payload) -> Arc<Self> {
        payload.ensure_owned();
        Arc::new(PayloadHook {
            payload,
            refs: AtomicU32::new(1),
        })
    }

    fn navigate(&self, path: &[PropertyKey]) -> Result<Value, RpcError> {
        self.payload
            .value()
            .navigate(path)
            .map(crate::payload::copy_for_share)
    }
}

#[async_trait]
impl StubHook for PayloadHook {
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, args: Payload) -> Arc<dyn StubHook> {
        match self.payload.value().navigate(&path) {
            Ok(Value::Stub(stub)) => stub.hook().clone().dup().call(Vec::new(), args),
            Ok(Value::Promise(promise)) => promise.hook().clone().dup().call(Vec::new(), args),
            Ok(_) => ErrorHook::new(RpcError::bad_request(format!(
                "value at path {:?} is not callable",
                path
            ))),
            Err(err) => ErrorHook::new(err),
        }
    }

    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        match self.navigate(&path) {
            Ok(Value::Stub(stub)) => stub.hook().clone(),
            Ok(Value::Promise(promise)) => promise.hook().clone(),
            Ok(value) => PayloadHook::new(Payload::owned(value)),
            Err(err) => ErrorHook::new(err),
        }
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        Ok(self.payload.clone())
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self
    }

    fn dispose(self: Arc<Self>) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            crate::payload::dispose_tree(self.payload.value());
        }
    }
}

// ---------------------------------------------------------------------------
// TargetHook

enum TargetJob {
    Call {
        method: String,
        args: Vec<Value>,
        resolver: PromiseResolver,
    },
    GetProperty {
        property: String,
        resolver: PromiseResolver,
    },
}

/// Wraps a user-supplied [`RpcTarget`].
///
/// Calls are handed to a per-hook worker task and executed sequentially, so
/// calls against the same stub observe issue order even though the handlers
/// themselves may suspend arbitrarily.
pub struct TargetHook {
    target: Arc<dyn RpcTarget>,
    refs: AtomicU32,
    jobs: OnceLock<mpsc::UnboundedSender<TargetJob>>,
}

impl TargetHook {
    pub fn new(target: Arc<dyn RpcTarget>) -> Arc<Self> {
        Arc::new(TargetHook {
            target,
            refs: AtomicU32::new(1),
            jobs: OnceLock::new(),
        })
    }

    pub fn target(&self) -> &Arc<dyn RpcTarget> {
        &self.target
    }

    fn enqueue(&self, job: TargetJob) {
        let sender = self.jobs.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_target_worker(self.target.clone(), rx));
            tx
        });
        // The worker only exits once every sender is gone.
        let _ = sender.send(job);
    }
}

impl fmt::Debug for TargetHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetHook")
            .field("target", &self.target)
            .field("refs", &self.refs)
            .finish()
    }
}

async fn run_target_worker(
    target: Arc<dyn RpcTarget>,
    mut jobs: mpsc::UnboundedReceiver<TargetJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            TargetJob::Call {
                method,
                args,
                resolver,
            } => {
                trace!(%method, "dispatching target call");
                // Promises in arguments resolve before the application sees
                // them.
                let args = match crate::stubs::resolve_nested_promises(Value::Array(args)).await {
                    Ok(Value::Array(items)) => items,
                    Ok(other) => vec![other],
                    Err(err) => {
                        resolver.reject(err);
                        continue;
                    }
                };
                match target.call(&method, args).await {
                    Ok(value) => {
                        resolver.resolve(PayloadHook::new(Payload::from_app_return(value)))
                    }
                    Err(err) => resolver.reject(err),
                }
            }
            TargetJob::GetProperty { property, resolver } => {
                trace!(%property, "dispatching target property get");
                match target.get_property(&property).await {
                    Ok(value) => {
                        resolver.resolve(PayloadHook::new(Payload::from_app_return(value)))
                    }
                    Err(err) => resolver.reject(err),
                }
            }
        }
    }
}

#[async_trait]
impl StubHook for TargetHook {
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, mut args: Payload) -> Arc<dyn StubHook> {
        // An empty path invokes the capability itself; targets see it as the
        // empty method name.
        let method = path
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(".");

        // Parameters are copied before they cross onto the worker task.
        args.ensure_owned();
        let args = match args.into_value() {
            Value::Array(items) => items,
            other => vec![other],
        };

        let (resolver, promise) = PromiseHook::pair();
        self.enqueue(TargetJob::Call {
            method,
            args,
            resolver,
        });
        promise
    }

    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        let [property] = path.as_slice() else {
            return ErrorHook::new(RpcError::not_found(
                "multi-segment property paths are not supported on targets",
            ));
        };
        let (resolver, promise) = PromiseHook::pair();
        self.enqueue(TargetJob::GetProperty {
            property: property.to_string(),
            resolver,
        });
        promise
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        // A target resolves to itself, delivered as a stub.
        let hook = self.dup();
        Ok(Payload::owned(Value::Stub(Stub::adopt(hook))))
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self
    }

    fn dispose(self: Arc<Self>) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ImportHook

/// A reference into the peer's table: `(session, import ID, pending path)`.
///
/// `get` composes the navigation path without touching the wire; `call`
/// enqueues a pipelined push and returns a hook on the freshly allocated
/// import ID. `pull` forces a `["pull", id]` round trip. The session is held
/// weakly: tables own hooks, not the other way around.
pub struct ImportHook {
    session: std::sync::Weak<SessionCore>,
    id: ImportId,
    path: Vec<PropertyKey>,
}

impl ImportHook {
    pub(crate) fn new(session: std::sync::Weak<SessionCore>, id: ImportId) -> Arc<Self> {
        Arc::new(ImportHook {
            session,
            id,
            path: Vec::new(),
        })
    }

    pub fn import_id(&self) -> ImportId {
        self.id
    }

    fn session(&self) -> Result<Arc<SessionCore>, RpcError> {
        self.session
            .upgrade()
            .ok_or_else(|| RpcError::canceled("session is gone"))
    }
}

impl fmt::Debug for ImportHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportHook")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl StubHook for ImportHook {
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, args: Payload) -> Arc<dyn StubHook> {
        let core = match self.session() {
            Ok(core) => core,
            Err(err) => return ErrorHook::new(err),
        };
        let full_path = concat_path(&self.path, path);
        core.pipeline_call(self.id, full_path, Some(args))
    }

    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        // Pure navigation: extend the path, share the table entry.
        let Ok(core) = self.session() else {
            return ErrorHook::new(RpcError::canceled("session is gone"));
        };
        core.note_import_dup(self.id);
        Arc::new(ImportHook {
            session: self.session.clone(),
            id: self.id,
            path: concat_path(&self.path, path),
        })
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        let core = self.session()?;
        if self.path.is_empty() {
            core.pull_import(self.id).await
        } else {
            // Navigated references are materialized as their own import
            // before pulling, then released.
            let hook = core.pipeline_call(self.id, self.path.clone(), None);
            let outcome = hook.clone().pull().await;
            hook.dispose();
            outcome
        }
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        if let Ok(core) = self.session() {
            core.note_import_dup(self.id);
        }
        self
    }

    fn dispose(self: Arc<Self>) {
        if let Ok(core) = self.session() {
            core.release_import_handle(self.id);
        }
    }

    fn remote_ref(&self) -> Option<RemoteRef> {
        Some(RemoteRef {
            session: self.session.clone(),
            id: self.id,
            path: self.path.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// PromiseHook

/// Wraps a completion yielding another hook; operations chain after it.
#[derive(Debug)]
pub struct PromiseHook {
    rx: watch::Receiver<Option<HookResult>>,
}

/// Write side of a [`PromiseHook`]. Dropping it unresolved cancels waiters.
#[derive(Debug)]
pub struct PromiseResolver {
    tx: watch::Sender<Option<HookResult>>,
}

impl PromiseResolver {
    pub fn resolve(&self, hook: Arc<dyn StubHook>) {
        let _ = self.tx.send(Some(Ok(hook)));
    }

    pub fn reject(&self, error: RpcError) {
        let _ = self.tx.send(Some(Err(error)));
    }
}

impl PromiseHook {
    pub fn pair() -> (PromiseResolver, Arc<dyn StubHook>) {
        let (tx, rx) = watch::channel(None);
        (PromiseResolver { tx }, Arc::new(PromiseHook { rx }))
    }

    async fn wait(&self) -> HookResult {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().expect("guarded by is_some"),
            Err(_) => Err(RpcError::canceled("promise abandoned before resolution")),
        };
        result
    }

    fn resolved(&self) -> Option<HookResult> {
        self.rx.borrow().clone()
    }
}

#[async_trait]
impl StubHook for PromiseHook {
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, args: Payload) -> Arc<dyn StubHook> {
        let (resolver, promise) = PromiseHook::pair();
        tokio::spawn(async move {
            match self.wait().await {
                Ok(hook) => resolver.resolve(hook.call(path, args)),
                Err(err) => resolver.reject(err),
            }
        });
        promise
    }

    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        let (resolver, promise) = PromiseHook::pair();
        tokio::spawn(async move {
            match self.wait().await {
                Ok(hook) => resolver.resolve(hook.get(path)),
                Err(err) => resolver.reject(err),
            }
        });
        promise
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        let hook = self.wait().await?;
        hook.pull().await
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        if let Some(Ok(hook)) = self.resolved() {
            let _ = hook.dup();
        }
        Arc::new(PromiseHook {
            rx: self.rx.clone(),
        })
    }

    fn dispose(self: Arc<Self>) {
        if let Some(Ok(hook)) = self.resolved() {
            hook.dispose();
        }
    }
}
