//! The session kernel.
//!
//! A session owns the ID allocator, the import/export tables, and the pending
//! promise map, and drives the push/pull/resolve/reject/release/abort state
//! machine over one transport. Message dispatch is strictly sequential;
//! user handlers and pull responders run on spawned tasks and re-enter
//! through the outbound queue.

use crate::error::{ErrorCode, RpcError};
use crate::hooks::{ErrorHook, ImportHook, PayloadHook, PromiseHook, StubHook, TargetHook};
use crate::ids::{ExportId, IdAllocator, ImportId};
use crate::parser::Parser;
use crate::payload::Payload;
use crate::remap::MapApplicator;
use crate::serializer::Serializer;
use crate::stubs::{resolve_nested_promises, Stub};
use crate::tables::{ExportTable, ImportTable};
use crate::transport::{RpcTransport, TransportError};
use crate::wire::{CaptureRef, PropertyKey, WireExpression, WireMessage};
use crate::RpcTarget;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames larger than this abort the session with `bad_request`.
    pub max_frame_size: usize,
    /// Upper bound on messages per HTTP batch request (enforced by servers).
    pub max_batch_size: usize,
    /// Include error stacks on the wire. Off by default; development only.
    pub include_stack_traces: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1 << 20,
            max_batch_size: 100,
            include_stack_traces: false,
        }
    }
}

const STATE_OPEN: u8 = 0;
const STATE_ABORTING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Aborting,
    Closed,
}

type PullOutcome = Result<Payload, RpcError>;

/// Completion slot for one import: filled by an inbound resolve/reject,
/// awaited by pulls. `pulled` dedups the outgoing `["pull", id]`.
#[derive(Debug)]
pub(crate) struct ResolutionCell {
    tx: watch::Sender<Option<PullOutcome>>,
    rx: watch::Receiver<Option<PullOutcome>>,
    pulled: AtomicBool,
}

impl ResolutionCell {
    fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        ResolutionCell {
            tx,
            rx,
            pulled: AtomicBool::new(false),
        }
    }
}

enum Outbound {
    Frame(WireMessage),
    Shutdown,
}

/// Shared state of one session. Hooks keep a `Weak` back-reference; the
/// public [`RpcSession`] handle and the driver task keep it alive.
pub struct SessionCore {
    pub(crate) config: SessionConfig,
    pub(crate) allocator: IdAllocator,
    pub(crate) imports: ImportTable,
    pub(crate) exports: ExportTable,
    pending: DashMap<ImportId, ResolutionCell>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: AtomicU8,
    /// Sequential numbering of inbound pushes (the peer's positive IDs).
    next_inbound_push: AtomicI64,
    /// Orders import-ID allocation with push emission; the Nth push on the
    /// wire must carry the Nth positive ID.
    push_lock: Mutex<()>,
    weak: Weak<SessionCore>,
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("state", &self.state())
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

impl SessionCore {
    fn new(config: SessionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        Self::build(config, IdAllocator::new(), 1)
    }

    fn build(
        config: SessionConfig,
        allocator: IdAllocator,
        next_inbound_push: i64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|weak| SessionCore {
            config,
            allocator,
            imports: ImportTable::new(),
            exports: ExportTable::new(),
            pending: DashMap::new(),
            outbound: tx,
            state: AtomicU8::new(STATE_OPEN),
            next_inbound_push: AtomicI64::new(next_inbound_push),
            push_lock: Mutex::new(()),
            weak: weak.clone(),
        });
        (core, rx)
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => SessionState::Open,
            STATE_ABORTING => SessionState::Aborting,
            _ => SessionState::Closed,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub(crate) fn weak(&self) -> Weak<SessionCore> {
        self.weak.clone()
    }

    fn enqueue(&self, msg: WireMessage) {
        if self.is_open() {
            let _ = self.outbound.send(Outbound::Frame(msg));
        }
    }

    fn install_root(self: &Arc<Self>, root: Option<Arc<dyn RpcTarget>>) {
        if let Some(target) = root {
            self.exports
                .insert(ExportId::main(), TargetHook::new(target))
                .expect("fresh session has no exports");
        }
        let root_import = ImportHook::new(self.weak(), ImportId::main());
        self.imports
            .insert(ImportId::main(), root_import)
            .expect("fresh session has no imports");
    }

    /// A stub on the peer's root capability.
    pub(crate) fn root_stub(&self) -> Stub {
        self.imports.add_ref(ImportId::main());
        let hook = self
            .imports
            .get(ImportId::main())
            .expect("root import is registered at construction");
        Stub::adopt(hook)
    }

    // -- outbound operations (the importing side) ---------------------------

    /// Serialize the push lock. Allocation and emission must pair up: the
    /// Nth push on the wire carries the Nth positive ID.
    pub(crate) fn lock_pushes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.push_lock.lock().expect("push lock poisoned")
    }

    /// Allocate the next import ID and emit a push whose result lands there.
    /// Callers hold the push lock.
    pub(crate) fn push_locked(
        self: &Arc<Self>,
        expr_for: impl FnOnce(ImportId) -> WireExpression,
    ) -> Arc<ImportHook> {
        let id = self.allocator.allocate_import();
        self.pending.insert(id, ResolutionCell::new());
        let hook = ImportHook::new(self.weak(), id);
        self.imports
            .insert(id, hook.clone())
            .expect("freshly allocated IDs are unused");
        self.enqueue(WireMessage::Push(expr_for(id)));
        hook
    }

    /// Compose a pipelined operation on `subject`: allocate a fresh positive
    /// import ID, enqueue the push, and hand back a hook on the new ID. With
    /// `args` this is a call; without, pure navigation materialized as its
    /// own import.
    pub(crate) fn pipeline_call(
        self: Arc<Self>,
        subject: ImportId,
        path: Vec<PropertyKey>,
        args: Option<Payload>,
    ) -> Arc<dyn StubHook> {
        if !self.is_open() {
            return ErrorHook::new(RpcError::canceled("session is closed"));
        }

        let args_expr = match args {
            Some(mut payload) => {
                payload.ensure_owned();
                match Serializer::new(&self).serialize_value(payload.value()) {
                    Ok(expr) => Some(Box::new(expr)),
                    Err(err) => return ErrorHook::new(err),
                }
            }
            None => None,
        };

        let guard = self.lock_pushes();
        let hook = self.push_locked(|id| {
            trace!(%subject, %id, "pipelining push");
            WireExpression::Pipeline {
                id: subject.0,
                path: Some(path),
                args: args_expr,
            }
        });
        drop(guard);
        hook
    }

    /// Push a `["remap", ...]` expression on `subject`, yielding a hook on
    /// the mapped result.
    pub(crate) fn send_remap(
        self: Arc<Self>,
        subject: ImportId,
        path: Option<Vec<PropertyKey>>,
        captures: Vec<CaptureRef>,
        instructions: Vec<WireExpression>,
    ) -> Arc<dyn StubHook> {
        if !self.is_open() {
            return ErrorHook::new(RpcError::canceled("session is closed"));
        }
        let guard = self.lock_pushes();
        let hook = self.push_locked(|_| WireExpression::Remap {
            id: subject.0,
            path,
            captures,
            instructions,
        });
        drop(guard);
        hook
    }

    /// Request resolution of an import without waiting for it. The
    /// `["pull", id]` is sent at most once per import.
    pub(crate) fn request_pull(&self, id: ImportId) {
        let cell = self.pending.entry(id).or_insert_with(ResolutionCell::new);
        if !cell.pulled.swap(true, Ordering::SeqCst) {
            self.enqueue(WireMessage::Pull(id.0));
        }
    }

    /// Force resolution of an import: send `["pull", id]` once and await the
    /// matching resolve/reject.
    pub(crate) async fn pull_import(self: Arc<Self>, id: ImportId) -> PullOutcome {
        self.request_pull(id);
        let Some(rx) = self.pending.get(&id).map(|cell| cell.rx.clone()) else {
            return Err(RpcError::canceled("session closed before resolution"));
        };

        let mut rx = rx;
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().expect("guarded by is_some"),
            Err(_) => Err(RpcError::canceled("session closed before resolution")),
        };

        let payload = outcome?;
        let value = resolve_nested_promises(payload.into_value()).await?;
        Ok(Payload::owned(value))
    }

    pub(crate) fn note_import_dup(&self, id: ImportId) {
        self.imports.add_ref(id);
    }

    /// Drop one local handle on an import; the last one out sends `release`
    /// with the accumulated announcement count.
    pub(crate) fn release_import_handle(&self, id: ImportId) {
        if let Some(total) = self.imports.release_local(id) {
            self.pending.remove(&id);
            debug!(%id, refcount = total, "releasing import");
            self.enqueue(WireMessage::Release {
                id: id.0,
                refcount: total,
            });
        }
    }

    // -- parser-side installs (the peer announced something) ----------------

    /// The peer sent `["export", id]`: install or bump our import entry and
    /// hand back a counted hook for the new stub.
    pub(crate) fn import_capability(self: &Arc<Self>, id: ImportId) -> Arc<dyn StubHook> {
        if let Some(hook) = self.imports.get(id) {
            self.imports.note_remote_ref(id);
            self.imports.add_ref(id);
            return hook;
        }
        let hook = ImportHook::new(self.weak(), id);
        self.imports
            .insert(id, hook.clone())
            .expect("checked for existence above");
        hook
    }

    /// The peer sent `["promise", id]`: same entry discipline as
    /// `import_capability`; the resolution arrives via resolve/reject.
    pub(crate) fn import_promise(self: &Arc<Self>, id: ImportId) -> Arc<dyn StubHook> {
        let hook = self.import_capability(id);
        self.pending.entry(id).or_insert_with(ResolutionCell::new);
        hook
    }

    // -- serializer-side exports --------------------------------------------

    /// Mint (or re-announce) an export for `hook`. The table holds its own
    /// refcount on the hook.
    pub(crate) fn export_stub(&self, hook: &Arc<dyn StubHook>) -> ExportId {
        if let Some(id) = self.exports.find_by_hook(hook) {
            let _ = self.exports.bump_introductions(id);
            return id;
        }
        let id = self.allocator.allocate_export();
        self.exports
            .insert(id, hook.clone().dup())
            .expect("freshly allocated IDs are unused");
        trace!(%id, "minted export");
        id
    }

    /// Mint an export for a promise and arrange for its resolution to be
    /// forwarded as resolve/reject once the underlying computation settles.
    pub(crate) fn export_promise(self: &Arc<Self>, hook: &Arc<dyn StubHook>) -> ExportId {
        if let Some(id) = self.exports.find_by_hook(hook) {
            let _ = self.exports.bump_introductions(id);
            return id;
        }
        let id = self.allocator.allocate_export();
        self.exports
            .insert(id, hook.clone().dup())
            .expect("freshly allocated IDs are unused");

        let core = self.clone();
        let hook = hook.clone();
        tokio::spawn(async move {
            let msg = match hook.pull().await {
                Ok(payload) => match Serializer::new(&core).serialize_value(payload.value()) {
                    Ok(expr) => WireMessage::Resolve(id.0, expr),
                    Err(err) => WireMessage::Reject(id.0, core.error_to_wire(&err)),
                },
                Err(err) => WireMessage::Reject(id.0, core.error_to_wire(&err)),
            };
            core.enqueue(msg);
        });
        id
    }

    /// Wire form of an error, honoring the stack-redaction flag.
    pub(crate) fn error_to_wire(&self, error: &RpcError) -> WireExpression {
        WireExpression::Error {
            error_type: error.code.as_str().to_string(),
            message: error.message.clone(),
            stack: if self.config.include_stack_traces {
                error.stack.clone()
            } else {
                None
            },
            data: error.data.clone(),
        }
    }

    // -- inbound dispatch ---------------------------------------------------

    async fn dispatch(self: &Arc<Self>, msg: WireMessage) {
        if !self.is_open() {
            return;
        }
        match msg {
            WireMessage::Push(expr) => self.handle_push(expr),
            WireMessage::Pull(id) => self.handle_pull(ExportId(id)),
            WireMessage::Resolve(id, expr) => self.handle_resolution(ImportId(id), expr, true),
            WireMessage::Reject(id, expr) => self.handle_resolution(ImportId(id), expr, false),
            WireMessage::Release { id, refcount } => self.handle_release(ExportId(id), refcount),
            WireMessage::Abort(expr) => {
                let error = match Parser::new(self).parse_value(&expr) {
                    Ok(crate::value::Value::Error(err)) => err,
                    Ok(_) => RpcError::internal("peer aborted the session"),
                    Err(err) => err,
                };
                warn!(%error, "session aborted by peer");
                self.fail_session(error, false);
            }
        }
    }

    /// A push installs its result at the next sequential positive export ID.
    /// It never produces an outbound message by itself.
    fn handle_push(self: &Arc<Self>, expr: WireExpression) {
        let id = ExportId(self.next_inbound_push.fetch_add(1, Ordering::SeqCst));
        trace!(%id, "inbound push");
        match self.evaluate_push(expr) {
            Ok(hook) => {
                self.exports
                    .insert(id, hook)
                    .expect("inbound push IDs are sequential and unused");
            }
            Err(err) => self.abort(err),
        }
    }

    fn evaluate_push(self: &Arc<Self>, expr: WireExpression) -> Result<Arc<dyn StubHook>, RpcError> {
        match expr {
            WireExpression::Pipeline { id, path, args } | WireExpression::Import { id, path, args } => {
                let Some(subject) = self.exports.get(ExportId(id)) else {
                    return Ok(ErrorHook::new(RpcError::not_found(format!(
                        "unknown export {} in push",
                        id
                    ))));
                };
                let path = path.unwrap_or_default();
                match args {
                    Some(args) => {
                        // Argument parse failures are protocol violations.
                        let payload = Parser::new(self).parse(&args)?;
                        Ok(subject.dup().call(path, payload))
                    }
                    None if path.is_empty() => Ok(subject.dup()),
                    None => Ok(subject.dup().get(path)),
                }
            }

            WireExpression::Remap {
                id,
                path,
                captures,
                instructions,
            } => {
                let Some(subject) = self.exports.get(ExportId(id)) else {
                    return Ok(ErrorHook::new(RpcError::not_found(format!(
                        "unknown export {} in remap",
                        id
                    ))));
                };
                let applicator = match MapApplicator::new(self, &captures, instructions) {
                    Ok(applicator) => applicator,
                    Err(err) => return Ok(ErrorHook::new(err)),
                };
                let subject = match path {
                    Some(path) if !path.is_empty() => subject.dup().get(path),
                    _ => subject.dup(),
                };
                let (resolver, promise) = PromiseHook::pair();
                tokio::spawn(async move {
                    match subject.pull().await {
                        Ok(payload) => {
                            let mapped = applicator.execute(payload.into_value()).await;
                            resolver.resolve(PayloadHook::new(Payload::owned(mapped)));
                        }
                        Err(err) => resolver.reject(err),
                    }
                });
                Ok(promise)
            }

            // A pushed plain value becomes a payload hook.
            other => {
                let payload = Parser::new(self).parse(&other)?;
                Ok(PayloadHook::new(payload))
            }
        }
    }

    /// Answer a pull with resolve/reject once the export settles.
    fn handle_pull(self: &Arc<Self>, id: ExportId) {
        let Some(hook) = self.exports.get(id) else {
            self.enqueue(WireMessage::Reject(
                id.0,
                self.error_to_wire(&RpcError::not_found(format!("unknown export {}", id))),
            ));
            return;
        };

        let core = self.clone();
        tokio::spawn(async move {
            let msg = match hook.pull().await {
                Ok(payload) => match Serializer::new(&core).serialize_value(payload.value()) {
                    Ok(expr) => WireMessage::Resolve(id.0, expr),
                    Err(err) => WireMessage::Reject(id.0, core.error_to_wire(&err)),
                },
                Err(err) => WireMessage::Reject(id.0, core.error_to_wire(&err)),
            };
            trace!(%id, "answering pull");
            core.enqueue(msg);
        });
    }

    fn handle_resolution(self: &Arc<Self>, id: ImportId, expr: WireExpression, resolve: bool) {
        let outcome = if resolve {
            match Parser::new(self).parse(&expr) {
                Ok(payload) => Ok(payload),
                Err(err) => return self.abort(err),
            }
        } else {
            match Parser::new(self).parse_value(&expr) {
                Ok(crate::value::Value::Error(err)) => Err(err),
                Ok(_) => Err(RpcError::internal("rejected without an error value")),
                Err(err) => return self.abort(err),
            }
        };

        trace!(%id, resolve, "inbound resolution");
        let cell = self.pending.entry(id).or_insert_with(ResolutionCell::new);
        let _ = cell.tx.send(Some(outcome));
    }

    fn handle_release(self: &Arc<Self>, id: ExportId, refcount: u32) {
        // The root is pinned for the session's lifetime.
        if id.is_main() {
            return;
        }
        if let Some(hook) = self.exports.release(id, refcount) {
            hook.dispose();
        }
    }

    // -- teardown -----------------------------------------------------------

    /// Abort for a local fatal error: emit a single `abort` frame, then fail
    /// everything.
    pub(crate) fn abort(self: &Arc<Self>, error: RpcError) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_ABORTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        warn!(%error, "aborting session");
        let _ = self.outbound.send(Outbound::Frame(WireMessage::Abort(
            self.error_to_wire(&error),
        )));
        let _ = self.outbound.send(Outbound::Shutdown);
        self.teardown(error);
    }

    /// Fail without emitting (peer abort, transport loss, graceful close).
    fn fail_session(self: &Arc<Self>, error: RpcError, graceful: bool) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_ABORTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if !graceful {
            debug!(%error, "session failed");
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        self.teardown(error);
    }

    fn teardown(self: &Arc<Self>, error: RpcError) {
        for entry in self.pending.iter() {
            let _ = entry.tx.send(Some(Err(error.clone())));
        }
        self.pending.clear();
        for (_, hook) in self.imports.drain() {
            hook.dispose();
        }
        for (_, hook) in self.exports.drain() {
            hook.dispose();
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}

/// Public handle on a running session.
pub struct RpcSession {
    core: Arc<SessionCore>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession").field("core", &self.core).finish()
    }
}

impl RpcSession {
    /// Attach a session to a transport. `root` becomes export 0; pass `None`
    /// for pure clients that expose nothing.
    pub fn new(transport: Box<dyn RpcTransport>, root: Option<Arc<dyn RpcTarget>>) -> Self {
        Self::with_config(transport, root, SessionConfig::default())
    }

    pub fn with_config(
        transport: Box<dyn RpcTransport>,
        root: Option<Arc<dyn RpcTarget>>,
        config: SessionConfig,
    ) -> Self {
        let (core, outbound_rx) = SessionCore::new(config);
        core.install_root(root);
        let driver = tokio::spawn(drive(core.clone(), transport, outbound_rx));
        RpcSession {
            core,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Rebuild a session's bookkeeping from a resume-token snapshot on a
    /// fresh transport. Import entries are reinstalled with their refcounts;
    /// the root target is re-registered by the caller. Non-root exports
    /// cannot be reconstructed from a snapshot (the hooks were live
    /// objects); the peer re-announces anything it still needs.
    pub fn resume(
        transport: Box<dyn RpcTransport>,
        root: Option<Arc<dyn RpcTarget>>,
        snapshot: &crate::resume::SessionSnapshot,
        config: SessionConfig,
    ) -> Self {
        let allocator =
            IdAllocator::restore(snapshot.next_positive_id, snapshot.next_negative_id);
        let next_push = snapshot
            .exports
            .iter()
            .map(|e| e.id)
            .filter(|id| *id > 0)
            .max()
            .map_or(1, |max| max + 1);
        let (core, outbound_rx) = SessionCore::build(config, allocator, next_push);
        core.install_root(root);
        for entry in &snapshot.imports {
            if entry.id == 0 {
                continue;
            }
            let id = ImportId(entry.id);
            let hook = ImportHook::new(core.weak(), id);
            core.imports
                .insert_restored(id, hook, entry.refcount, entry.remote_refs)
                .expect("snapshot IDs are unique");
        }
        let driver = tokio::spawn(drive(core.clone(), transport, outbound_rx));
        RpcSession {
            core,
            driver: Mutex::new(Some(driver)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// A stub on the peer's root capability (import 0).
    pub fn root_stub(&self) -> Stub {
        self.core.root_stub()
    }

    /// Abort with an error, notifying the peer.
    pub fn abort(&self, error: RpcError) {
        self.core.abort(error);
    }

    /// Graceful shutdown: dispose everything, send nothing.
    pub async fn shutdown(&self) {
        self.core
            .fail_session(RpcError::canceled("session shut down"), true);
        self.closed().await;
    }

    /// Wait for the driver to finish (transport closed or session aborted).
    pub async fn closed(&self) {
        let handle = self.driver.lock().expect("driver lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The per-session IO task: drains the outbound queue into the transport's
/// sink, reads inbound frames from its stream, and dispatches them
/// sequentially.
async fn drive(
    core: Arc<SessionCore>,
    transport: Box<dyn RpcTransport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (mut sink, mut stream) = transport.split();
    loop {
        tokio::select! {
            item = outbound.recv() => {
                let mut frames: Vec<Bytes> = Vec::new();
                let mut shutdown = false;
                let mut item = item;
                loop {
                    match item {
                        Some(Outbound::Frame(msg)) => frames.push(Bytes::from(msg.to_line())),
                        Some(Outbound::Shutdown) | None => {
                            shutdown = true;
                            break;
                        }
                    }
                    match outbound.try_recv() {
                        Ok(next) => item = Some(next),
                        Err(_) => break,
                    }
                }
                if !frames.is_empty() {
                    trace!(count = frames.len(), "writing outbound burst");
                    if sink.send_batch(frames).await.is_err()
                        || sink.flush().await.is_err()
                    {
                        core.fail_session(RpcError::internal("transport write failed"), false);
                        break;
                    }
                }
                if shutdown {
                    let _ = sink.close().await;
                    break;
                }
            }

            frame = stream.recv() => match frame {
                Ok(Some(bytes)) => {
                    if bytes.len() > core.config.max_frame_size {
                        core.abort(RpcError::bad_request(format!(
                            "frame of {} bytes exceeds maximum {}",
                            bytes.len(),
                            core.config.max_frame_size
                        )));
                        continue;
                    }
                    let text = match std::str::from_utf8(&bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            core.abort(RpcError::bad_request("frame is not valid UTF-8"));
                            continue;
                        }
                    };
                    match WireMessage::parse_line(text) {
                        Ok(msg) => core.dispatch(msg).await,
                        Err(err) => {
                            debug_assert_eq!(err.code, ErrorCode::BadRequest);
                            core.abort(err);
                        }
                    }
                }
                Ok(None) => {
                    core.fail_session(RpcError::canceled("transport closed"), true);
                    let _ = sink.close().await;
                    break;
                }
                Err(TransportError::ConnectionClosed) => {
                    core.fail_session(RpcError::canceled("transport closed"), true);
                    break;
                }
                Err(err) => {
                    core.fail_session(RpcError::internal(format!("transport error: {}", err)), false);
                    break;
                }
            }
        }
    }
    // Drain any last frames the abort path enqueued before we observed
    // shutdown, so the peer sees the abort.
    while let Ok(Outbound::Frame(msg)) = outbound.try_recv() {
        let _ = sink.send(Bytes::from(msg.to_line())).await;
    }
    let _ = sink.flush().await;
}
