//! Client-side pipeline batches.
//!
//! A batch buffers pushes so that a whole chain of dependent calls leaves in
//! one transport write. Arguments may reference the promises of earlier
//! calls in the same batch; those references serialize as
//! `["pipeline", id, path]` against the IDs assigned at flush time. An
//! unflushed batch can be canceled without emitting anything.

use crate::error::RpcError;
use crate::hooks::{ErrorHook, RemoteRef, StubHook};
use crate::ids::ImportId;
use crate::payload::Payload;
use crate::serializer::Serializer;
use crate::session::{RpcSession, SessionCore};
use crate::stubs::{RpcPromise, Stub};
use crate::value::Value;
use crate::wire::{PropertyKey, WireExpression};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, trace};

struct StagedCall {
    subject: Arc<dyn StubHook>,
    path: Vec<PropertyKey>,
    args: Payload,
}

#[derive(Default)]
struct BatchBody {
    staged: Vec<StagedCall>,
    flushed: bool,
    canceled: bool,
}

struct BatchInner {
    session: Arc<SessionCore>,
    body: Mutex<BatchBody>,
    /// Import IDs assigned at flush, indexed by staging order.
    assigned: Mutex<Vec<Option<Result<ImportId, RpcError>>>>,
    settled_tx: watch::Sender<bool>,
    settled_rx: watch::Receiver<bool>,
}

impl BatchInner {
    /// Queue a call while the batch is open. On failure the arguments are
    /// handed back so the caller can fall through to direct pipelining.
    fn stage(
        self: &Arc<Self>,
        subject: Arc<dyn StubHook>,
        path: Vec<PropertyKey>,
        args: Payload,
    ) -> Result<usize, (RpcError, Payload)> {
        let mut body = self.body.lock().expect("batch lock poisoned");
        if body.canceled {
            subject.dispose();
            return Err((RpcError::canceled("batch was canceled"), args));
        }
        if body.flushed {
            subject.dispose();
            return Err((RpcError::bad_request("batch already flushed"), args));
        }
        if body.staged.len() >= self.session.config.max_batch_size {
            subject.dispose();
            return Err((
                RpcError::bad_request(format!(
                    "batch is full ({} calls)",
                    self.session.config.max_batch_size
                )),
                args,
            ));
        }
        let index = body.staged.len();
        body.staged.push(StagedCall {
            subject,
            path,
            args,
        });
        self.assigned
            .lock()
            .expect("assignment lock poisoned")
            .push(None);
        Ok(index)
    }

    fn flush(self: &Arc<Self>) {
        let staged = {
            let mut body = self.body.lock().expect("batch lock poisoned");
            if body.flushed || body.canceled {
                return;
            }
            body.flushed = true;
            std::mem::take(&mut body.staged)
        };

        debug!(calls = staged.len(), "flushing batch");
        let guard = self.session.lock_pushes();
        for (index, mut call) in staged.into_iter().enumerate() {
            let outcome = self.emit_call(&mut call);
            self.assigned.lock().expect("assignment lock poisoned")[index] = Some(outcome);
            call.subject.dispose();
        }
        // Pulls ride in the same write, after every push.
        let assigned = self.assigned.lock().expect("assignment lock poisoned");
        for slot in assigned.iter().flatten() {
            if let Ok(id) = slot {
                self.session.request_pull(*id);
            }
        }
        drop(assigned);
        drop(guard);

        let _ = self.settled_tx.send(true);
    }

    /// Emit one staged push. Callers hold the session push lock.
    fn emit_call(self: &Arc<Self>, call: &mut StagedCall) -> Result<ImportId, RpcError> {
        let remote = call
            .subject
            .remote_ref()
            .filter(|r| Weak::ptr_eq(&r.session, &self.session.weak()))
            .ok_or_else(|| {
                RpcError::bad_request("batched calls require a remote subject on this session")
            })?;

        call.args.ensure_owned();
        let args_expr = Serializer::new(&self.session).serialize_value(call.args.value())?;

        let mut path = remote.path;
        path.extend(call.path.drain(..));

        let hook = self.session.push_locked(|id| {
            trace!(%id, subject = %remote.id, "batched push");
            WireExpression::Pipeline {
                id: remote.id.0,
                path: Some(path),
                args: Some(Box::new(args_expr)),
            }
        });
        Ok(hook.import_id())
    }

    fn cancel(self: &Arc<Self>) {
        let dropped = {
            let mut body = self.body.lock().expect("batch lock poisoned");
            if body.flushed || body.canceled {
                return;
            }
            body.canceled = true;
            std::mem::take(&mut body.staged)
        };
        debug!(calls = dropped.len(), "canceling batch");
        for call in &dropped {
            call.subject.clone().dispose();
        }
        let mut assigned = self.assigned.lock().expect("assignment lock poisoned");
        for slot in assigned.iter_mut() {
            *slot = Some(Err(RpcError::canceled("batch was canceled")));
        }
        drop(assigned);
        let _ = self.settled_tx.send(true);
    }

    fn assignment(&self, index: usize) -> Option<Result<ImportId, RpcError>> {
        self.assigned
            .lock()
            .expect("assignment lock poisoned")
            .get(index)
            .cloned()
            .flatten()
    }

    async fn wait_settled(&self) {
        let mut rx = self.settled_rx.clone();
        let _ = rx.wait_for(|settled| *settled).await;
    }
}

impl fmt::Debug for BatchInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.lock().expect("batch lock poisoned");
        f.debug_struct("Batch")
            .field("staged", &body.staged.len())
            .field("flushed", &body.flushed)
            .field("canceled", &body.canceled)
            .finish()
    }
}

/// Hook behind the promises a batch hands out before its flush.
struct BatchRefHook {
    inner: Weak<BatchInner>,
    index: usize,
    path: Vec<PropertyKey>,
}

impl BatchRefHook {
    fn inner(&self) -> Result<Arc<BatchInner>, RpcError> {
        self.inner
            .upgrade()
            .ok_or_else(|| RpcError::canceled("batch is gone"))
    }
}

impl fmt::Debug for BatchRefHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRefHook")
            .field("index", &self.index)
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl StubHook for BatchRefHook {
    fn call(self: Arc<Self>, path: Vec<PropertyKey>, args: Payload) -> Arc<dyn StubHook> {
        let inner = match self.inner() {
            Ok(inner) => inner,
            Err(err) => return ErrorHook::new(err),
        };

        // Before the flush, chained calls join the batch; afterwards they
        // pipeline directly on the assigned import.
        let mut full_path = self.path.clone();
        full_path.extend(path);
        let subject = self.clone().dup();
        match inner.stage(subject, full_path.clone(), args) {
            Ok(index) => Arc::new(BatchRefHook {
                inner: self.inner.clone(),
                index,
                path: Vec::new(),
            }),
            Err((stage_err, args)) => match self.assignment_or(&inner, stage_err) {
                Ok(id) => inner.session.clone().pipeline_call(id, full_path, Some(args)),
                Err(err) => ErrorHook::new(err),
            },
        }
    }

    fn get(self: Arc<Self>, path: Vec<PropertyKey>) -> Arc<dyn StubHook> {
        // Navigated handles share the table entry once one exists.
        if let Ok(inner) = self.inner() {
            if let Some(Ok(id)) = inner.assignment(self.index) {
                inner.session.note_import_dup(id);
            }
        }
        let mut full_path = self.path.clone();
        full_path.extend(path);
        Arc::new(BatchRefHook {
            inner: self.inner.clone(),
            index: self.index,
            path: full_path,
        })
    }

    async fn pull(self: Arc<Self>) -> Result<Payload, RpcError> {
        let inner = self.inner()?;
        // Awaiting a batch promise flushes the batch, as a convenience.
        inner.flush();
        inner.wait_settled().await;

        let id = inner
            .assignment(self.index)
            .ok_or_else(|| RpcError::internal("batch settled without an assignment"))??;

        if self.path.is_empty() {
            inner.session.clone().pull_import(id).await
        } else {
            let hook = inner
                .session
                .clone()
                .pipeline_call(id, self.path.clone(), None);
            let outcome = hook.clone().pull().await;
            hook.dispose();
            outcome
        }
    }

    fn dup(self: Arc<Self>) -> Arc<dyn StubHook> {
        if let Ok(inner) = self.inner() {
            if let Some(Ok(id)) = inner.assignment(self.index) {
                inner.session.note_import_dup(id);
            }
        }
        Arc::new(BatchRefHook {
            inner: self.inner.clone(),
            index: self.index,
            path: self.path.clone(),
        })
    }

    fn dispose(self: Arc<Self>) {
        if let Ok(inner) = self.inner() {
            if let Some(Ok(id)) = inner.assignment(self.index) {
                inner.session.release_import_handle(id);
            }
        }
    }

    fn remote_ref(&self) -> Option<RemoteRef> {
        let inner = self.inner.upgrade()?;
        match inner.assignment(self.index) {
            Some(Ok(id)) => Some(RemoteRef {
                session: inner.session.weak(),
                id,
                path: self.path.clone(),
            }),
            _ => None,
        }
    }
}

impl BatchRefHook {
    fn assignment_or(
        &self,
        inner: &Arc<BatchInner>,
        fallback: RpcError,
    ) -> Result<ImportId, RpcError> {
        match inner.assignment(self.index) {
            Some(Ok(id)) => Ok(id),
            Some(Err(err)) => Err(err),
            None => Err(fallback),
        }
    }
}

/// A buffered batch of pipelined calls on one session.
#[derive(Debug)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    pub fn new(session: &RpcSession) -> Self {
        let (settled_tx, settled_rx) = watch::channel(false);
        Batch {
            inner: Arc::new(BatchInner {
                session: session.core().clone(),
                body: Mutex::new(BatchBody::default()),
                assigned: Mutex::new(Vec::new()),
                settled_tx,
                settled_rx,
            }),
        }
    }

    /// Queue a call on `subject`. The returned promise resolves after the
    /// batch is flushed; chaining `get`/`call` on it stays inside the batch.
    pub fn call(&self, subject: &Stub, path: Vec<PropertyKey>, args: Vec<Value>) -> RpcPromise {
        let mut args = Payload::from_app_params(Value::Array(args));
        args.ensure_owned();
        let subject_hook = subject.hook().clone().dup();
        match self.inner.stage(subject_hook, path, args) {
            Ok(index) => RpcPromise::adopt(Arc::new(BatchRefHook {
                inner: Arc::downgrade(&self.inner),
                index,
                path: Vec::new(),
            })),
            Err((err, _args)) => RpcPromise::adopt(ErrorHook::new(err)),
        }
    }

    /// Emit every queued push (and its pull) in one transport write.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Drop an unflushed batch without emitting anything.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn len(&self) -> usize {
        self.inner.body.lock().expect("batch lock poisoned").staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
