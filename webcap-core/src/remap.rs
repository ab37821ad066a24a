//! The `.map()` sub-language.
//!
//! A remap ships a tiny instruction list to the exporting side, which applies
//! it to each element of a collection without a round trip per element. The
//! address space during execution has three regions: negative indices name
//! captures, index 0 names the element under map, and positive indices name
//! the results of previously executed instructions. There is no export table
//! inside a mapper; `["export", ...]` in instructions is illegal.

use crate::error::RpcError;
use crate::hooks::{PayloadHook, StubHook};
use crate::ids::{ExportId, ImportId};
use crate::payload::Payload;
use crate::session::SessionCore;
use crate::stubs::{RpcPromise, Stub};
use crate::value::Value;
use crate::wire::{CaptureRef, PropertyKey, WireExpression};
use std::sync::Arc;
use tracing::trace;

// ---------------------------------------------------------------------------
// Server side: applicator

/// Executes a remap instruction list against input elements.
pub struct MapApplicator {
    captures: Vec<Arc<dyn StubHook>>,
    instructions: Vec<WireExpression>,
}

impl MapApplicator {
    /// Resolve captures against the session tables. `["import", id]` names
    /// one of our exports being passed back; `["export", id]` announces a
    /// fresh capability of the sender.
    pub(crate) fn new(
        session: &Arc<SessionCore>,
        captures: &[CaptureRef],
        instructions: Vec<WireExpression>,
    ) -> Result<Self, RpcError> {
        if instructions.is_empty() {
            return Err(RpcError::bad_request("remap requires instructions"));
        }
        let captures = captures
            .iter()
            .map(|capture| match capture {
                CaptureRef::Import(id) => session
                    .exports
                    .get(ExportId(*id))
                    .map(|hook| hook.dup())
                    .ok_or_else(|| {
                        RpcError::bad_request(format!("unknown capture import {}", id))
                    }),
                CaptureRef::Export(id) => Ok(session.import_capability(ImportId(*id))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MapApplicator {
            captures,
            instructions,
        })
    }

    /// Apply the mapper. Arrays map element-wise with per-element failure
    /// isolation; any other value is mapped once as the "self" element.
    pub async fn execute(self, input: Value) -> Value {
        let result = match input {
            Value::Array(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for element in items {
                    mapped.push(match self.apply_one(element).await {
                        Ok(value) => value,
                        Err(err) => Value::Error(err),
                    });
                }
                Value::Array(mapped)
            }
            element => match self.apply_one(element).await {
                Ok(value) => value,
                Err(err) => Value::Error(err),
            },
        };
        for capture in &self.captures {
            capture.clone().dispose();
        }
        result
    }

    async fn apply_one(&self, element: Value) -> Result<Value, RpcError> {
        let mut vars: Vec<Arc<dyn StubHook>> =
            vec![PayloadHook::new(Payload::owned(element)) as Arc<dyn StubHook>];
        let result = self.apply_instructions(&mut vars).await;
        // Intermediate results are transient; releasing them here sends the
        // release messages for any pipelined calls the mapper made.
        for var in vars {
            var.dispose();
        }
        result
    }

    async fn apply_instructions(
        &self,
        vars: &mut Vec<Arc<dyn StubHook>>,
    ) -> Result<Value, RpcError> {
        for instruction in &self.instructions {
            match instruction {
                // A bare index selects the final result.
                WireExpression::Number(n) => {
                    let index = n
                        .as_i64()
                        .ok_or_else(|| RpcError::bad_request("variable index must be integer"))?;
                    let hook = self.resolve_var(index, &vars)?;
                    let payload = hook.pull().await?;
                    return Ok(payload.into_value());
                }

                WireExpression::Pipeline { id, path, args } => {
                    let subject = self.resolve_var(*id, &vars)?;
                    let path = path.clone().unwrap_or_default();
                    let result = match args {
                        Some(args) => {
                            let args = self.eval_operand(args, &vars).await?;
                            subject.dup().call(path, Payload::owned(args))
                        }
                        None => subject.dup().get(path),
                    };
                    vars.push(result);
                }

                WireExpression::Export { .. }
                | WireExpression::Promise { .. }
                | WireExpression::Import { .. }
                | WireExpression::Remap { .. } => {
                    return Err(RpcError::bad_request(
                        "table references are not allowed in remap instructions",
                    ));
                }

                // Any other expression is a literal producing its own value.
                other => {
                    let value = self.eval_operand(other, &vars).await?;
                    vars.push(PayloadHook::new(Payload::owned(value)));
                }
            }
        }

        let last = vars.last().expect("vars always holds the input").clone();
        let payload = last.pull().await?;
        Ok(payload.into_value())
    }

    /// Evaluate an instruction operand. Integers are variable references;
    /// containers recurse; other scalars are literal.
    fn eval_operand<'a>(
        &'a self,
        expr: &'a WireExpression,
        vars: &'a [Arc<dyn StubHook>],
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Value, RpcError>> + Send + 'a>,
    > {
        Box::pin(async move {
            match expr {
                WireExpression::Number(n) => match n.as_i64() {
                    Some(index) => {
                        let hook = self.resolve_var(index, vars)?;
                        let payload = hook.pull().await?;
                        Ok(payload.into_value())
                    }
                    None => Ok(Value::Number(n.clone())),
                },

                WireExpression::Null => Ok(Value::Null),
                WireExpression::Bool(b) => Ok(Value::Bool(*b)),
                WireExpression::String(s) => Ok(Value::String(s.clone())),
                WireExpression::Date(ms) => Ok(Value::Date(*ms)),

                WireExpression::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_operand(item, vars).await?);
                    }
                    Ok(Value::Array(values))
                }

                WireExpression::Object(map) => {
                    let mut values = std::collections::HashMap::with_capacity(map.len());
                    for (key, item) in map {
                        values.insert(key.clone(), Box::new(self.eval_operand(item, vars).await?));
                    }
                    Ok(Value::Object(values))
                }

                WireExpression::Pipeline { id, path, args } => {
                    let subject = self.resolve_var(*id, vars)?;
                    let path = path.clone().unwrap_or_default();
                    let hook = match args {
                        Some(args) => {
                            let args = self.eval_operand(args, vars).await?;
                            subject.dup().call(path, Payload::owned(args))
                        }
                        None => subject.dup().get(path),
                    };
                    let payload = hook.pull().await?;
                    Ok(payload.into_value())
                }

                WireExpression::Error {
                    error_type,
                    message,
                    stack,
                    data,
                } => Ok(Value::Error(RpcError {
                    code: crate::error::ErrorCode::from_tag(error_type),
                    message: message.clone(),
                    stack: stack.clone(),
                    data: data.clone(),
                })),

                WireExpression::Export { .. }
                | WireExpression::Promise { .. }
                | WireExpression::Import { .. }
                | WireExpression::Remap { .. } => Err(RpcError::bad_request(
                    "table references are not allowed in remap instructions",
                )),
            }
        })
    }

    /// Three-region address resolution. Any out-of-range index fails the
    /// element with `bad_request`.
    fn resolve_var(
        &self,
        index: i64,
        vars: &[Arc<dyn StubHook>],
    ) -> Result<Arc<dyn StubHook>, RpcError> {
        if index >= 0 {
            vars.get(index as usize).cloned().ok_or_else(|| {
                RpcError::bad_request(format!("variable index {} out of range", index))
            })
        } else {
            let slot = (-index - 1) as usize;
            self.captures.get(slot).cloned().ok_or_else(|| {
                RpcError::bad_request(format!("capture index {} out of range", index))
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Client side: builder

/// Builds the captures and instruction list of a `["remap", ...]` expression.
///
/// Variable indices follow the mapper address space: [`RemapBuilder::input`]
/// is 0, captures are negative, and each recorded instruction returns the
/// index naming its result.
#[derive(Default)]
pub struct RemapBuilder {
    captures: Vec<Arc<dyn StubHook>>,
    instructions: Vec<WireExpression>,
}

impl RemapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The element under map.
    pub fn input(&self) -> i64 {
        0
    }

    /// Capture an external capability, interning repeats.
    pub fn capture(&mut self, stub: &Stub) -> i64 {
        self.capture_hook(stub.hook())
    }

    pub fn capture_promise(&mut self, promise: &RpcPromise) -> i64 {
        self.capture_hook(promise.hook())
    }

    fn capture_hook(&mut self, hook: &Arc<dyn StubHook>) -> i64 {
        if let Some(slot) = self.captures.iter().position(|c| Arc::ptr_eq(c, hook)) {
            return -(slot as i64) - 1;
        }
        self.captures.push(hook.clone().dup());
        -(self.captures.len() as i64)
    }

    /// A reference to a variable, for use inside instruction arguments.
    pub fn var(index: i64) -> WireExpression {
        WireExpression::int(index)
    }

    /// Record a call instruction; returns the index of its result.
    pub fn call(
        &mut self,
        subject: i64,
        path: Vec<PropertyKey>,
        args: Vec<WireExpression>,
    ) -> i64 {
        self.instructions.push(WireExpression::Pipeline {
            id: subject,
            path: Some(path),
            args: Some(Box::new(WireExpression::Array(args))),
        });
        self.instructions.len() as i64
    }

    /// Record a navigation instruction; returns the index of its result.
    pub fn get(&mut self, subject: i64, path: Vec<PropertyKey>) -> i64 {
        self.instructions.push(WireExpression::Pipeline {
            id: subject,
            path: Some(path),
            args: None,
        });
        self.instructions.len() as i64
    }

    /// Select which variable is the mapper output. Without this, the last
    /// instruction's value is the output.
    pub fn select(&mut self, index: i64) {
        self.instructions.push(WireExpression::int(index));
    }

    fn finish(
        self,
        session: &Arc<SessionCore>,
    ) -> Result<(Vec<CaptureRef>, Vec<WireExpression>), RpcError> {
        if self.instructions.is_empty() {
            return Err(RpcError::bad_request("map recorded no instructions"));
        }
        let captures = self
            .captures
            .iter()
            .map(|hook| {
                match hook.remote_ref() {
                    // One of our imports on this session: pass it back.
                    Some(remote)
                        if std::sync::Weak::ptr_eq(&remote.session, &session.weak())
                            && remote.path.is_empty() =>
                    {
                        CaptureRef::Import(remote.id.0)
                    }
                    // Anything else is exported fresh.
                    _ => CaptureRef::Export(session.export_stub(hook).0),
                }
            })
            .collect::<Vec<_>>();
        // The builder's own holds are no longer needed: the wire captures
        // carry the references now (and exports are counted by the table).
        for hook in &self.captures {
            hook.clone().dispose();
        }
        Ok((captures, self.instructions))
    }
}

impl Stub {
    /// Map a remote collection server-side: `build` records the mapper
    /// against a [`RemapBuilder`], and the whole plan ships in one push.
    pub fn map(
        &self,
        path: Vec<PropertyKey>,
        build: impl FnOnce(&mut RemapBuilder),
    ) -> RpcPromise {
        map_hook(self.hook(), path, build)
    }
}

impl RpcPromise {
    /// Map the eventual collection server-side without awaiting it first.
    pub fn map(
        &self,
        path: Vec<PropertyKey>,
        build: impl FnOnce(&mut RemapBuilder),
    ) -> RpcPromise {
        map_hook(self.hook(), path, build)
    }
}

fn map_hook(
    hook: &Arc<dyn StubHook>,
    path: Vec<PropertyKey>,
    build: impl FnOnce(&mut RemapBuilder),
) -> RpcPromise {
    let Some(remote) = hook.remote_ref() else {
        return RpcPromise::adopt(crate::hooks::ErrorHook::new(RpcError::bad_request(
            "map requires a remote subject",
        )));
    };
    let Some(session) = remote.session.upgrade() else {
        return RpcPromise::adopt(crate::hooks::ErrorHook::new(RpcError::canceled(
            "session is gone",
        )));
    };

    let mut builder = RemapBuilder::new();
    build(&mut builder);

    let mut full_path = remote.path.clone();
    full_path.extend(path);
    let subject_path = if full_path.is_empty() {
        None
    } else {
        Some(full_path)
    };

    match builder.finish(&session) {
        Ok((captures, instructions)) => {
            trace!(subject = %remote.id, captures = captures.len(), "sending remap");
            RpcPromise::adopt(session.send_remap(remote.id, subject_path, captures, instructions))
        }
        Err(err) => RpcPromise::adopt(crate::hooks::ErrorHook::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::TargetHook;
    use crate::RpcTarget;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Doubler;

    #[async_trait]
    impl RpcTarget for Doubler {
        async fn call(&self, _method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
            Ok(Value::int(args[0].as_i64().unwrap_or(0) * 2))
        }

        async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
            Err(RpcError::not_found(property.to_string()))
        }
    }

    fn applicator_with(
        captures: Vec<Arc<dyn StubHook>>,
        instructions: Vec<WireExpression>,
    ) -> MapApplicator {
        MapApplicator {
            captures,
            instructions,
        }
    }

    #[tokio::test]
    async fn maps_each_element_through_a_capture() {
        // Instructions: [["pipeline", -1, [], [[0]]]] - apply capture -1 to
        // the element.
        let applicator = applicator_with(
            vec![TargetHook::new(Arc::new(Doubler)) as Arc<dyn StubHook>],
            vec![WireExpression::Pipeline {
                id: -1,
                path: Some(Vec::new()),
                args: Some(Box::new(WireExpression::Array(vec![WireExpression::int(0)]))),
            }],
        );

        let result = applicator
            .execute(Value::Array(vec![Value::int(1), Value::int(2), Value::int(3)]))
            .await;
        assert_eq!(
            result,
            Value::Array(vec![Value::int(2), Value::int(4), Value::int(6)])
        );
    }

    #[tokio::test]
    async fn scalar_subject_maps_once() {
        let applicator = applicator_with(
            vec![TargetHook::new(Arc::new(Doubler)) as Arc<dyn StubHook>],
            vec![WireExpression::Pipeline {
                id: -1,
                path: Some(Vec::new()),
                args: Some(Box::new(WireExpression::Array(vec![WireExpression::int(0)]))),
            }],
        );
        assert_eq!(applicator.execute(Value::int(21)).await, Value::int(42));
    }

    #[tokio::test]
    async fn element_failure_is_isolated() {
        #[derive(Debug)]
        struct OddHater;

        #[async_trait]
        impl RpcTarget for OddHater {
            async fn call(&self, _m: &str, args: Vec<Value>) -> Result<Value, RpcError> {
                let n = args[0].as_i64().unwrap_or(0);
                if n % 2 == 1 {
                    Err(RpcError::bad_request("odd"))
                } else {
                    Ok(Value::int(n))
                }
            }

            async fn get_property(&self, p: &str) -> Result<Value, RpcError> {
                Err(RpcError::not_found(p.to_string()))
            }
        }

        let applicator = applicator_with(
            vec![TargetHook::new(Arc::new(OddHater)) as Arc<dyn StubHook>],
            vec![WireExpression::Pipeline {
                id: -1,
                path: Some(Vec::new()),
                args: Some(Box::new(WireExpression::Array(vec![WireExpression::int(0)]))),
            }],
        );

        let result = applicator
            .execute(Value::Array(vec![Value::int(2), Value::int(3), Value::int(4)]))
            .await;
        let Value::Array(items) = result else {
            panic!("expected array result")
        };
        assert_eq!(items[0], Value::int(2));
        assert!(matches!(&items[1], Value::Error(e) if e.code == crate::error::ErrorCode::BadRequest));
        assert_eq!(items[2], Value::int(4));
    }

    #[tokio::test]
    async fn navigation_instruction_reads_element_fields() {
        // [["pipeline", 0, ["id"]]] - pluck the "id" field of each element.
        let applicator = applicator_with(
            Vec::new(),
            vec![WireExpression::Pipeline {
                id: 0,
                path: Some(vec![PropertyKey::from("id")]),
                args: None,
            }],
        );

        let input = Value::Array(vec![
            Value::object([("id".to_string(), Value::from("a"))]),
            Value::object([("id".to_string(), Value::from("b"))]),
        ]);
        assert_eq!(
            applicator.execute(input).await,
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[tokio::test]
    async fn out_of_range_reference_is_bad_request() {
        let applicator = applicator_with(
            Vec::new(),
            vec![WireExpression::Pipeline {
                id: 4,
                path: None,
                args: None,
            }],
        );
        let result = applicator.execute(Value::Array(vec![Value::int(1)])).await;
        let Value::Array(items) = result else {
            panic!("expected array result")
        };
        assert!(
            matches!(&items[0], Value::Error(e) if e.code == crate::error::ErrorCode::BadRequest)
        );
    }

    #[tokio::test]
    async fn final_index_selects_earlier_result() {
        // Two instructions plus a final selector picking the first.
        let applicator = applicator_with(
            Vec::new(),
            vec![
                WireExpression::Pipeline {
                    id: 0,
                    path: Some(vec![PropertyKey::from("a")]),
                    args: None,
                },
                WireExpression::Pipeline {
                    id: 0,
                    path: Some(vec![PropertyKey::from("b")]),
                    args: None,
                },
                WireExpression::int(1),
            ],
        );

        let input = Value::Array(vec![Value::object([
            ("a".to_string(), Value::from("first")),
            ("b".to_string(), Value::from("second")),
        ])]);
        assert_eq!(
            applicator.execute(input).await,
            Value::Array(vec![Value::from("first")])
        );
    }

    #[test]
    fn builder_interns_captures() {
        let stub = Stub::from_target(Arc::new(Doubler));
        let mut builder = RemapBuilder::new();
        assert_eq!(builder.capture(&stub), -1);
        assert_eq!(builder.capture(&stub), -1);
        let dup = stub.dup();
        // Same hook through a dup'd handle still interns.
        assert_eq!(builder.capture(&dup), -1);
    }

    #[test]
    fn builder_records_instruction_indices() {
        let mut builder = RemapBuilder::new();
        let input = builder.input();
        let first = builder.get(input, vec![PropertyKey::from("id")]);
        assert_eq!(first, 1);
        let second = builder.call(-1, Vec::new(), vec![RemapBuilder::var(first)]);
        assert_eq!(second, 2);
    }
}
