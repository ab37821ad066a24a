//! Wire-to-value parser.
//!
//! Walks a decoded [`WireExpression`] and produces an owned [`Payload`],
//! installing import and promise hooks for the capability forms. This is a
//! pure transformation; all table state lives in the session.

use crate::error::{ErrorCode, RpcError};
use crate::hooks::StubHook;
use crate::ids::{ExportId, ImportId};
use crate::payload::Payload;
use crate::session::SessionCore;
use crate::stubs::{RpcPromise, Stub};
use crate::value::Value;
use crate::wire::{PropertyKey, WireExpression};
use std::sync::Arc;

pub struct Parser<'s> {
    session: &'s Arc<SessionCore>,
}

impl<'s> Parser<'s> {
    pub fn new(session: &'s Arc<SessionCore>) -> Self {
        Parser { session }
    }

    /// Parse an expression into an owned payload.
    pub fn parse(&self, expr: &WireExpression) -> Result<Payload, RpcError> {
        Ok(Payload::owned(self.parse_value(expr)?))
    }

    pub fn parse_value(&self, expr: &WireExpression) -> Result<Value, RpcError> {
        match expr {
            WireExpression::Null => Ok(Value::Null),
            WireExpression::Bool(b) => Ok(Value::Bool(*b)),
            WireExpression::Number(n) => Ok(Value::Number(n.clone())),
            WireExpression::String(s) => Ok(Value::String(s.clone())),
            WireExpression::Date(ms) => Ok(Value::Date(*ms)),

            WireExpression::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.parse_value(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),

            WireExpression::Object(map) => Ok(Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Box::new(self.parse_value(v)?))))
                    .collect::<Result<_, RpcError>>()?,
            )),

            WireExpression::Error {
                error_type,
                message,
                stack,
                data,
            } => Ok(Value::Error(RpcError {
                code: ErrorCode::from_tag(error_type),
                message: message.clone(),
                stack: stack.clone(),
                data: data.clone(),
            })),

            // The peer announces an export: install it in our import table.
            WireExpression::Export { id } => Ok(Value::Stub(Stub::adopt(
                self.session.import_capability(ImportId(*id)),
            ))),

            WireExpression::Promise { id } => Ok(Value::Promise(RpcPromise::adopt(
                self.session.import_promise(ImportId(*id)),
            ))),

            // The peer references its own import, i.e. our export.
            WireExpression::Import { id, path, args } => {
                let hook = self.resolve_export_ref(*id, path, args)?;
                Ok(Value::Stub(Stub::adopt(hook)))
            }

            WireExpression::Pipeline { id, path, args } => {
                let hook = self.resolve_export_ref(*id, path, args)?;
                Ok(Value::Promise(RpcPromise::adopt(hook)))
            }

            WireExpression::Remap { .. } => Err(RpcError::bad_request(
                "remap is only valid as a pushed expression",
            )),
        }
    }

    /// Look up our export named by the sender's import ID, navigating and
    /// applying arguments as requested.
    fn resolve_export_ref(
        &self,
        id: i64,
        path: &Option<Vec<PropertyKey>>,
        args: &Option<Box<WireExpression>>,
    ) -> Result<Arc<dyn StubHook>, RpcError> {
        let hook = self
            .session
            .exports
            .get(ExportId(id))
            .ok_or_else(|| RpcError::not_found(format!("unknown export {}", id)))?;
        let path = path.clone().unwrap_or_default();
        match args {
            Some(args) => {
                let payload = self.parse(args)?;
                Ok(hook.dup().call(path, payload))
            }
            None if path.is_empty() => Ok(hook.dup()),
            None => Ok(hook.dup().get(path)),
        }
    }
}
