//! Value-to-wire serializer.
//!
//! Walks an application value and emits the matching expression tree. This
//! is the only place where new exports are minted: every stub or promise
//! encountered either refers back to one of this session's imports (emitted
//! as `["import"|"pipeline", id, path]`) or is exported, bumping the entry's
//! introduction count.

use crate::error::RpcError;
use crate::hooks::{RemoteRef, StubHook};
use crate::session::SessionCore;
use crate::value::Value;
use crate::wire::WireExpression;
use std::sync::Arc;

pub struct Serializer<'s> {
    session: &'s Arc<SessionCore>,
}

impl<'s> Serializer<'s> {
    pub fn new(session: &'s Arc<SessionCore>) -> Self {
        Serializer { session }
    }

    pub fn serialize_value(&self, value: &Value) -> Result<WireExpression, RpcError> {
        match value {
            Value::Null => Ok(WireExpression::Null),
            Value::Bool(b) => Ok(WireExpression::Bool(*b)),
            Value::Number(n) => Ok(WireExpression::Number(n.clone())),
            Value::String(s) => Ok(WireExpression::String(s.clone())),
            Value::Date(ms) => Ok(WireExpression::Date(*ms)),

            Value::Array(items) => Ok(WireExpression::Array(
                items
                    .iter()
                    .map(|item| self.serialize_value(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),

            Value::Object(map) => Ok(WireExpression::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.serialize_value(v)?)))
                    .collect::<Result<_, RpcError>>()?,
            )),

            Value::Error(error) => Ok(self.session.error_to_wire(error)),

            Value::Stub(stub) => {
                let hook = stub.hook();
                match self.own_remote_ref(hook) {
                    Some(remote) => Ok(WireExpression::Import {
                        id: remote.id.0,
                        path: if remote.path.is_empty() {
                            None
                        } else {
                            Some(remote.path)
                        },
                        args: None,
                    }),
                    None => {
                        let id = self.session.export_stub(hook);
                        Ok(WireExpression::Export { id: id.0 })
                    }
                }
            }

            Value::Promise(promise) => {
                let hook = promise.hook();
                match self.own_remote_ref(hook) {
                    Some(remote) => Ok(WireExpression::Pipeline {
                        id: remote.id.0,
                        path: if remote.path.is_empty() {
                            None
                        } else {
                            Some(remote.path)
                        },
                        args: None,
                    }),
                    None => {
                        let id = self.session.export_promise(hook);
                        Ok(WireExpression::Promise { id: id.0 })
                    }
                }
            }
        }
    }

    /// A remote reference is only passed back if it belongs to this very
    /// session; a stub imported over some other session must be re-exported.
    fn own_remote_ref(&self, hook: &Arc<dyn StubHook>) -> Option<RemoteRef> {
        let remote = hook.remote_ref()?;
        if std::sync::Weak::ptr_eq(&remote.session, &self.session.weak()) {
            Some(remote)
        } else {
            None
        }
    }
}
