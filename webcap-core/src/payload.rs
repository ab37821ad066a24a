//! Value container with explicit ownership provenance.
//!
//! A payload records where its value came from so the kernel knows whether it
//! may be stored or must be copied first. Application-supplied parameters are
//! deep-copied exactly once; return values and parsed values are owned
//! outright and never copied again.

use crate::stubs::{RpcPromise, Stub};
use crate::value::Value;

/// Where a payload's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// From the application as call parameters. Must be copied before the
    /// value crosses an await point or is stored.
    Params,
    /// From the application as a return value. The kernel takes ownership.
    Return,
    /// Parsed off the wire or already copied. Safe to use as-is.
    Owned,
}

/// A value plus its provenance tag.
#[derive(Debug, Clone)]
pub struct Payload {
    value: Value,
    source: Provenance,
}

impl Payload {
    pub fn from_app_params(value: Value) -> Self {
        Payload {
            value,
            source: Provenance::Params,
        }
    }

    pub fn from_app_return(value: Value) -> Self {
        Payload {
            value,
            source: Provenance::Return,
        }
    }

    pub fn owned(value: Value) -> Self {
        Payload {
            value,
            source: Provenance::Owned,
        }
    }

    pub fn source(&self) -> Provenance {
        self.source
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Take ownership of the value, copying first if required.
    pub fn into_value(mut self) -> Value {
        self.ensure_owned();
        self.value
    }

    /// Make this payload safe to store: deep-copy `Params` data (duplicating
    /// every contained capability so each copy holds its own refcount) and
    /// transition to `Owned`. `Return` and `Owned` payloads pass through
    /// untouched.
    pub fn ensure_owned(&mut self) {
        if self.source == Provenance::Params {
            self.value = deep_copy_with_dup(&self.value);
        }
        self.source = Provenance::Owned;
    }

    /// Dispose every capability in the payload, releasing refcounts.
    pub fn dispose(&mut self) {
        dispose_value(&self.value);
        self.value = Value::Null;
    }
}

/// Deep-copy a value tree, duplicating every contained capability so the
/// copy holds its own refcounts.
pub(crate) fn deep_copy_with_dup(value: &Value) -> Value {
    match value {
        Value::Stub(stub) => Value::Stub(Stub::adopt(stub.hook().clone().dup())),
        Value::Promise(promise) => Value::Promise(RpcPromise::adopt(promise.hook().clone().dup())),
        Value::Array(items) => Value::Array(items.iter().map(deep_copy_with_dup).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), Box::new(deep_copy_with_dup(v))))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Copy a navigated subtree out of a shared payload, taking refcounts on the
/// capabilities it contains.
pub(crate) fn copy_for_share(value: &Value) -> Value {
    deep_copy_with_dup(value)
}

/// Dispose every capability in a value tree.
pub(crate) fn dispose_tree(value: &Value) {
    dispose_value(value)
}

fn dispose_value(value: &Value) {
    match value {
        Value::Stub(stub) => stub.hook().clone().dispose(),
        Value::Promise(promise) => promise.hook().clone().dispose(),
        Value::Array(items) => items.iter().for_each(dispose_value),
        Value::Object(map) => map.values().for_each(|v| dispose_value(v)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_transition_to_owned() {
        let mut payload = Payload::from_app_params(Value::Array(vec![Value::int(1)]));
        assert_eq!(payload.source(), Provenance::Params);
        payload.ensure_owned();
        assert_eq!(payload.source(), Provenance::Owned);
        // A second call is a no-op.
        payload.ensure_owned();
        assert_eq!(payload.source(), Provenance::Owned);
    }

    #[test]
    fn return_values_are_not_copied() {
        let mut payload = Payload::from_app_return(Value::from("result"));
        payload.ensure_owned();
        assert_eq!(payload.value(), &Value::from("result"));
    }

    #[test]
    fn deep_copy_detaches_containers() {
        // Mutating the copy must not show through the original.
        let original = Value::Array(vec![Value::int(1), Value::int(2)]);
        let payload = Payload::from_app_params(original.clone());
        let mut copied = payload.into_value();
        if let Value::Array(items) = &mut copied {
            items.push(Value::int(3));
        }
        assert_eq!(original.as_array().unwrap().len(), 2);
    }
}
