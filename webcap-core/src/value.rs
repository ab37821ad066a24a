use crate::error::RpcError;
use crate::stubs::{RpcPromise, Stub};
use crate::wire::PropertyKey;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;

/// An application-level RPC value.
///
/// Clones are shallow with respect to capabilities: a cloned `Stub`/`Promise`
/// shares its hook without taking a refcount. Use
/// [`Payload::ensure_owned`](crate::payload::Payload::ensure_owned) when a
/// counted copy is required.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Box<Value>>),
    /// Milliseconds since the Unix epoch, distinguished from plain integers
    /// on the wire.
    Date(i64),
    Error(RpcError),
    Stub(Stub),
    Promise(RpcPromise),
}

impl Value {
    pub fn int(n: i64) -> Self {
        Value::Number(Number::from(n))
    }

    pub fn float(f: f64) -> Self {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn object(fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, Box::new(v)))
                .collect(),
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Walk a property path through containers.
    pub fn navigate(&self, path: &[PropertyKey]) -> Result<&Value, RpcError> {
        let mut current = self;
        for key in path {
            current = match (current, key) {
                (Value::Object(map), PropertyKey::String(name)) => map
                    .get(name)
                    .map(|b| b.as_ref())
                    .ok_or_else(|| RpcError::not_found(format!("property {} not found", name)))?,
                (Value::Array(items), PropertyKey::Number(index)) => items.get(*index).ok_or_else(
                    || RpcError::not_found(format!("index {} out of bounds", index)),
                )?,
                (_, key) => {
                    return Err(RpcError::not_found(format!(
                        "cannot navigate {} through non-container",
                        key
                    )))
                }
            };
        }
        Ok(current)
    }

    /// Does this value tree contain any stub or promise?
    pub fn contains_capabilities(&self) -> bool {
        match self {
            Value::Stub(_) | Value::Promise(_) => true,
            Value::Array(items) => items.iter().any(Value::contains_capabilities),
            Value::Object(map) => map.values().any(|v| v.contains_capabilities()),
            _ => false,
        }
    }
}

/// Plain JSON converts without capabilities; used by targets building results.
impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Box::new(Value::from(v))))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Structural equality; stubs and promises compare by hook identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Stub(a), Value::Stub(b)) => a.same_hook(b.hook()),
            (Value::Promise(a), Value::Promise(b)) => a.same_hook(b.hook()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigate_object_and_array() {
        let value = Value::object([
            (
                "user".to_string(),
                Value::object([(
                    "tags".to_string(),
                    Value::Array(vec![Value::from("a"), Value::from("b")]),
                )]),
            ),
        ]);

        let path = vec![
            PropertyKey::from("user"),
            PropertyKey::from("tags"),
            PropertyKey::from(1usize),
        ];
        assert_eq!(value.navigate(&path).unwrap(), &Value::from("b"));
    }

    #[test]
    fn navigate_missing_key_is_not_found() {
        let value = Value::object([("a".to_string(), Value::int(1))]);
        let err = value.navigate(&[PropertyKey::from("b")]).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn navigate_through_scalar_fails() {
        let value = Value::int(7);
        assert!(value.navigate(&[PropertyKey::from("x")]).is_err());
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let value = Value::from(serde_json::json!({"id": "u_1", "n": 3, "xs": [1, 2]}));
        assert_eq!(
            value.navigate(&[PropertyKey::from("id")]).unwrap(),
            &Value::from("u_1")
        );
        assert_eq!(
            value
                .navigate(&[PropertyKey::from("xs"), PropertyKey::from(0usize)])
                .unwrap(),
            &Value::int(1)
        );
    }

    #[test]
    fn capability_detection() {
        assert!(!Value::Array(vec![Value::int(1)]).contains_capabilities());
    }
}
