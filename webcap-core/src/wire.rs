// Cap'n Web wire protocol: newline-delimited JSON arrays.
// Each message is an array whose first element is the message tag; expression
// trees ride inside push/resolve/reject/abort. Literal arrays in value
// position are escaped as [[...]] so they cannot be mistaken for tagged forms.

use crate::error::RpcError;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;
use tracing::{trace, warn};

/// A property key in a navigation path: either a string key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(String),
    Number(usize),
}

impl PropertyKey {
    pub fn to_json(&self) -> JsonValue {
        match self {
            PropertyKey::String(s) => JsonValue::String(s.clone()),
            PropertyKey::Number(n) => JsonValue::Number(Number::from(*n)),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        if let Some(s) = value.as_str() {
            Ok(PropertyKey::String(s.to_string()))
        } else if let Some(n) = value.as_u64() {
            Ok(PropertyKey::Number(n as usize))
        } else {
            Err(RpcError::bad_request(format!(
                "property key must be string or unsigned integer: {}",
                value
            )))
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::String(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        PropertyKey::String(s)
    }
}

impl From<usize> for PropertyKey {
    fn from(n: usize) -> Self {
        PropertyKey::Number(n)
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A capture reference in a remap expression, given from the sender's
/// perspective: `["import", id]` names the sender's import (the recipient's
/// export), `["export", id]` announces a fresh export of the sender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureRef {
    Import(i64),
    Export(i64),
}

impl CaptureRef {
    pub fn to_json(&self) -> JsonValue {
        let (tag, id) = match self {
            CaptureRef::Import(id) => ("import", *id),
            CaptureRef::Export(id) => ("export", *id),
        };
        JsonValue::Array(vec![
            JsonValue::String(tag.into()),
            JsonValue::Number(Number::from(id)),
        ])
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        let arr = value
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| RpcError::bad_request("capture must be [\"import\"|\"export\", id]"))?;
        let id = arr[1]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request("capture ID must be an integer"))?;
        match arr[0].as_str() {
            Some("import") => Ok(CaptureRef::Import(id)),
            Some("export") => Ok(CaptureRef::Export(id)),
            _ => Err(RpcError::bad_request("capture tag must be import or export")),
        }
    }
}

/// Wire expression grammar.
///
/// `Array` always denotes a *literal* array; the `[[...]]` escape is applied
/// on encode and stripped on decode, at every depth, so tagged forms and
/// literal arrays never collide.
#[derive(Debug, Clone, PartialEq)]
pub enum WireExpression {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<WireExpression>),
    Object(HashMap<String, WireExpression>),

    /// `["date", ms]` - milliseconds since the Unix epoch.
    Date(i64),

    /// `["error", type, message, stack?, data?]`
    Error {
        error_type: String,
        message: String,
        stack: Option<String>,
        data: Option<JsonValue>,
    },

    /// `["import", id, path?, args?]` - a stub on the sender's import.
    Import {
        id: i64,
        path: Option<Vec<PropertyKey>>,
        args: Option<Box<WireExpression>>,
    },

    /// `["pipeline", id, path?, args?]` - the promise variant of `Import`,
    /// awaited before delivery to the application.
    Pipeline {
        id: i64,
        path: Option<Vec<PropertyKey>>,
        args: Option<Box<WireExpression>>,
    },

    /// `["export", id]` - the sender announces (or re-announces) an export.
    Export { id: i64 },

    /// `["promise", id]` - promise variant of `Export`.
    Promise { id: i64 },

    /// `["remap", id, path, captures, instructions]` - the map sub-language.
    Remap {
        id: i64,
        path: Option<Vec<PropertyKey>>,
        captures: Vec<CaptureRef>,
        instructions: Vec<WireExpression>,
    },
}

impl WireExpression {
    /// Decode an expression from its JSON representation.
    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        match value {
            JsonValue::Null => Ok(WireExpression::Null),
            JsonValue::Bool(b) => Ok(WireExpression::Bool(*b)),
            JsonValue::Number(n) => Ok(WireExpression::Number(n.clone())),
            JsonValue::String(s) => Ok(WireExpression::String(s.clone())),
            JsonValue::Object(obj) => {
                let map = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), WireExpression::from_json(v)?)))
                    .collect::<Result<HashMap<_, _>, RpcError>>()?;
                Ok(WireExpression::Object(map))
            }
            JsonValue::Array(arr) => Self::from_json_array(arr),
        }
    }

    fn from_json_array(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.is_empty() {
            return Ok(WireExpression::Array(Vec::new()));
        }

        // [[...]] - either an escaped literal array or a nested special form.
        if arr.len() == 1 {
            if let JsonValue::Array(inner) = &arr[0] {
                if is_valid_special_form(inner) {
                    return Self::from_json_array(inner);
                }
                let items = inner
                    .iter()
                    .map(WireExpression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(WireExpression::Array(items));
            }
        }

        if let Some(tag) = arr[0].as_str() {
            return Self::parse_special_form(tag, arr);
        }

        // Arrays whose head is not a string cannot be tagged forms; they only
        // appear unescaped in structural positions fed back through here.
        let items = arr
            .iter()
            .map(WireExpression::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WireExpression::Array(items))
    }

    fn parse_special_form(tag: &str, arr: &[JsonValue]) -> Result<Self, RpcError> {
        trace!(tag, len = arr.len(), "parsing special form");
        match tag {
            "date" => {
                if arr.len() != 2 {
                    return Err(RpcError::bad_request("date requires exactly 2 elements"));
                }
                let ms = arr[1]
                    .as_f64()
                    .ok_or_else(|| RpcError::bad_request("date timestamp must be a number"))?;
                Ok(WireExpression::Date(ms as i64))
            }

            "error" => {
                if arr.len() < 3 || arr.len() > 5 {
                    return Err(RpcError::bad_request("error requires 3-5 elements"));
                }
                let error_type = arr[1]
                    .as_str()
                    .ok_or_else(|| RpcError::bad_request("error type must be a string"))?
                    .to_string();
                let message = arr[2]
                    .as_str()
                    .ok_or_else(|| RpcError::bad_request("error message must be a string"))?
                    .to_string();
                let stack = arr.get(3).and_then(|v| v.as_str()).map(|s| s.to_string());
                let data = arr.get(4).filter(|v| !v.is_null()).cloned();
                Ok(WireExpression::Error {
                    error_type,
                    message,
                    stack,
                    data,
                })
            }

            "import" | "pipeline" => {
                if arr.len() < 2 || arr.len() > 4 {
                    return Err(RpcError::bad_request(format!(
                        "{} requires 2-4 elements",
                        tag
                    )));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or_else(|| RpcError::bad_request(format!("{} ID must be an integer", tag)))?;
                let path = parse_optional_path(arr.get(2))?;
                let args = arr
                    .get(3)
                    .filter(|v| !v.is_null())
                    .map(WireExpression::from_json)
                    .transpose()?
                    .map(Box::new);
                if tag == "import" {
                    Ok(WireExpression::Import { id, path, args })
                } else {
                    Ok(WireExpression::Pipeline { id, path, args })
                }
            }

            "export" | "promise" => {
                if arr.len() != 2 {
                    return Err(RpcError::bad_request(format!(
                        "{} requires exactly 2 elements",
                        tag
                    )));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or_else(|| RpcError::bad_request(format!("{} ID must be an integer", tag)))?;
                if tag == "export" {
                    Ok(WireExpression::Export { id })
                } else {
                    Ok(WireExpression::Promise { id })
                }
            }

            "remap" => {
                if arr.len() != 5 {
                    return Err(RpcError::bad_request("remap requires exactly 5 elements"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or_else(|| RpcError::bad_request("remap ID must be an integer"))?;
                let path = parse_optional_path(arr.get(2))?;
                let captures = arr[3]
                    .as_array()
                    .ok_or_else(|| RpcError::bad_request("remap captures must be an array"))?
                    .iter()
                    .map(CaptureRef::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                let instructions = arr[4]
                    .as_array()
                    .ok_or_else(|| RpcError::bad_request("remap instructions must be an array"))?
                    .iter()
                    .map(WireExpression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(WireExpression::Remap {
                    id,
                    path,
                    captures,
                    instructions,
                })
            }

            _ => {
                warn!(tag, "unknown expression tag");
                Err(RpcError::bad_request(format!(
                    "unknown expression tag: {}",
                    tag
                )))
            }
        }
    }

    /// Encode to the JSON wire representation, applying the literal-array
    /// escape recursively.
    pub fn to_json(&self) -> JsonValue {
        match self {
            WireExpression::Null => JsonValue::Null,
            WireExpression::Bool(b) => JsonValue::Bool(*b),
            WireExpression::Number(n) => JsonValue::Number(n.clone()),
            WireExpression::String(s) => JsonValue::String(s.clone()),

            WireExpression::Array(items) => {
                let inner: Vec<JsonValue> = items.iter().map(|e| e.to_json()).collect();
                JsonValue::Array(vec![JsonValue::Array(inner)])
            }

            WireExpression::Object(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }

            WireExpression::Date(ms) => JsonValue::Array(vec![
                JsonValue::String("date".into()),
                JsonValue::Number(Number::from(*ms)),
            ]),

            WireExpression::Error {
                error_type,
                message,
                stack,
                data,
            } => {
                let mut arr = vec![
                    JsonValue::String("error".into()),
                    JsonValue::String(error_type.clone()),
                    JsonValue::String(message.clone()),
                ];
                match (stack, data) {
                    (Some(s), Some(d)) => {
                        arr.push(JsonValue::String(s.clone()));
                        arr.push(d.clone());
                    }
                    (Some(s), None) => arr.push(JsonValue::String(s.clone())),
                    // Null placeholder keeps the data field in position four.
                    (None, Some(d)) => {
                        arr.push(JsonValue::Null);
                        arr.push(d.clone());
                    }
                    (None, None) => {}
                }
                JsonValue::Array(arr)
            }

            WireExpression::Import { id, path, args } => {
                import_like_to_json("import", *id, path, args)
            }
            WireExpression::Pipeline { id, path, args } => {
                import_like_to_json("pipeline", *id, path, args)
            }

            WireExpression::Export { id } => JsonValue::Array(vec![
                JsonValue::String("export".into()),
                JsonValue::Number(Number::from(*id)),
            ]),

            WireExpression::Promise { id } => JsonValue::Array(vec![
                JsonValue::String("promise".into()),
                JsonValue::Number(Number::from(*id)),
            ]),

            WireExpression::Remap {
                id,
                path,
                captures,
                instructions,
            } => JsonValue::Array(vec![
                JsonValue::String("remap".into()),
                JsonValue::Number(Number::from(*id)),
                path_to_json(path),
                JsonValue::Array(captures.iter().map(|c| c.to_json()).collect()),
                JsonValue::Array(instructions.iter().map(|i| i.to_json()).collect()),
            ]),
        }
    }

    /// Convenience constructor for integer literals.
    pub fn int(n: i64) -> Self {
        WireExpression::Number(Number::from(n))
    }
}

/// Is `arr` a structurally valid special form? Used to disambiguate the
/// single-element escape `[[...]]` from a nested tagged expression.
fn is_valid_special_form(arr: &[JsonValue]) -> bool {
    let Some(tag) = arr.first().and_then(|v| v.as_str()) else {
        return false;
    };
    match tag {
        "error" => arr.len() >= 3 && arr.len() <= 5,
        "export" | "promise" | "date" => arr.len() == 2,
        "import" | "pipeline" => (2..=4).contains(&arr.len()),
        "remap" => arr.len() == 5,
        _ => false,
    }
}

fn parse_optional_path(value: Option<&JsonValue>) -> Result<Option<Vec<PropertyKey>>, RpcError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Array(keys)) => Ok(Some(
            keys.iter()
                .map(PropertyKey::from_json)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Some(other) => Err(RpcError::bad_request(format!(
            "property path must be an array: {}",
            other
        ))),
    }
}

fn path_to_json(path: &Option<Vec<PropertyKey>>) -> JsonValue {
    match path {
        Some(keys) => JsonValue::Array(keys.iter().map(|k| k.to_json()).collect()),
        None => JsonValue::Null,
    }
}

fn import_like_to_json(
    tag: &str,
    id: i64,
    path: &Option<Vec<PropertyKey>>,
    args: &Option<Box<WireExpression>>,
) -> JsonValue {
    let mut arr = vec![
        JsonValue::String(tag.into()),
        JsonValue::Number(Number::from(id)),
    ];
    match (path, args) {
        (Some(p), Some(a)) => {
            arr.push(JsonValue::Array(p.iter().map(|k| k.to_json()).collect()));
            arr.push(a.to_json());
        }
        (Some(p), None) => {
            arr.push(JsonValue::Array(p.iter().map(|k| k.to_json()).collect()));
        }
        (None, Some(a)) => {
            arr.push(JsonValue::Array(Vec::new()));
            arr.push(a.to_json());
        }
        (None, None) => {}
    }
    JsonValue::Array(arr)
}

/// Top-level wire messages, one NDJSON line each.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// `["push", expr]`
    Push(WireExpression),
    /// `["pull", import_id]`
    Pull(i64),
    /// `["resolve", export_id, expr]`
    Resolve(i64, WireExpression),
    /// `["reject", export_id, expr]`
    Reject(i64, WireExpression),
    /// `["release", import_id, refcount]`
    Release { id: i64, refcount: u32 },
    /// `["abort", expr]`
    Abort(WireExpression),
}

impl WireMessage {
    pub fn from_json_array(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.is_empty() {
            return Err(RpcError::bad_request("empty message array"));
        }
        let tag = arr[0]
            .as_str()
            .ok_or_else(|| RpcError::bad_request("message tag must be a string"))?;

        match tag {
            "push" => {
                if arr.len() != 2 {
                    return Err(RpcError::bad_request("push requires exactly 2 elements"));
                }
                Ok(WireMessage::Push(WireExpression::from_json(&arr[1])?))
            }
            "pull" => {
                if arr.len() != 2 {
                    return Err(RpcError::bad_request("pull requires exactly 2 elements"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or_else(|| RpcError::bad_request("pull requires an integer import ID"))?;
                Ok(WireMessage::Pull(id))
            }
            "resolve" | "reject" => {
                if arr.len() != 3 {
                    return Err(RpcError::bad_request(format!(
                        "{} requires exactly 3 elements",
                        tag
                    )));
                }
                let id = arr[1].as_i64().ok_or_else(|| {
                    RpcError::bad_request(format!("{} requires an integer export ID", tag))
                })?;
                let expr = WireExpression::from_json(&arr[2])?;
                if tag == "resolve" {
                    Ok(WireMessage::Resolve(id, expr))
                } else {
                    Ok(WireMessage::Reject(id, expr))
                }
            }
            "release" => {
                if arr.len() != 3 {
                    return Err(RpcError::bad_request("release requires exactly 3 elements"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or_else(|| RpcError::bad_request("release requires an integer import ID"))?;
                let refcount = arr[2]
                    .as_u64()
                    .ok_or_else(|| RpcError::bad_request("release refcount must be unsigned"))?;
                Ok(WireMessage::Release {
                    id,
                    refcount: refcount as u32,
                })
            }
            "abort" => {
                if arr.len() != 2 {
                    return Err(RpcError::bad_request("abort requires exactly 2 elements"));
                }
                Ok(WireMessage::Abort(WireExpression::from_json(&arr[1])?))
            }
            _ => {
                warn!(tag, "unknown message tag");
                Err(RpcError::bad_request(format!("unknown message tag: {}", tag)))
            }
        }
    }

    pub fn to_json_array(&self) -> Vec<JsonValue> {
        match self {
            WireMessage::Push(expr) => {
                vec![JsonValue::String("push".into()), expr.to_json()]
            }
            WireMessage::Pull(id) => vec![
                JsonValue::String("pull".into()),
                JsonValue::Number(Number::from(*id)),
            ],
            WireMessage::Resolve(id, expr) => vec![
                JsonValue::String("resolve".into()),
                JsonValue::Number(Number::from(*id)),
                expr.to_json(),
            ],
            WireMessage::Reject(id, expr) => vec![
                JsonValue::String("reject".into()),
                JsonValue::Number(Number::from(*id)),
                expr.to_json(),
            ],
            WireMessage::Release { id, refcount } => vec![
                JsonValue::String("release".into()),
                JsonValue::Number(Number::from(*id)),
                JsonValue::Number(Number::from(*refcount)),
            ],
            WireMessage::Abort(expr) => {
                vec![JsonValue::String("abort".into()), expr.to_json()]
            }
        }
    }

    /// Parse one NDJSON line.
    pub fn parse_line(line: &str) -> Result<Self, RpcError> {
        let json: JsonValue = serde_json::from_str(line.trim())
            .map_err(|e| RpcError::bad_request(format!("invalid JSON frame: {}", e)))?;
        let arr = json
            .as_array()
            .ok_or_else(|| RpcError::bad_request("message must be a JSON array"))?;
        Self::from_json_array(arr)
    }

    /// Serialize to one NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(&JsonValue::Array(self.to_json_array()))
            .expect("wire messages are always JSON-serializable")
    }
}

/// Parse a newline-delimited batch of messages. Blank lines are skipped.
pub fn parse_wire_batch(input: &str) -> Result<Vec<WireMessage>, RpcError> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(WireMessage::parse_line)
        .collect()
}

/// Serialize messages to newline-delimited form.
pub fn serialize_wire_batch(messages: &[WireMessage]) -> String {
    messages
        .iter()
        .map(WireMessage::to_line)
        .collect::<Vec<_>>()
        .join("\n")
}
