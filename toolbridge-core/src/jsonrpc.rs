//! JSON-RPC 2.0 envelope classification and construction.
//!
//! Every component of the gateway speaks in `serde_json::Value` envelopes,
//! since ids are rewritten and payloads are reshaped in flight. This module
//! is the one place that decides what a well-formed envelope looks like and
//! how to build one.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::FramingError;

/// Protocol version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Tool-protocol revision announced in both `initialize` directions.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request ID.
///
/// The exact type is preserved so that a caller who sent `"id": 1` gets
/// `"id": 1` back, never `"id": "1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID, valid but unusual
    Null,
}

impl JsonRpcId {
    /// Convert back into a JSON value for embedding in an envelope.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Null => Value::Null,
        }
    }

    /// The integer form, if this id is numeric.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<i64> for JsonRpcId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Null => write!(f, "null"),
        }
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_id(&value).map_err(|_| {
            serde::de::Error::custom("JSON-RPC ID must be string, integer, or null")
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of a validated envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonRpcMessageKind {
    /// Has both `id` and `method`; a response is expected.
    Request { id: JsonRpcId, method: String },
    /// Has `id` and exactly one of `result`/`error`.
    Response { id: JsonRpcId },
    /// Has `method` but no `id`.
    Notification { method: String },
}

/// Errors that can occur during JSON-RPC message classification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JsonRpcClassifyError {
    /// The envelope is not a JSON object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("missing or invalid jsonrpc version field")]
    InvalidVersion,
    /// The `id` field is present but not a string, integer, or null.
    #[error("invalid id field")]
    InvalidId,
    /// A response carries both or neither of `result` and `error`.
    #[error("response must carry exactly one of result or error")]
    AmbiguousResponse,
    /// The message has neither `id` nor `method`.
    #[error("message has neither id nor method")]
    Unclassifiable,
}

/// Classify a parsed envelope without taking ownership.
///
/// # Errors
///
/// Returns [`JsonRpcClassifyError`] if the value is not an object, the
/// version is not `"2.0"`, the id has an invalid type, a response carries
/// both or neither of `result`/`error`, or the value matches no shape.
pub fn classify_jsonrpc(value: &Value) -> Result<JsonRpcMessageKind, JsonRpcClassifyError> {
    let obj = value.as_object().ok_or(JsonRpcClassifyError::NotAnObject)?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(JsonRpcClassifyError::InvalidVersion);
    }

    let id = obj
        .get("id")
        .map(parse_id)
        .transpose()
        .map_err(|_| JsonRpcClassifyError::InvalidId)?;
    let method = obj.get("method").and_then(Value::as_str).map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Ok(JsonRpcMessageKind::Request { id, method }),
        (Some(id), None) => {
            let has_result = obj.contains_key("result");
            let has_error = obj.contains_key("error");
            if has_result == has_error {
                return Err(JsonRpcClassifyError::AmbiguousResponse);
            }
            Ok(JsonRpcMessageKind::Response { id })
        }
        (None, Some(method)) => Ok(JsonRpcMessageKind::Notification { method }),
        (None, None) => Err(JsonRpcClassifyError::Unclassifiable),
    }
}

/// True when the value classifies as any valid envelope.
pub fn validate(value: &Value) -> bool {
    classify_jsonrpc(value).is_ok()
}

pub fn is_request(value: &Value) -> bool {
    matches!(
        classify_jsonrpc(value),
        Ok(JsonRpcMessageKind::Request { .. })
    )
}

pub fn is_response(value: &Value) -> bool {
    matches!(
        classify_jsonrpc(value),
        Ok(JsonRpcMessageKind::Response { .. })
    )
}

pub fn is_notification(value: &Value) -> bool {
    matches!(
        classify_jsonrpc(value),
        Ok(JsonRpcMessageKind::Notification { .. })
    )
}

/// Parse a JSON value into a `JsonRpcId`.
///
/// Accepts string, integer, or null. Rejects floats, booleans, arrays, objects.
fn parse_id(value: &Value) -> Result<JsonRpcId, ()> {
    match value {
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number).ok_or(()),
        Value::String(s) => Ok(JsonRpcId::String(s.clone())),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(()),
    }
}

/// Read the `id` member of an envelope, if it has a valid one.
pub fn envelope_id(value: &Value) -> Option<JsonRpcId> {
    value.get("id").and_then(|v| parse_id(v).ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire text
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one unit of wire text into a JSON object.
///
/// Classification is left to the caller so that a request-shaped but
/// invalid envelope can still be answered with its own id.
///
/// # Errors
///
/// Returns [`FramingError::MalformedJson`] for empty or unparseable input
/// and [`FramingError::UnsupportedBatch`] for JSON arrays.
pub fn parse_message(text: &str) -> Result<Value, FramingError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(FramingError::MalformedJson {
            reason: "empty message".to_string(),
        });
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;

    if value.is_array() {
        return Err(FramingError::UnsupportedBatch);
    }
    if !value.is_object() {
        return Err(FramingError::MalformedJson {
            reason: "top-level value is not an object".to_string(),
        });
    }
    Ok(value)
}

/// Serialize an envelope to compact single-line JSON.
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains a literal newline.
pub fn format_message(value: &Value) -> String {
    value.to_string()
}

/// Serialized size in bytes of the compact form.
pub fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Builders
// ─────────────────────────────────────────────────────────────────────────────

pub fn build_request(id: impl Into<JsonRpcId>, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.into(),
        "method": method,
        "params": params,
    })
}

pub fn build_notification(method: &str, params: Option<Value>) -> Value {
    let mut msg = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let (Some(params), Some(obj)) = (params, msg.as_object_mut()) {
        obj.insert("params".to_string(), params);
    }
    msg
}

pub fn build_success(id: &JsonRpcId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response envelope.
///
/// Pass [`JsonRpcId::Null`] when the request id could not be recovered.
pub fn build_error_response(
    id: &JsonRpcId,
    code: i32,
    message: impl Into<String>,
    data: Option<Value>,
) -> Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let (Some(data), Some(obj)) = (data, error.as_object_mut()) {
        obj.insert("data".to_string(), data);
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

/// Replace the `id` member of an envelope in place.
pub fn set_id(value: &mut Value, id: &JsonRpcId) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("id".to_string(), id.to_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_request() {
        let val = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}});
        let kind = classify_jsonrpc(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Request {
                id: JsonRpcId::Number(1),
                method: "tools/call".to_string()
            }
        );
        assert!(is_request(&val));
        assert!(!is_response(&val));
        assert!(!is_notification(&val));
    }

    #[test]
    fn test_classify_response() {
        let val = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        assert_eq!(
            classify_jsonrpc(&val).unwrap(),
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(1)
            }
        );
        assert!(is_response(&val));
    }

    #[test]
    fn test_classify_notification() {
        let val = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(is_notification(&val));
        assert!(!is_request(&val));
    }

    #[test]
    fn test_classify_response_with_both_result_and_error() {
        let val = json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::AmbiguousResponse
        );
    }

    #[test]
    fn test_classify_response_with_neither_result_nor_error() {
        let val = json!({"jsonrpc": "2.0", "id": 1});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::AmbiguousResponse
        );
        assert!(!validate(&val));
    }

    #[test]
    fn test_classify_wrong_version() {
        let val = json!({"jsonrpc": "1.0", "id": 1, "method": "x"});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidVersion
        );
        let val = json!({"id": 1, "method": "x"});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidVersion
        );
    }

    #[test]
    fn test_classify_not_object() {
        assert_eq!(
            classify_jsonrpc(&json!("hello")).unwrap_err(),
            JsonRpcClassifyError::NotAnObject
        );
    }

    #[test]
    fn test_classify_invalid_id_type() {
        let val = json!({"jsonrpc": "2.0", "id": true, "method": "x"});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidId
        );
        let val = json!({"jsonrpc": "2.0", "id": 1.5, "method": "x"});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidId
        );
    }

    #[test]
    fn test_classify_unclassifiable() {
        let val = json!({"jsonrpc": "2.0"});
        assert_eq!(
            classify_jsonrpc(&val).unwrap_err(),
            JsonRpcClassifyError::Unclassifiable
        );
    }

    #[test]
    fn test_string_and_null_ids_preserved() {
        let val = json!({"jsonrpc": "2.0", "id": "abc-123", "method": "ping"});
        assert_eq!(envelope_id(&val), Some(JsonRpcId::String("abc-123".into())));

        let val = json!({"jsonrpc": "2.0", "id": null, "result": "ok"});
        assert_eq!(envelope_id(&val), Some(JsonRpcId::Null));
    }

    #[test]
    fn test_parse_message_rejects_batch_and_empty() {
        assert!(matches!(
            parse_message("[{\"jsonrpc\":\"2.0\"}]"),
            Err(FramingError::UnsupportedBatch)
        ));
        assert!(matches!(
            parse_message("   "),
            Err(FramingError::MalformedJson { ref reason }) if reason == "empty message"
        ));
        assert!(matches!(
            parse_message("{\"truncated"),
            Err(FramingError::MalformedJson { .. })
        ));
        assert!(matches!(
            parse_message("42"),
            Err(FramingError::MalformedJson { .. })
        ));
    }

    #[test]
    fn test_format_message_is_single_line() {
        let val = json!({"jsonrpc": "2.0", "method": "log", "params": {"text": "a\nb"}});
        let line = format_message(&val);
        assert!(!line.contains('\n'));
        assert_eq!(parse_message(&line).unwrap(), val);
    }

    #[test]
    fn test_build_error_response() {
        let resp = build_error_response(
            &JsonRpcId::String("req-1".into()),
            -32601,
            "no route",
            Some(json!({"tool": "x"})),
        );
        assert_eq!(resp["id"], "req-1");
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["error"]["data"]["tool"], "x");
        assert!(is_response(&resp));

        let resp = build_error_response(&JsonRpcId::Null, -32700, "Parse error", None);
        assert!(resp["id"].is_null());
        assert!(resp["error"].get("data").is_none());
    }

    #[test]
    fn test_build_notification_without_params() {
        let n = build_notification("notifications/initialized", None);
        assert!(n.get("params").is_none());
        assert!(is_notification(&n));
    }

    #[test]
    fn test_set_id_rewrites_in_place() {
        let mut msg = build_request(10001, "tools/list", json!({}));
        set_id(&mut msg, &JsonRpcId::String("cloud-7".into()));
        assert_eq!(msg["id"], "cloud-7");
    }
}
