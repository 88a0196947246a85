//! JSON-RPC 2.0 error object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::{JsonRpcId, build_error_response};

/// JSON-RPC 2.0 error object.
///
/// Embedded in error responses. Backend-originated errors are forwarded
/// untouched as raw JSON; this type is used for errors the gateway
/// synthesizes itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard or gateway-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional structured error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Wrap into a response envelope with the given id.
    pub fn into_response(self, id: &JsonRpcId) -> Value {
        build_error_response(id, self.code, self.message, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonrpc_error_serialization() {
        let error = JsonRpcError {
            code: -32601,
            message: "no backend found for tool 'x'".to_string(),
            data: Some(json!({"tool": "x"})),
        };

        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["code"], -32601);
        assert_eq!(json["data"]["tool"], "x");
    }

    #[test]
    fn test_error_without_data() {
        let error = JsonRpcError {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        };

        let json = serde_json::to_string(&error).unwrap();

        // data field should be omitted when None
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_into_response_keeps_id_type() {
        let resp = JsonRpcError {
            code: -32000,
            message: "down".into(),
            data: None,
        }
        .into_response(&JsonRpcId::Number(42));
        assert_eq!(resp["id"], 42);
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["error"]["message"], "down");
    }
}
