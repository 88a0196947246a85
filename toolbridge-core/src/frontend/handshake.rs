//! Outer framing of the cloud endpoint protocol.
//!
//! The endpoint speaks a small typed envelope (`hello`, `mcp`) around the
//! JSON-RPC traffic, and may also send bare JSON-RPC. Everything here is
//! pure so the read loop only does I/O.

use serde_json::{Value, json};

use crate::config::ClientIdentity;
use crate::error::GatewayError;
use crate::jsonrpc::{
    JSONRPC_VERSION, JsonRpcId, JsonRpcMessageKind, PROTOCOL_VERSION, build_success,
    classify_jsonrpc,
};

/// Capability announcement sent right after the socket opens.
pub fn hello_message() -> Value {
    json!({
        "type": "hello",
        "version": 1,
        "features": {"mcp": true},
        "transport": "websocket",
        "audio_params": {
            "format": "opus",
            "sample_rate": 16000,
            "channels": 1,
            "frame_duration": 60,
        },
    })
}

/// What one inbound text frame means.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake acknowledgement.
    Hello { session_id: Option<String> },
    /// A valid JSON-RPC envelope, already unwrapped.
    Envelope { message: Value, kind: JsonRpcMessageKind },
    /// Malformed input that must be answered with this error response.
    Reject(Value),
    /// Anything else; logged and dropped.
    Ignore(&'static str),
}

/// Classify one text frame.
pub fn classify_frame(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let err = GatewayError::ParseError {
                details: e.to_string(),
            };
            return Frame::Reject(err.to_response(&JsonRpcId::Null));
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("hello") => {
            return Frame::Hello {
                session_id: value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }
        Some("mcp") => {
            return match value.get("payload") {
                Some(payload) => classify_envelope(payload.clone()),
                None => Frame::Ignore("mcp frame without payload"),
            };
        }
        _ => {}
    }

    if value.get("jsonrpc").is_some() {
        classify_envelope(value)
    } else {
        Frame::Ignore("not a tool-protocol frame")
    }
}

fn classify_envelope(message: Value) -> Frame {
    match classify_jsonrpc(&message) {
        Ok(kind) => Frame::Envelope { message, kind },
        Err(e) => match request_shaped_id(&message) {
            Some(id) => Frame::Reject(
                GatewayError::InvalidRequest {
                    details: e.to_string(),
                }
                .to_response(&id),
            ),
            None => Frame::Ignore("invalid envelope"),
        },
    }
}

/// The id of something that has both `method` and a usable `id`.
fn request_shaped_id(message: &Value) -> Option<JsonRpcId> {
    message.get("method")?;
    serde_json::from_value(message.get("id")?.clone()).ok()
}

/// Put an outbound message in the endpoint's framing.
///
/// JSON-RPC envelopes go bare; anything else is wrapped as `mcp` with the
/// session id when one is known.
pub fn wrap_outbound(message: Value, session_id: Option<&str>) -> Value {
    if message.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION) {
        return message;
    }
    let mut wrapped = json!({"type": "mcp", "payload": message});
    if let Some(id) = session_id {
        wrapped["session_id"] = Value::String(id.to_string());
    }
    wrapped
}

/// Requests the connection answers itself: `initialize` and `ping`.
pub fn local_reply(kind: &JsonRpcMessageKind, client: &ClientIdentity) -> Option<Value> {
    let JsonRpcMessageKind::Request { id, method } = kind else {
        return None;
    };
    match method.as_str() {
        "initialize" => Some(build_success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": client.name, "version": client.version},
            }),
        )),
        "ping" => Some(build_success(id, json!({}))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_shape() {
        let hello = hello_message();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["features"]["mcp"], true);
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);
    }

    #[test]
    fn test_hello_ack() {
        let frame = classify_frame(r#"{"type":"hello","session_id":"s-1"}"#);
        assert_eq!(
            frame,
            Frame::Hello {
                session_id: Some("s-1".into())
            }
        );
    }

    #[test]
    fn test_wrapped_and_bare_envelopes() {
        let wrapped = classify_frame(
            r#"{"type":"mcp","payload":{"jsonrpc":"2.0","id":4,"method":"tools/list"}}"#,
        );
        assert!(matches!(
            wrapped,
            Frame::Envelope { kind: JsonRpcMessageKind::Request { ref method, .. }, .. } if method == "tools/list"
        ));

        let bare = classify_frame(r#"{"jsonrpc":"2.0","method":"notifications/cancelled"}"#);
        assert!(matches!(
            bare,
            Frame::Envelope {
                kind: JsonRpcMessageKind::Notification { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let Frame::Reject(resp) = classify_frame("{not json") else {
            panic!("expected reject");
        };
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], -32700);
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let Frame::Reject(resp) = classify_frame(r#"{"jsonrpc":"1.0","id":9,"method":"x"}"#) else {
            panic!("expected reject");
        };
        assert_eq!(resp["id"], 9);
        assert_eq!(resp["error"]["code"], -32600);
    }

    #[test]
    fn test_invalid_notification_dropped() {
        assert!(matches!(
            classify_frame(r#"{"jsonrpc":"1.0","method":"x"}"#),
            Frame::Ignore(_)
        ));
        assert!(matches!(
            classify_frame(r#"{"type":"audio"}"#),
            Frame::Ignore(_)
        ));
    }

    #[test]
    fn test_wrap_outbound() {
        let env = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        assert_eq!(wrap_outbound(env.clone(), Some("s")), env);

        let other = wrap_outbound(json!({"x": 1}), Some("s"));
        assert_eq!(other["type"], "mcp");
        assert_eq!(other["payload"]["x"], 1);
        assert_eq!(other["session_id"], "s");
        assert!(wrap_outbound(json!({"x": 1}), None).get("session_id").is_none());
    }

    #[test]
    fn test_local_replies() {
        let client = ClientIdentity::default();
        let init = JsonRpcMessageKind::Request {
            id: JsonRpcId::Number(3),
            method: "initialize".into(),
        };
        let reply = local_reply(&init, &client).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(reply["result"]["serverInfo"]["name"], "toolbridge");

        let ping = JsonRpcMessageKind::Request {
            id: JsonRpcId::String("p".into()),
            method: "ping".into(),
        };
        assert_eq!(local_reply(&ping, &client).unwrap()["result"], json!({}));

        let call = JsonRpcMessageKind::Request {
            id: JsonRpcId::Number(1),
            method: "tools/call".into(),
        };
        assert!(local_reply(&call, &client).is_none());
    }
}
