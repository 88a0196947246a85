//! Error types for the gateway.
//!
//! ## Module Organization
//!
//! - `jsonrpc` - JSON-RPC 2.0 error object
//! - `FramingError` - wire text that cannot become an envelope
//! - `BackendError` - one backend connection's failures
//! - `FrontendError` - one frontend connection's failures
//! - `GatewayError` - failures surfaced to a frontend caller, or fatal at startup

pub mod jsonrpc;

use serde_json::json;
use thiserror::Error;

use crate::jsonrpc::JsonRpcId;
use jsonrpc::JsonRpcError;

// ─────────────────────────────────────────────────────────────────────────────
// Framing Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur when turning wire text into an envelope.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A single line exceeds the configured maximum size.
    ///
    /// Checked before JSON parsing.
    #[error("Message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge {
        /// The configured maximum message size in bytes.
        max_bytes: usize,
    },

    /// The text is not valid JSON, or not a JSON object.
    #[error("Malformed JSON: {reason}")]
    MalformedJson {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// The message is a JSON array (batch), which the tool protocol does not use.
    #[error("JSON-RPC batch requests (arrays) are not supported")]
    UnsupportedBatch,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by a backend connection.
///
/// None of these are fatal to the process; the owning connection logs them
/// and flips its `connected` flag where the transport is gone.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Local process (shell or `ssh` client) failed to start.
    #[error("backend '{backend}' failed to start: {reason}")]
    Spawn {
        /// Backend name.
        backend: String,
        /// Human-readable description of the spawn failure.
        reason: String,
    },

    /// Native SSH session could not be established or authenticated.
    #[error("backend '{backend}' ssh failure: {reason}")]
    Ssh {
        /// Backend name.
        backend: String,
        /// Human-readable description of the session failure.
        reason: String,
    },

    /// Reading from or writing to the transport failed.
    #[error("backend '{backend}' I/O error: {source}")]
    Io {
        /// Backend name.
        backend: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The operation needs a live connection and there is none.
    #[error("backend '{backend}' is not connected")]
    NotConnected {
        /// Backend name.
        backend: String,
    },

    /// No response arrived within the pending-request lifetime.
    #[error("backend '{backend}' did not respond within {timeout_secs}s")]
    Timeout {
        /// Backend name.
        backend: String,
        /// The timeout that elapsed, in seconds.
        timeout_secs: u64,
    },

    /// The transport closed while the request was outstanding.
    #[error("backend '{backend}' closed the connection")]
    Closed {
        /// Backend name.
        backend: String,
    },

    /// HTTP backend answered with a non-success status.
    #[error("backend '{backend}' returned HTTP {status}")]
    HttpStatus {
        /// Backend name.
        backend: String,
        /// The HTTP status code.
        status: u16,
    },

    /// HTTP request could not be sent or its body could not be read.
    #[error("backend '{backend}' HTTP error: {reason}")]
    Http {
        /// Backend name.
        backend: String,
        /// Human-readable description.
        reason: String,
    },

    /// The reply body could not be decoded into an envelope.
    #[error("backend '{backend}' sent an undecodable reply: {reason}")]
    Decode {
        /// Backend name.
        backend: String,
        /// Human-readable description.
        reason: String,
    },

    /// The outgoing message is not a valid envelope.
    #[error("refusing to send invalid envelope to '{backend}': {reason}")]
    InvalidEnvelope {
        /// Backend name.
        backend: String,
        /// Classification failure.
        reason: String,
    },

    /// The `initialize` reply lacked a `result` member.
    #[error("backend '{backend}' rejected initialize: {reason}")]
    InitializeRejected {
        /// Backend name.
        backend: String,
        /// What the reply contained instead.
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Frontend Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by a frontend connection.
#[derive(Debug, Error)]
pub enum FrontendError {
    /// The configured URL cannot be turned into a connect URI.
    #[error("frontend '{endpoint}' has an invalid url: {reason}")]
    InvalidUrl {
        /// Endpoint id.
        endpoint: String,
        /// Parse failure.
        reason: String,
    },

    /// WebSocket handshake failed.
    #[error("frontend '{endpoint}' connect failed: {reason}")]
    Connect {
        /// Endpoint id.
        endpoint: String,
        /// Human-readable description.
        reason: String,
    },

    /// Outbound frame could not be written.
    #[error("frontend '{endpoint}' send failed: {reason}")]
    Send {
        /// Endpoint id.
        endpoint: String,
        /// Human-readable description.
        reason: String,
    },

    /// No live connection.
    #[error("frontend '{endpoint}' is not connected")]
    NotConnected {
        /// Endpoint id.
        endpoint: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures the gateway reports to a frontend as a JSON-RPC error, plus the
/// two startup conditions that are fatal to the process.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Inbound text was not valid JSON.
    #[error("Parse error: {details}")]
    ParseError {
        /// Description of the parse error
        details: String,
    },

    /// Inbound JSON was request-shaped but not a valid envelope.
    #[error("Invalid Request: {details}")]
    InvalidRequest {
        /// Description of what makes the request invalid
        details: String,
    },

    /// No backend could be determined for the tool.
    #[error("no backend found for tool '{tool}'")]
    NoRoute {
        /// Public tool name from the call.
        tool: String,
    },

    /// The owning backend exists but is down.
    #[error("backend '{backend}' is not connected")]
    BackendNotConnected {
        /// Backend name.
        backend: String,
    },

    /// The backend returned nothing usable (timeout, transport loss, bad reply).
    #[error("backend '{backend}' failed to process the request: {reason}")]
    ForwardingFailed {
        /// Backend name.
        backend: String,
        /// Underlying cause, for local diagnostics.
        reason: String,
    },

    /// Payload could not be shrunk below the frontend ceiling.
    #[error(
        "Response too large. Reduce the number of results (topk) or refine the query."
    )]
    ResponseTooLarge {
        /// Serialized size before shrinking, in bytes.
        original_size: usize,
        /// Configured ceiling, in bytes.
        max_size: usize,
    },

    /// Startup: every backend failed to connect or initialize.
    #[error("no backend could be connected")]
    NoBackendsConnected,

    /// Startup: every frontend failed to connect.
    #[error("no frontend could be connected")]
    NoFrontendsConnected,

    /// Unexpected internal failure.
    #[error("Internal error: {details}")]
    InternalError {
        /// Description for local diagnostics.
        details: String,
    },
}

impl GatewayError {
    /// Maps each variant to its JSON-RPC error code.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            Self::ParseError { .. } => -32700,
            Self::InvalidRequest { .. } => -32600,
            Self::NoRoute { .. } => -32601,
            Self::BackendNotConnected { .. } | Self::ForwardingFailed { .. } => -32000,
            Self::NoBackendsConnected | Self::NoFrontendsConnected => -32000,
            Self::ResponseTooLarge { .. } | Self::InternalError { .. } => -32603,
        }
    }

    /// Returns the error type name for logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NoRoute { .. } => "no_route",
            Self::BackendNotConnected { .. } => "backend_not_connected",
            Self::ForwardingFailed { .. } => "forwarding_failed",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::NoBackendsConnected => "no_backends_connected",
            Self::NoFrontendsConnected => "no_frontends_connected",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Structured `data` member, when the variant carries caller-safe detail.
    fn error_data(&self) -> Option<serde_json::Value> {
        match self {
            Self::NoRoute { tool } => Some(json!({ "tool": tool })),
            Self::ResponseTooLarge {
                original_size,
                max_size,
            } => Some(json!({
                "original_size": original_size,
                "max_size": max_size,
            })),
            _ => None,
        }
    }

    /// The message shown to the caller.
    ///
    /// Forwarding failures omit the internal cause.
    fn caller_message(&self) -> String {
        match self {
            Self::ForwardingFailed { backend, .. } => {
                format!("backend '{backend}' failed to process the request")
            }
            other => other.to_string(),
        }
    }

    /// Convert to a JSON-RPC error object.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.caller_message(),
            data: self.error_data(),
        }
    }

    /// Build the full error response envelope for `id`.
    pub fn to_response(&self, id: &JsonRpcId) -> serde_json::Value {
        self.to_jsonrpc_error().into_response(id)
    }
}
