//! Backend connections: one physical link to one local tool provider.
//!
//! Two implementations sit behind [`Backend`]:
//!
//! - [`StreamBackend`] speaks newline-delimited JSON over a child process
//!   (local shell or `ssh` client) or a native SSH exec channel.
//! - [`HttpBackend`] POSTs each envelope and decodes a JSON or event-stream
//!   reply.
//!
//! The gateway and router only see `Arc<dyn Backend>`.

pub mod framing;
pub mod http;
pub mod pending;
pub mod shutdown;
pub mod ssh;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::{BackendConfig, BackendTransport, ClientIdentity, Limits};
use crate::error::BackendError;
use crate::jsonrpc::{PROTOCOL_VERSION, build_notification, build_request};

pub use http::HttpBackend;
pub use pending::{PendingOutcome, PendingTable};
pub use shutdown::ShutdownGrace;
pub use stream::StreamBackend;

/// Wire id of the `initialize` request. Below the local id range.
pub const INITIALIZE_ID: i64 = 1;

/// A message a backend sent without being asked: a notification, or a
/// response nobody on this connection is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub backend: usize,
    pub message: Value,
}

/// Per-connection identity, bound at construction.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub index: usize,
    pub name: String,
    pub client: ClientIdentity,
    pub request_timeout: Duration,
    pub events: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendContext {
    /// Hand an unsolicited message to the gateway.
    pub(crate) fn emit(&self, message: Value) {
        let event = BackendEvent {
            backend: self.index,
            message,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(backend = %self.name, "event receiver gone, dropping message");
        }
    }
}

/// Capability interface shared by every backend transport.
///
/// All methods take `&self`; connection state lives behind interior
/// mutability so one `Arc<dyn Backend>` can serve the health supervisor,
/// the aggregator and every routed call concurrently.
#[async_trait]
pub trait Backend: Send + Sync {
    fn context(&self) -> &BackendContext;

    fn name(&self) -> &str {
        &self.context().name
    }

    fn index(&self) -> usize {
        self.context().index
    }

    /// True only between a successful `connect` and the next transport
    /// failure, end of stream, or `disconnect`.
    fn is_connected(&self) -> bool;

    /// Establish the transport.
    async fn connect(&self) -> Result<(), BackendError>;

    /// Transmit one envelope.
    ///
    /// Requests wait for the correlated response (bounded by the request
    /// timeout) and return `Some`. Notifications return `None` as soon as
    /// they are written.
    async fn send_message(&self, envelope: Value) -> Result<Option<Value>, BackendError>;

    /// Tear the transport down. Idempotent.
    async fn disconnect(&self);

    /// Run the protocol handshake: `initialize`, which must yield a
    /// `result`, then `notifications/initialized`.
    async fn initialize(&self) -> Result<(), BackendError> {
        let reply = self
            .send_message(initialize_request(&self.context().client))
            .await?
            .ok_or_else(|| BackendError::InitializeRejected {
                backend: self.name().to_string(),
                reason: "no reply".to_string(),
            })?;

        if reply.get("result").is_none() {
            let reason = reply
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "reply has no result".to_string());
            return Err(BackendError::InitializeRejected {
                backend: self.name().to_string(),
                reason,
            });
        }

        if let Err(e) = self
            .send_message(build_notification("notifications/initialized", None))
            .await
        {
            tracing::warn!(backend = %self.name(), error = %e, "initialized notification failed");
        }

        tracing::info!(backend = %self.name(), "backend initialized");
        Ok(())
    }
}

/// The `initialize` request announcing `client`.
pub fn initialize_request(client: &ClientIdentity) -> Value {
    build_request(
        INITIALIZE_ID,
        "initialize",
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client.name,
                "version": client.version,
            },
        }),
    )
}

/// Build the connection for one configured backend.
///
/// # Errors
///
/// Only the HTTP variant can fail here, when its client cannot be built.
pub fn build_backend(
    index: usize,
    config: &BackendConfig,
    client: &ClientIdentity,
    limits: &Limits,
    grace: ShutdownGrace,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> Result<Arc<dyn Backend>, BackendError> {
    let context = BackendContext {
        index,
        name: config.name.clone(),
        client: client.clone(),
        request_timeout: limits.request_timeout(),
        events,
    };

    Ok(match config.transport() {
        BackendTransport::Stream(transport) => {
            Arc::new(StreamBackend::new(context, transport, grace))
        }
        BackendTransport::Http(transport) => {
            Arc::new(HttpBackend::new(context, transport, limits.http_timeout())?)
        }
    })
}
