//! Frontend connections: one WebSocket to one cloud endpoint.
//!
//! A connection owns two tasks per live socket. The writer task holds the
//! sink, serializes every outbound frame and sends keepalive pings. The
//! session task holds the stream, dispatches inbound frames and, when the
//! socket ends, reconnects with [`Backoff`] until it succeeds or the
//! connection is stopped.

pub mod backoff;
pub mod handshake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::config::{ClientIdentity, FrontendConfig, GatewayDefaults};
use crate::error::FrontendError;
use crate::jsonrpc::{JsonRpcMessageKind, format_message};

pub use backoff::Backoff;
use handshake::{Frame, classify_frame, hello_message, local_reply, wrap_outbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsRead = SplitStream<WsStream>;

/// A JSON-RPC envelope received from a frontend, for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendMessage {
    pub endpoint: String,
    pub kind: JsonRpcMessageKind,
    pub message: Value,
}

/// Keepalive and reconnect timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendTiming {
    pub ping_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl From<&GatewayDefaults> for FrontendTiming {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            ping_interval: defaults.ping_interval,
            reconnect_initial: defaults.reconnect_initial_delay,
            reconnect_max: defaults.reconnect_max_delay,
        }
    }
}

impl Default for FrontendTiming {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

/// One cloud endpoint.
pub struct FrontendConnection {
    endpoint: String,
    config: FrontendConfig,
    client: ClientIdentity,
    timing: FrontendTiming,
    inbound: mpsc::UnboundedSender<FrontendMessage>,
    connected: AtomicBool,
    session_id: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    cancel: CancellationToken,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FrontendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendConnection")
            .field("endpoint", &self.endpoint)
            .field("url", &self.config.masked_url())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl FrontendConnection {
    pub fn new(
        endpoint: impl Into<String>,
        config: FrontendConfig,
        client: ClientIdentity,
        timing: FrontendTiming,
        inbound: mpsc::UnboundedSender<FrontendMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            config,
            client,
            timing,
            inbound,
            connected: AtomicBool::new(false),
            session_id: Mutex::new(None),
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            session: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Session id from the last handshake acknowledgement.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the socket, announce capabilities and start the session task.
    ///
    /// Later drops are handled by the session task's own reconnects; only
    /// this first attempt reports failure to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::Connect`] if the WebSocket handshake fails.
    pub async fn connect(self: &Arc<Self>) -> Result<(), FrontendError> {
        let read = self.open().await?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_session(read).await });
        if let Some(old) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
        Ok(())
    }

    /// Queue one message for the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`FrontendError::NotConnected`] without a live socket.
    pub fn send_message(&self, message: Value) -> Result<(), FrontendError> {
        let framed = wrap_outbound(message, self.session_id().as_deref());
        let text = format_message(&framed);
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| FrontendError::NotConnected {
                endpoint: self.endpoint.clone(),
            })?;
        sender
            .send(Message::Text(text.into()))
            .map_err(|_| FrontendError::Send {
                endpoint: self.endpoint.clone(),
                reason: "writer task stopped".to_string(),
            })
    }

    /// Stop the session, its reconnects and the socket. Idempotent.
    pub async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.connected.store(false, Ordering::Release);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(frontend = %self.endpoint, error = %e, "session task failed");
                }
            }
        }
        tracing::info!(frontend = %self.endpoint, "frontend disconnected");
    }

    /// Connect the socket, start its writer and send `hello`.
    async fn open(&self) -> Result<WsRead, FrontendError> {
        tracing::info!(frontend = %self.endpoint, url = %self.config.masked_url(), "connecting frontend");
        let target = self.config.connect_url();
        match url::Url::parse(&target) {
            Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => {}
            Ok(parsed) => {
                return Err(FrontendError::InvalidUrl {
                    endpoint: self.endpoint.clone(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
            Err(e) => {
                return Err(FrontendError::InvalidUrl {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                });
            }
        }
        let (socket, _response) = connect_async(target)
            .await
            .map_err(|e| FrontendError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let (sink, read) = socket.split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            self.endpoint.clone(),
            sink,
            rx,
            self.timing.ping_interval,
            self.cancel.child_token(),
        ));

        let hello = format_message(&hello_message());
        tx.send(Message::Text(hello.into()))
            .map_err(|_| FrontendError::Send {
                endpoint: self.endpoint.clone(),
                reason: "writer task stopped before hello".to_string(),
            })?;

        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.connected.store(true, Ordering::Release);
        tracing::info!(frontend = %self.endpoint, "frontend connected");
        Ok(read)
    }

    async fn run_session(self: Arc<Self>, mut read: WsRead) {
        let mut backoff = Backoff::new(self.timing.reconnect_initial, self.timing.reconnect_max);
        loop {
            self.read_loop(&mut read).await;
            self.connected.store(false, Ordering::Release);
            self.outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if self.cancel.is_cancelled() {
                return;
            }
            tracing::warn!(frontend = %self.endpoint, "frontend connection lost");

            read = loop {
                let delay = backoff.next_delay();
                tracing::info!(frontend = %self.endpoint, delay_secs = delay.as_secs(), "reconnecting frontend");
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let opened = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    opened = self.open() => opened,
                };
                match opened {
                    Ok(read) => {
                        backoff.reset();
                        break read;
                    }
                    Err(e) => {
                        tracing::warn!(frontend = %self.endpoint, error = %e, "frontend reconnect failed");
                    }
                }
            };
        }
    }

    async fn read_loop(&self, read: &mut WsRead) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = read.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_text(text),
                    Err(_) => tracing::debug!(frontend = %self.endpoint, len = bytes.len(), "ignoring binary frame"),
                },
                Some(Ok(Message::Close(reason))) => {
                    tracing::info!(frontend = %self.endpoint, reason = ?reason, "frontend closed the socket");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(frontend = %self.endpoint, error = %e, "frontend read failed");
                    return;
                }
                None => return,
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match classify_frame(text) {
            Frame::Hello { session_id } => {
                tracing::info!(frontend = %self.endpoint, session_id = ?session_id, "handshake acknowledged");
                *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = session_id;
            }
            Frame::Envelope { message, kind } => {
                if let Some(reply) = local_reply(&kind, &self.client) {
                    tracing::debug!(frontend = %self.endpoint, "answering locally");
                    self.reply(reply);
                    return;
                }
                let forwarded = FrontendMessage {
                    endpoint: self.endpoint.clone(),
                    kind,
                    message,
                };
                if self.inbound.send(forwarded).is_err() {
                    tracing::debug!(frontend = %self.endpoint, "gateway gone, dropping message");
                }
            }
            Frame::Reject(response) => {
                tracing::warn!(frontend = %self.endpoint, code = %response["error"]["code"], "rejecting malformed frame");
                self.reply(response);
            }
            Frame::Ignore(reason) => {
                tracing::debug!(frontend = %self.endpoint, reason, "ignoring frame");
            }
        }
    }

    fn reply(&self, message: Value) {
        if let Err(e) = self.send_message(message) {
            tracing::warn!(frontend = %self.endpoint, error = %e, "local reply failed");
        }
    }
}

/// Owns the sink for one socket. Ends when its channel closes, a write
/// fails, or `cancel` fires.
async fn write_loop<S>(
    endpoint: String,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Message>,
    ping_interval: Duration,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!(frontend = %endpoint, error = %e, "close frame not sent");
                }
                break;
            }
            msg = rx.recv() => match msg {
                Some(msg) => sink.send(msg).await,
                None => break,
            },
            _ = ping.tick() => sink.send(Message::Ping(Vec::new().into())).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(frontend = %endpoint, error = %e, "frontend write failed");
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(frontend = %endpoint, error = %e, "socket close failed");
    }
}
