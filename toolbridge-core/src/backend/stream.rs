//! Stream backend: newline-delimited JSON over a process or SSH channel.
//!
//! # Transports
//!
//! | host                      | password | transport                         |
//! |---------------------------|----------|-----------------------------------|
//! | `localhost` / `127.0.0.1` | any      | `/bin/bash -c <command>`          |
//! | other                     | none     | `ssh ... -p <port> user@host cmd` |
//! | other                     | set      | native SSH exec channel           |
//!
//! Each link runs a writer task (the only owner of the outbound pipe), a
//! reader task feeding an [`InboundDispatch`], and for child processes a
//! stderr drain. Responses resolve entries in the [`PendingTable`];
//! everything else goes to the gateway as a [`BackendEvent`](super::BackendEvent).

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StreamTransport;
use crate::error::BackendError;
use crate::jsonrpc::{JsonRpcMessageKind, classify_jsonrpc};

use super::framing::{LineBuffer, decode_line, encode_line};
use super::pending::{PendingOutcome, PendingTable};
use super::shutdown::{ShutdownGrace, terminate_child};
use super::{Backend, BackendContext, ssh};

/// How long `disconnect` waits for an SSH pump to close its channel.
const SSH_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state mirrored from the current link.
///
/// Every link gets a generation number. A reader or writer that sees its
/// link fail only flips `connected` if its generation is still current, so
/// a late failure from a torn-down link cannot mark a fresh one as dead.
#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    generation: AtomicU64,
}

/// Marks one link dead from whichever task sees it fail first.
#[derive(Clone)]
struct LinkWatch {
    backend: String,
    pending: Arc<PendingTable>,
    state: Arc<LinkState>,
    generation: u64,
}

impl LinkWatch {
    /// Fail every waiter and clear `connected`, unless a newer link has
    /// replaced this one.
    fn lost(&self, reason: &'static str) {
        if self.state.generation.load(Ordering::Acquire) != self.generation {
            return;
        }
        self.state.connected.store(false, Ordering::Release);
        let failed = self.pending.fail_all();
        tracing::warn!(backend = %self.backend, failed_requests = failed, reason, "backend link lost");
    }
}

/// Inbound side of one link: line splitting and per-envelope dispatch.
pub(crate) struct InboundDispatch {
    context: BackendContext,
    watch: LinkWatch,
    buffer: LineBuffer,
}

impl InboundDispatch {
    pub(crate) fn backend_name(&self) -> &str {
        &self.context.name
    }

    /// Split a raw chunk into lines and dispatch each one.
    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        for line in self.buffer.push(chunk) {
            if !line.trim().is_empty() {
                self.dispatch(&line);
            }
        }
    }

    fn dispatch(&self, line: &str) {
        let backend = &self.context.name;
        let message = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "dropping undecodable line");
                return;
            }
        };

        match classify_jsonrpc(&message) {
            Ok(JsonRpcMessageKind::Response { id }) => {
                if let Err(unclaimed) = self.watch.pending.complete(&id, message) {
                    tracing::debug!(backend = %backend, id = %id, "response without pending request");
                    self.context.emit(unclaimed);
                }
            }
            Ok(JsonRpcMessageKind::Notification { method }) => {
                tracing::debug!(backend = %backend, method = %method, "backend notification");
                self.context.emit(message);
            }
            Ok(JsonRpcMessageKind::Request { id, method }) => {
                tracing::warn!(
                    backend = %backend,
                    id = %id,
                    method = %method,
                    "ignoring request sent by backend"
                );
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "dropping invalid envelope");
            }
        }
    }

    /// End of stream: fail every waiter and mark the link dead.
    pub(crate) fn closed(&self) {
        self.watch.lost("stream ended");
    }
}

/// Resources owned by one live link.
struct Link {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
    process: Option<Child>,
    ssh_pump: Option<JoinHandle<()>>,
}

/// Backend reached over a byte stream.
pub struct StreamBackend {
    context: BackendContext,
    transport: StreamTransport,
    grace: ShutdownGrace,
    state: Arc<LinkState>,
    pending: Arc<PendingTable>,
    link: Mutex<Option<Link>>,
}

impl std::fmt::Debug for StreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBackend")
            .field("name", &self.context.name)
            .field("host", &self.transport.host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl StreamBackend {
    pub fn new(context: BackendContext, transport: StreamTransport, grace: ShutdownGrace) -> Self {
        Self {
            context,
            transport,
            grace,
            state: Arc::new(LinkState::default()),
            pending: Arc::new(PendingTable::new()),
            link: Mutex::new(None),
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The command line run for this transport, when it is a process.
    ///
    /// Returns `None` for the native SSH path.
    pub fn process_command(transport: &StreamTransport) -> Option<Command> {
        if transport.is_local() {
            let mut cmd = Command::new("/bin/bash");
            cmd.arg("-c").arg(&transport.command);
            Some(cmd)
        } else if transport.password.is_none() {
            let mut cmd = Command::new("ssh");
            cmd.args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-p",
            ])
            .arg(transport.port.to_string())
            .arg(format!("{}@{}", transport.user, transport.host))
            .arg(&transport.command);
            Some(cmd)
        } else {
            None
        }
    }

    fn watch(&self, generation: u64) -> LinkWatch {
        LinkWatch {
            backend: self.context.name.clone(),
            pending: Arc::clone(&self.pending),
            state: Arc::clone(&self.state),
            generation,
        }
    }

    fn dispatcher(&self, generation: u64) -> InboundDispatch {
        InboundDispatch {
            context: self.context.clone(),
            watch: self.watch(generation),
            buffer: LineBuffer::new(),
        }
    }

    fn spawn_process(&self, generation: u64) -> Result<Link, BackendError> {
        let backend = self.context.name.clone();
        let spawn_err = |reason: String| BackendError::Spawn {
            backend: backend.clone(),
            reason,
        };

        let mut cmd = Self::process_command(&self.transport)
            .ok_or_else(|| spawn_err("transport is not a process".to_string()))?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        tracing::info!(backend = %backend, pid = child.id(), "backend process started");

        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_pipe(
            self.watch(generation),
            stdin,
            rx,
            cancel.clone(),
        ));

        let mut drains = vec![tokio::spawn(read_pipe(
            stdout,
            self.dispatcher(generation),
        ))];
        if let Some(stderr) = stderr {
            drains.push(tokio::spawn(drain_stderr(backend.clone(), stderr)));
        }

        Ok(Link {
            outbound,
            cancel,
            writer: Some(writer),
            drains,
            process: Some(child),
            ssh_pump: None,
        })
    }

    async fn open_ssh(&self, generation: u64) -> Result<Link, BackendError> {
        let exec = ssh::open(&self.context.name, &self.transport).await?;
        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(exec.pump(self.dispatcher(generation), rx, cancel.clone()));

        Ok(Link {
            outbound,
            cancel,
            writer: None,
            drains: Vec::new(),
            process: None,
            ssh_pump: Some(pump),
        })
    }

    async fn teardown(&self, link: Link) {
        let Link {
            outbound,
            cancel,
            writer,
            drains,
            process,
            ssh_pump,
        } = link;
        let backend = self.context.name.as_str();

        drop(outbound);
        cancel.cancel();
        if let Some(writer) = writer {
            // Writer exit drops stdin, which starts the child's grace period.
            let _ = writer.await;
        }

        if let Some(mut child) = process {
            match terminate_child(backend, &mut child, self.grace).await {
                Ok(code) => tracing::info!(backend, code, "backend process stopped"),
                Err(e) => tracing::error!(backend, error = %e, "backend process did not stop cleanly"),
            }
        }

        if let Some(pump) = ssh_pump {
            if tokio::time::timeout(SSH_CLOSE_TIMEOUT, pump).await.is_err() {
                tracing::warn!(backend, "ssh channel did not close in time");
            }
        }

        for drain in drains {
            drain.abort();
        }
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<(), BackendError> {
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or_else(|| BackendError::NotConnected {
            backend: self.context.name.clone(),
        })?;
        link.outbound.send(bytes).map_err(|_| BackendError::Closed {
            backend: self.context.name.clone(),
        })
    }
}

#[async_trait]
impl Backend for StreamBackend {
    fn context(&self) -> &BackendContext {
        &self.context
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<(), BackendError> {
        let mut guard = self.link.lock().await;
        if let Some(stale) = guard.take() {
            self.state.connected.store(false, Ordering::Release);
            self.teardown(stale).await;
        }

        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            backend = %self.context.name,
            host = %self.transport.host,
            local = self.transport.is_local(),
            "connecting backend"
        );

        let link = if self.transport.is_local() || self.transport.password.is_none() {
            self.spawn_process(generation)?
        } else {
            self.open_ssh(generation).await?
        };

        *guard = Some(link);
        self.state.connected.store(true, Ordering::Release);
        tracing::info!(backend = %self.context.name, "backend connected");
        Ok(())
    }

    async fn send_message(&self, envelope: Value) -> Result<Option<Value>, BackendError> {
        let backend = &self.context.name;
        if !self.is_connected() {
            return Err(BackendError::NotConnected {
                backend: backend.clone(),
            });
        }

        let kind = classify_jsonrpc(&envelope).map_err(|e| BackendError::InvalidEnvelope {
            backend: backend.clone(),
            reason: e.to_string(),
        })?;
        let bytes = encode_line(&envelope);

        let JsonRpcMessageKind::Request { id, method } = kind else {
            self.write(bytes).await?;
            return Ok(None);
        };

        let rx = self.pending.register(id.clone());
        if let Err(e) = self.write(bytes).await {
            self.pending.cancel(&id);
            return Err(e);
        }
        tracing::debug!(backend = %backend, id = %id, method = %method, "request sent");

        match self.pending.wait(&id, rx, self.context.request_timeout).await {
            PendingOutcome::Response(response) => Ok(Some(response)),
            PendingOutcome::Failed => Err(BackendError::Closed {
                backend: backend.clone(),
            }),
            PendingOutcome::TimedOut => {
                tracing::warn!(backend = %backend, id = %id, method = %method, "request timed out");
                Err(BackendError::Timeout {
                    backend: backend.clone(),
                    timeout_secs: self.context.request_timeout.as_secs(),
                })
            }
        }
    }

    async fn disconnect(&self) {
        let mut guard = self.link.lock().await;
        self.state.connected.store(false, Ordering::Release);
        // The torn-down reader's EOF must be ignored.
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(link) = guard.take() {
            self.teardown(link).await;
            tracing::info!(backend = %self.context.name, "backend disconnected");
        }
        self.pending.fail_all();
    }
}

/// Sole writer of the child's stdin. Exits (dropping stdin) on cancel, on
/// sender drop, or on the first write error, which also marks the link lost.
async fn write_pipe(
    watch: LinkWatch,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let result = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(backend = %watch.backend, error = %e, "backend stdin write failed");
            watch.lost("stdin write failed");
            break;
        }
    }
}

async fn read_pipe(mut stdout: ChildStdout, mut inbound: InboundDispatch) {
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => inbound.feed(&chunk[..n]),
            Err(e) => {
                tracing::error!(backend = %inbound.backend_name(), error = %e, "backend stdout read failed");
                break;
            }
        }
    }
    inbound.closed();
}

async fn drain_stderr(backend: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(backend = %backend, stderr = %line, "backend diagnostic"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(backend = %backend, error = %e, "stderr drain ended");
                break;
            }
        }
    }
}
