//! Native SSH transport for password-authenticated stream backends.
//!
//! Opens a session with `russh`, authenticates with the configured
//! password, and runs the backend command on an exec channel. The channel
//! is driven by a single pump task, so reads and writes never contend for
//! it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StreamTransport;
use crate::error::BackendError;

use super::stream::InboundDispatch;

/// Bound on TCP connect plus key exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH stderr extended-data stream number.
const EXTENDED_STDERR: u32 = 1;

/// Accepts any host key, matching `StrictHostKeyChecking=no` on the `ssh`
/// client path.
struct AcceptAnyHost;

#[async_trait]
impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated session with the backend command running.
pub(crate) struct SshExec {
    session: Handle<AcceptAnyHost>,
    channel: Channel<Msg>,
}

fn ssh_error(backend: &str, reason: impl std::fmt::Display) -> BackendError {
    BackendError::Ssh {
        backend: backend.to_string(),
        reason: reason.to_string(),
    }
}

/// Connect, authenticate and start `transport.command`.
pub(crate) async fn open(backend: &str, transport: &StreamTransport) -> Result<SshExec, BackendError> {
    let password = transport
        .password
        .as_deref()
        .ok_or_else(|| ssh_error(backend, "no password configured"))?;

    tracing::info!(
        backend,
        host = %transport.host,
        port = transport.port,
        user = %transport.user,
        password_len = password.len(),
        "opening ssh session"
    );

    let config = Arc::new(client::Config::default());
    let connect = client::connect(
        config,
        (transport.host.as_str(), transport.port),
        AcceptAnyHost,
    );
    let mut session = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| ssh_error(backend, format!("connect timed out after {CONNECT_TIMEOUT:?}")))?
        .map_err(|e| ssh_error(backend, e))?;

    let accepted = session
        .authenticate_password(transport.user.as_str(), password)
        .await
        .map_err(|e| ssh_error(backend, e))?;
    if !accepted {
        return Err(ssh_error(backend, "password authentication rejected"));
    }

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| ssh_error(backend, e))?;
    channel
        .exec(true, transport.command.as_str())
        .await
        .map_err(|e| ssh_error(backend, e))?;

    tracing::info!(backend, command = %transport.command, "ssh exec channel started");
    Ok(SshExec { session, channel })
}

impl SshExec {
    /// Drive the channel until it closes or `cancel` fires.
    ///
    /// Stdout feeds `inbound`; stderr is logged. On cancellation the channel
    /// gets EOF and close, then the session is disconnected.
    pub(crate) async fn pump(
        mut self,
        mut inbound: InboundDispatch,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        let backend = inbound.backend_name().to_string();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.channel.eof().await;
                    let _ = self.channel.close().await;
                    break;
                }
                msg = self.channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => inbound.feed(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == EXTENDED_STDERR => {
                        for line in String::from_utf8_lossy(&data).lines() {
                            tracing::warn!(backend = %backend, stderr = line, "backend diagnostic");
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::info!(backend = %backend, exit_status, "remote command exited");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        tracing::warn!(backend = %backend, "ssh channel closed");
                        break;
                    }
                    Some(_) => {}
                },
                bytes = outbound.recv() => match bytes {
                    Some(bytes) => {
                        if let Err(e) = self.channel.data(&bytes[..]).await {
                            tracing::error!(backend = %backend, error = %e, "ssh write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = self.channel.eof().await;
                        break;
                    }
                },
            }
        }

        inbound.closed();
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(backend = %backend, error = %e, "ssh disconnect failed");
        }
    }
}
