//! Graceful termination of spawned backend processes.

use std::time::Duration;

use tokio::process::Child;

use crate::config::GatewayDefaults;
use crate::error::BackendError;

/// Grace periods for the termination sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace {
    /// Wait after closing stdin before signalling.
    pub stdin_close: Duration,
    /// Wait after SIGTERM before killing.
    pub sigterm: Duration,
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

impl From<&GatewayDefaults> for ShutdownGrace {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            stdin_close: defaults.stdin_close_grace,
            sigterm: defaults.sigterm_grace,
        }
    }
}

/// Stop a child whose stdin the caller has already dropped.
///
/// 1. Wait `stdin_close` for a voluntary exit
/// 2. SIGTERM the process group (Unix)
/// 3. Wait `sigterm`
/// 4. Kill
/// 5. Reap
///
/// Returns the exit code, or -1 when the process was killed by a signal.
pub async fn terminate_child(
    backend: &str,
    child: &mut Child,
    grace: ShutdownGrace,
) -> Result<i32, BackendError> {
    tracing::info!(backend, state = "shutting_down", "stopping backend process");

    match tokio::time::timeout(grace.stdin_close, child.wait()).await {
        Ok(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            tracing::info!(backend, code, "backend exited after stdin close");
            return Ok(code);
        }
        Ok(Err(e)) => {
            tracing::error!(backend, error = %e, "wait failed after stdin close");
        }
        Err(_) => {
            tracing::info!(backend, "backend did not exit within stdin close grace");
        }
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            tracing::info!(backend, pid, "sending SIGTERM to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(backend, pid, error = ?e, "killpg SIGTERM failed");
            }
        }
    }

    match tokio::time::timeout(grace.sigterm, child.wait()).await {
        Ok(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            tracing::info!(backend, code, "backend exited after SIGTERM");
            return Ok(code);
        }
        Ok(Err(e)) => {
            tracing::error!(backend, error = %e, "wait failed after SIGTERM");
        }
        Err(_) => {
            tracing::warn!(backend, "backend did not exit within SIGTERM grace");
        }
    }

    tracing::warn!(backend, "killing backend process");
    if let Err(e) = child.kill().await {
        tracing::error!(backend, error = %e, "kill failed");
    }

    let status = child.wait().await.map_err(|source| BackendError::Io {
        backend: backend.to_string(),
        source,
    })?;
    let code = status.code().unwrap_or(-1);
    tracing::info!(backend, code, state = "stopped", "backend process reaped");
    Ok(code)
}
