//! The two things the binary does: run the gateway, or check a config.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use toolbridge_core::Gateway;
use toolbridge_core::config::{
    BackendTransport, Config, GatewayDefaults, PrefixPolicy, ValidationResult, ValidationWarning,
    find_config_file, load_and_validate,
};

use crate::error::CliError;

/// Locate, load and validate the configuration.
///
/// # Errors
///
/// Returns [`CliError::Config`] for a missing, unparsable or invalid file.
pub fn load(explicit: Option<&Path>) -> Result<(PathBuf, Config, ValidationResult), CliError> {
    let path = find_config_file(explicit)?;
    let (config, validation) = load_and_validate(&path)?;
    for warning in &validation.warnings {
        match warning {
            ValidationWarning::IncompleteFrontend { .. } => {
                tracing::error!(warning = %warning, "configuration problem");
            }
            _ => tracing::warn!(warning = %warning, "configuration warning"),
        }
    }
    Ok((path, config, validation))
}

/// Run the gateway until SIGINT or SIGTERM.
///
/// # Errors
///
/// Configuration problems, or a startup that connected no backend or no
/// frontend.
pub async fn run(explicit: Option<&Path>) -> Result<(), CliError> {
    let (path, config, _) = load(explicit)?;
    tracing::info!(
        config = %path.display(),
        backends = config.backends.len(),
        frontends = config.usable_frontends().len(),
        "starting toolbridge"
    );

    let defaults = GatewayDefaults::from_env();
    let defaults = match defaults.validate() {
        Ok(()) => defaults,
        Err(reason) => {
            tracing::warn!(reason = %reason, "invalid timing overrides, using defaults");
            GatewayDefaults::default()
        }
    };

    let gateway = Gateway::new(&config, &defaults)?;
    gateway.run_until(shutdown_signal()).await?;
    tracing::info!("toolbridge stopped");
    Ok(())
}

/// Validate the configuration and describe it. Tokens are masked and
/// credentials are never printed.
///
/// # Errors
///
/// Returns [`CliError::Config`] when the configuration is unusable.
pub fn check(explicit: Option<&Path>) -> Result<String, CliError> {
    let (path, config, validation) = load(explicit)?;
    Ok(summarize(&path, &config, &validation))
}

pub fn summarize(path: &Path, config: &Config, validation: &ValidationResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "config: {}", path.display());
    let _ = writeln!(out, "client: {} {}", config.client.name, config.client.version);

    let frontends = config.usable_frontends();
    let _ = writeln!(out, "frontends: {}", frontends.len());
    for (endpoint, frontend) in &frontends {
        let _ = writeln!(out, "  {endpoint}  {}", frontend.masked_url());
    }

    let _ = writeln!(out, "backends: {}", config.backends.len());
    for (index, backend) in config.backends.iter().enumerate() {
        let policy = match backend.effective_prefix_policy() {
            PrefixPolicy::Strip => "strip",
            PrefixPolicy::KeepNative => "keep_native",
        };
        let transport = match backend.transport() {
            BackendTransport::Http(http) => format!("http {}", http.url),
            BackendTransport::Stream(stream) if stream.is_local() => {
                format!("local `{}`", stream.command)
            }
            BackendTransport::Stream(stream) => format!(
                "ssh {}@{}:{}{} `{}`",
                stream.user,
                stream.host,
                stream.port,
                if stream.password.is_some() { " (password)" } else { "" },
                stream.command
            ),
        };
        let _ = writeln!(
            out,
            "  [{index}] {}  prefix {}_ ({policy})  {transport}",
            backend.name,
            backend.normalized_name()
        );
    }

    if !validation.is_clean() {
        let _ = writeln!(out, "warnings:");
        for warning in &validation.warnings {
            let _ = writeln!(out, "  - {warning}");
        }
    }
    out
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received SIGINT"),
        Err(e) => {
            tracing::error!(error = %e, "no signal handler could be installed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolbridge_core::config::parse_config;

    #[test]
    fn test_summary_masks_secrets() {
        let config = parse_config(
            r#"
frontends:
  - url: wss://cloud.example/mcp/
    token: super-secret
backends:
  - name: sql-dw
    ssh_host: db.internal
    ssh_command: python3 server.py
    ssh_password: hunter2
  - name: aperag
    url: https://rag.example/mcp
    api_key: key-123
"#,
        )
        .unwrap();
        let validation = toolbridge_core::config::validate(&config).unwrap();
        let text = summarize(Path::new("gw.yaml"), &config, &validation);

        assert!(text.contains("frontends: 1"));
        assert!(text.contains("token=***"));
        assert!(text.contains("[0] sql-dw  prefix sql_dw_ (strip)  ssh user@db.internal:22 (password)"));
        assert!(text.contains("[1] aperag  prefix aperag_ (strip)  http https://rag.example/mcp"));
        assert!(!text.contains("super-secret"));
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("key-123"));
    }
}
