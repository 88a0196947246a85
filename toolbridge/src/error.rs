//! Errors that end the process, and their exit codes.

use toolbridge_core::config::ConfigError;
use toolbridge_core::error::{BackendError, GatewayError};

/// Exit code for a clean stop.
pub const EXIT_OK: i32 = 0;
/// Exit code when the gateway could not start.
pub const EXIT_STARTUP: i32 = 1;
/// Exit code for configuration problems.
pub const EXIT_CONFIG: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The configuration could not be found, parsed, or validated.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A backend connection could not be constructed from its config.
    #[error("backend setup failed: {0}")]
    Backend(#[from] BackendError),

    /// Startup could not connect any backend or any frontend.
    #[error("startup failed: {0}")]
    Startup(#[from] GatewayError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Backend(_) | Self::Startup(_) => EXIT_STARTUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::from(ConfigError::EmptyConfigFile).exit_code(), EXIT_CONFIG);
        assert_eq!(
            CliError::from(GatewayError::NoBackendsConnected).exit_code(),
            EXIT_STARTUP
        );
        assert_eq!(
            CliError::from(GatewayError::NoFrontendsConnected).exit_code(),
            EXIT_STARTUP
        );
    }
}
