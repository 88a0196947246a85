//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Structural validation
    // ─────────────────────────────────────────────────────────────────────────
    /// No backends declared.
    #[error("no backends defined in configuration")]
    NoBackendsDefined,

    /// No frontend has both `url` and `token`.
    #[error("no usable frontends defined in configuration")]
    NoFrontendsDefined,

    /// Two backends share a name, which would make routing ambiguous.
    #[error("duplicate backend name: '{name}'")]
    DuplicateBackendName { name: String },

    /// Backend name is empty.
    #[error("backend at index {index} has an empty name")]
    EmptyBackendName { index: usize },

    /// Stream backend has nothing to run.
    #[error("backend '{name}' has no ssh_command")]
    MissingCommand { name: String },

    /// URL does not parse.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// A limit is zero.
    #[error("limit '{field}' must be greater than zero")]
    InvalidLimit { field: &'static str },

    /// Required environment variable not set.
    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing errors
    // ─────────────────────────────────────────────────────────────────────────
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Config file not found at any search location.
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Validation warnings (non-fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Frontend entry lacks `url` or `token` and will be skipped.
    IncompleteFrontend { index: usize },

    /// Two backends normalize to the same prefix.
    SharedPrefix { prefix: String },

    /// Extra `authorization` header is ignored in favour of `api_key`.
    AuthorizationHeaderIgnored { backend: String },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompleteFrontend { index } => {
                write!(f, "frontend {index} is missing 'url' or 'token' and will be skipped")
            }
            Self::SharedPrefix { prefix } => {
                write!(f, "several backends share the tool prefix '{prefix}_'")
            }
            Self::AuthorizationHeaderIgnored { backend } => {
                write!(
                    f,
                    "backend '{backend}' sets an authorization header; api_key is used instead"
                )
            }
        }
    }
}

/// Result of configuration validation.
#[derive(Debug)]
pub struct ValidationResult {
    /// Non-fatal warnings encountered during validation.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Create a new validation result with no warnings.
    pub fn ok() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    /// Create a new validation result with warnings.
    pub fn with_warnings(warnings: Vec<ValidationWarning>) -> Self {
        Self { warnings }
    }

    /// Check if validation passed with no warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
