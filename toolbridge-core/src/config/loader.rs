//! Configuration loading and validation.
//!
//! Loading flow: locate file → read → substitute `${VAR}` references →
//! parse YAML → apply environment overrides → validate.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::{BackendTransport, Config};

/// Environment variable that overrides every stream backend's password.
pub const SSH_PASSWORD_ENV: &str = "SSH_PASSWORD";

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("TOOLBRIDGE_CONFIG") {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from("./config/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file from the search paths.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    // An explicit path (CLI flag) is never substituted with a default.
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse configuration text, including env substitution and overrides.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(contents)?;
    let mut config: Config = serde_saphyr::from_str(&contents)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

/// Apply process-environment overrides that take precedence over the file.
///
/// `SSH_PASSWORD`, when set and non-empty, replaces the password of every
/// stream backend.
pub fn apply_env_overrides(config: &mut Config) {
    let Ok(password) = std::env::var(SSH_PASSWORD_ENV) else {
        return;
    };
    if password.is_empty() {
        return;
    }
    for backend in config.backends.iter_mut().filter(|b| !b.is_http()) {
        backend.ssh_password = Some(password.clone());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// Literal pattern; compilation is covered by `test_env_var_pattern_compiles`.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a configuration.
///
/// Checks only what would make the gateway misbehave; whether a backend
/// is actually reachable is discovered at connect time.
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.backends.is_empty() {
        return Err(ConfigError::NoBackendsDefined);
    }

    let mut names = HashSet::new();
    let mut prefixes = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.name.trim().is_empty() {
            return Err(ConfigError::EmptyBackendName { index });
        }
        if !names.insert(backend.name.as_str()) {
            return Err(ConfigError::DuplicateBackendName {
                name: backend.name.clone(),
            });
        }
        let prefix = backend.normalized_name();
        if !prefixes.insert(prefix.clone()) {
            warnings.push(ValidationWarning::SharedPrefix { prefix });
        }

        match backend.transport() {
            BackendTransport::Http(http) => {
                if let Err(e) = url::Url::parse(&http.url) {
                    return Err(ConfigError::InvalidUrl {
                        url: http.url,
                        message: e.to_string(),
                    });
                }
                if http
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("authorization"))
                {
                    warnings.push(ValidationWarning::AuthorizationHeaderIgnored {
                        backend: backend.name.clone(),
                    });
                }
            }
            BackendTransport::Stream(stream) => {
                if stream.command.trim().is_empty() {
                    return Err(ConfigError::MissingCommand {
                        name: backend.name.clone(),
                    });
                }
            }
        }
    }

    let mut usable_frontends = 0;
    for (index, frontend) in config.frontends.iter().enumerate() {
        if frontend.url.trim().is_empty() || frontend.token.trim().is_empty() {
            warnings.push(ValidationWarning::IncompleteFrontend { index });
            continue;
        }
        if let Err(e) = url::Url::parse(&frontend.url) {
            return Err(ConfigError::InvalidUrl {
                url: frontend.url.clone(),
                message: e.to_string(),
            });
        }
        usable_frontends += 1;
    }
    if usable_frontends == 0 {
        return Err(ConfigError::NoFrontendsDefined);
    }

    let limits = &config.limits;
    if limits.max_message_bytes == 0 {
        return Err(ConfigError::InvalidLimit {
            field: "max_message_bytes",
        });
    }
    if limits.request_timeout_secs == 0 {
        return Err(ConfigError::InvalidLimit {
            field: "request_timeout_secs",
        });
    }
    if limits.http_timeout_secs == 0 {
        return Err(ConfigError::InvalidLimit {
            field: "http_timeout_secs",
        });
    }

    Ok(ValidationResult::with_warnings(warnings))
}
