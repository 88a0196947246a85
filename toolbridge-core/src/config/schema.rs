//! Configuration schema type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// # Example
/// ```yaml
/// frontends:
///   - url: wss://api.example.com/mcp/
///     token: ${FRONTEND_TOKEN}
///
/// backends:
///   - name: sql-dw
///     ssh_host: localhost
///     ssh_command: python3 server.py
///   - name: aperag
///     url: https://rag.example.com/mcp
///     api_key: ${APERAG_KEY}
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity announced to frontends and backends.
    #[serde(default)]
    pub client: ClientIdentity,

    /// Cloud-facing WebSocket endpoints.
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,

    /// Local tool providers, in routing-priority order. Index 0 is the
    /// default backend.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Size and timeout limits.
    #[serde(default)]
    pub limits: Limits,
}

impl Config {
    /// Frontends with both `url` and `token` set, paired with their endpoint id.
    ///
    /// Endpoint ids are assigned from the declaration index, so a skipped
    /// entry leaves a gap rather than renumbering the rest.
    pub fn usable_frontends(&self) -> Vec<(String, &FrontendConfig)> {
        self.frontends
            .iter()
            .enumerate()
            .filter_map(|(idx, fe)| {
                if fe.url.trim().is_empty() || fe.token.trim().is_empty() {
                    tracing::error!(index = idx, "frontend entry is missing 'url' or 'token', skipping");
                    None
                } else {
                    Some((format!("endpoint-{idx}"), fe))
                }
            })
            .collect()
    }
}

/// Client identity used in `initialize` and the capability announcement.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientIdentity {
    #[serde(default = "default_client_name")]
    pub name: String,
    #[serde(default = "default_client_version")]
    pub version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
        }
    }
}

fn default_client_name() -> String {
    "toolbridge".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One cloud endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// WebSocket URL, with or without an existing query string.
    #[serde(default)]
    pub url: String,

    /// Bearer token appended to the URL as `token=`.
    #[serde(default)]
    pub token: String,
}

impl FrontendConfig {
    /// The URL with the bearer token replaced by `***`, for logging.
    pub fn masked_url(&self) -> String {
        format!("{}{}token=***", self.url, query_separator(&self.url))
    }

    /// The full connect URI including the token.
    pub fn connect_url(&self) -> String {
        format!("{}{}token={}", self.url, query_separator(&self.url), self.token)
    }
}

fn query_separator(url: &str) -> char {
    if url.contains('?') { '&' } else { '?' }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the call router rewrites a public tool name back to the native one.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrefixPolicy {
    /// Strip one disambiguation prefix layer (collapsing a doubled one).
    Strip,
    /// The backend's native names already carry its prefix; only a doubled
    /// prefix is collapsed.
    KeepNative,
}

/// Normalized names whose tools natively carry their own prefix.
const KEEP_NATIVE_BACKENDS: &[&str] = &["google_calendar", "notion"];

/// One backend entry as written in YAML.
///
/// An entry with `url` is an HTTP backend; anything else is a stream
/// backend over a local shell, an `ssh` client, or a native SSH session.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Backend identity; also the source of its disambiguation prefix.
    #[serde(default = "default_backend_name")]
    pub name: String,

    // HTTP transport
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    // Stream transport
    #[serde(default = "default_ssh_host")]
    pub ssh_host: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_command: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_password: Option<String>,

    /// Overrides the name-derived prefix policy.
    #[serde(default)]
    pub prefix_policy: Option<PrefixPolicy>,
}

fn default_backend_name() -> String {
    "unknown".to_string()
}

fn default_ssh_host() -> String {
    "localhost".to_string()
}

fn default_ssh_user() -> String {
    "user".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Resolved transport parameters for a backend entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTransport {
    Stream(StreamTransport),
    Http(HttpTransport),
}

/// How a stream backend reaches its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTransport {
    pub host: String,
    pub user: String,
    pub command: String,
    pub port: u16,
    pub password: Option<String>,
}

impl StreamTransport {
    /// Loopback hosts run the command directly through the local shell.
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransport {
    pub url: String,
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl BackendConfig {
    /// Lowercased name with `-` replaced by `_`.
    pub fn normalized_name(&self) -> String {
        normalize_backend_name(&self.name)
    }

    /// Explicit policy if configured, otherwise derived from the name.
    pub fn effective_prefix_policy(&self) -> PrefixPolicy {
        self.prefix_policy.unwrap_or_else(|| {
            if KEEP_NATIVE_BACKENDS.contains(&self.normalized_name().as_str()) {
                PrefixPolicy::KeepNative
            } else {
                PrefixPolicy::Strip
            }
        })
    }

    pub fn is_http(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Resolve the transport variant for this entry.
    pub fn transport(&self) -> BackendTransport {
        match &self.url {
            Some(url) if !url.trim().is_empty() => BackendTransport::Http(HttpTransport {
                url: url.clone(),
                api_key: self.api_key.clone().filter(|k| !k.is_empty()),
                headers: self.headers.clone(),
            }),
            _ => BackendTransport::Stream(StreamTransport {
                host: self.ssh_host.clone(),
                user: self.ssh_user.clone(),
                command: self.ssh_command.clone(),
                port: self.ssh_port,
                password: self.ssh_password.clone().filter(|p| !p.is_empty()),
            }),
        }
    }
}

/// Lowercase a backend name and replace `-` with `_`.
pub fn normalize_backend_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Size and timeout limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    /// Ceiling for one outbound frontend message, in serialized bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// First-pass bound for free-text result fields, in characters.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Lifetime of a pending request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Per-call timeout for HTTP backends.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            max_content_chars: default_max_content_chars(),
            request_timeout_secs: default_request_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Limits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn default_max_message_bytes() -> usize {
    50 * 1024
}

fn default_max_content_chars() -> usize {
    2000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendConfig {
        serde_saphyr::from_str(&format!("name: {name}\nssh_command: cat\n")).unwrap()
    }

    #[test]
    fn test_stream_backend_defaults() {
        let be = backend("sql-dw");
        assert_eq!(be.ssh_host, "localhost");
        assert_eq!(be.ssh_user, "user");
        assert_eq!(be.ssh_port, 22);
        assert!(!be.is_http());
        match be.transport() {
            BackendTransport::Stream(s) => {
                assert!(s.is_local());
                assert_eq!(s.command, "cat");
                assert!(s.password.is_none());
            }
            other => panic!("expected stream transport, got {other:?}"),
        }
    }

    #[test]
    fn test_http_backend_transport() {
        let be: BackendConfig = serde_saphyr::from_str(
            "name: aperag\nurl: https://rag.example.com/mcp\napi_key: k1\nheaders:\n  X-Extra: '1'\n",
        )
        .unwrap();
        assert!(be.is_http());
        match be.transport() {
            BackendTransport::Http(h) => {
                assert_eq!(h.url, "https://rag.example.com/mcp");
                assert_eq!(h.api_key.as_deref(), Some("k1"));
                assert_eq!(h.headers.get("X-Extra").map(String::as_str), Some("1"));
            }
            other => panic!("expected http transport, got {other:?}"),
        }
    }

    #[test]
    fn test_normalized_name_and_policy() {
        assert_eq!(backend("Google-Calendar").normalized_name(), "google_calendar");
        assert_eq!(
            backend("google-calendar").effective_prefix_policy(),
            PrefixPolicy::KeepNative
        );
        assert_eq!(backend("notion").effective_prefix_policy(), PrefixPolicy::KeepNative);
        assert_eq!(backend("sql-dw").effective_prefix_policy(), PrefixPolicy::Strip);

        let mut be = backend("notion");
        be.prefix_policy = Some(PrefixPolicy::Strip);
        assert_eq!(be.effective_prefix_policy(), PrefixPolicy::Strip);
    }

    #[test]
    fn test_connect_url_and_masking() {
        let fe = FrontendConfig {
            url: "wss://api.example.com/mcp/".into(),
            token: "s3cret".into(),
        };
        assert_eq!(fe.connect_url(), "wss://api.example.com/mcp/?token=s3cret");
        assert_eq!(fe.masked_url(), "wss://api.example.com/mcp/?token=***");

        let fe = FrontendConfig {
            url: "wss://api.example.com/mcp/?v=1".into(),
            token: "s3cret".into(),
        };
        assert_eq!(fe.connect_url(), "wss://api.example.com/mcp/?v=1&token=s3cret");
        assert!(!fe.masked_url().contains("s3cret"));
    }

    #[test]
    fn test_usable_frontends_skips_incomplete_entries() {
        let config: Config = serde_saphyr::from_str(
            "frontends:\n  - url: wss://a\n    token: t\n  - url: wss://b\n  - url: wss://c\n    token: t\n",
        )
        .unwrap();
        let ids: Vec<_> = config
            .usable_frontends()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["endpoint-0", "endpoint-2"]);
    }

    #[test]
    fn test_limits_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.max_message_bytes, 51_200);
        assert_eq!(limits.max_content_chars, 2000);
        assert_eq!(limits.request_timeout(), Duration::from_secs(60));
        assert_eq!(limits.http_timeout(), Duration::from_secs(30));
    }
}
