//! HTTP backend: one POST per envelope.
//!
//! There is no persistent socket; `connect` only arms the client. Replies
//! are either a JSON body or an event stream whose first JSON-parseable
//! `data:` line is the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::config::HttpTransport;
use crate::error::BackendError;
use crate::jsonrpc::{JsonRpcMessageKind, classify_jsonrpc};

use super::{Backend, BackendContext};

const ACCEPT_VALUE: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

/// Bound on TCP connect plus TLS handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest body excerpt included in a log line.
const LOG_BODY_CHARS: usize = 200;

/// Backend reached over HTTP.
pub struct HttpBackend {
    context: BackendContext,
    url: String,
    client: Client,
    /// Whole-request bound applied by `client`.
    timeout: Duration,
    connected: AtomicBool,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.context.name)
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Ensure the endpoint URL ends with exactly one `/`.
pub fn normalize_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

/// `Bearer <key>`, unless the key already carries the scheme.
pub fn bearer_value(api_key: &str) -> String {
    if api_key.starts_with("Bearer ") {
        api_key.to_string()
    } else {
        format!("Bearer {api_key}")
    }
}

/// Default headers for every call. Configured `authorization` headers are
/// skipped; the bearer comes from `api_key` only.
pub fn default_headers(backend: &str, transport: &HttpTransport) -> Result<HeaderMap, BackendError> {
    let invalid = |what: &str, reason: String| BackendError::Http {
        backend: backend.to_string(),
        reason: format!("invalid header {what}: {reason}"),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));

    for (key, value) in &transport.headers {
        if key.eq_ignore_ascii_case("authorization") {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| invalid(key, e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(key, e.to_string()))?;
        headers.insert(name, value);
    }

    match transport.api_key.as_deref() {
        Some(key) => {
            let mut value = HeaderValue::from_str(&bearer_value(key))
                .map_err(|e| invalid("authorization", e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        None => tracing::warn!(backend, "http backend has no api_key, sending without authorization"),
    }

    Ok(headers)
}

/// Extract the response from an event-stream body.
///
/// The first `data:` line that parses as JSON wins. A body with no such
/// line is tried as plain JSON.
pub fn parse_event_stream(body: &str) -> Option<Value> {
    body.lines()
        .filter_map(|line| line.trim().strip_prefix("data:"))
        .find_map(|data| serde_json::from_str(data.trim_start()).ok())
        .or_else(|| serde_json::from_str(body.trim()).ok())
}

fn excerpt(body: &str) -> String {
    body.chars().take(LOG_BODY_CHARS).collect()
}

impl HttpBackend {
    /// # Errors
    ///
    /// Fails if a configured header is not a valid HTTP header or the
    /// client cannot be built.
    pub fn new(
        context: BackendContext,
        transport: HttpTransport,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let headers = default_headers(&context.name, &transport)?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(headers)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| BackendError::Http {
                backend: context.name.clone(),
                reason: format!("client build failed: {e}"),
            })?;

        Ok(Self {
            url: normalize_url(&transport.url),
            context,
            client,
            timeout,
            connected: AtomicBool::new(false),
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        let backend = self.context.name.clone();
        if e.is_timeout() {
            return BackendError::Timeout {
                backend,
                timeout_secs: self.timeout.as_secs(),
            };
        }
        self.connected.store(false, Ordering::Release);
        tracing::error!(backend = %backend, error = %e, "http transport failure, marking disconnected");
        BackendError::Http {
            backend,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn context(&self) -> &BackendContext {
        &self.context
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<(), BackendError> {
        self.connected.store(true, Ordering::Release);
        tracing::info!(backend = %self.context.name, url = %self.url, "http backend ready");
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
        let expects_reply = matches!(kind, JsonRpcMessageKind::Request { .. });

        let method = envelope
            .get("method")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        tracing::debug!(backend = %backend, method, "http post");
        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(backend = %backend, status = status.as_u16(), body = %excerpt(&body), "http error status");
            return Err(BackendError::HttpStatus {
                backend: backend.clone(),
                status: status.as_u16(),
            });
        }
        if !expects_reply {
            return Ok(None);
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains(EVENT_STREAM));
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        let parsed = if is_event_stream {
            parse_event_stream(&body).ok_or_else(|| "no JSON data line in event stream".to_string())
        } else {
            serde_json::from_str::<Value>(&body).map_err(|e| e.to_string())
        };

        match parsed {
            Ok(value) if value.is_object() => Ok(Some(value)),
            Ok(_) => Err(BackendError::Decode {
                backend: backend.clone(),
                reason: "reply is not a JSON object".to_string(),
            }),
            Err(reason) => {
                tracing::warn!(backend = %backend, body = %excerpt(&body), "undecodable http reply");
                Err(BackendError::Decode {
                    backend: backend.clone(),
                    reason,
                })
            }
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!(backend = %self.context.name, "http backend disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientIdentity;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(url: &str, api_key: Option<&str>) -> HttpBackend {
        backend_with_timeout(url, api_key, Duration::from_secs(5))
    }

    fn backend_with_timeout(url: &str, api_key: Option<&str>, timeout: Duration) -> HttpBackend {
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = BackendContext {
            index: 2,
            name: "aperag".into(),
            client: ClientIdentity::default(),
            request_timeout: Duration::from_secs(5),
            events: tx,
        };
        let mut headers = BTreeMap::new();
        headers.insert("X-Extra".to_string(), "1".to_string());
        headers.insert("Authorization".to_string(), "ignored".to_string());
        HttpBackend::new(
            context,
            HttpTransport {
                url: url.to_string(),
                api_key: api_key.map(str::to_string),
                headers,
            },
            timeout,
        )
        .unwrap()
    }

    fn request(id: i64) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": "tools/list", "params": {}})
    }

    #[test]
    fn test_normalize_url_and_bearer() {
        assert_eq!(normalize_url("https://h/mcp"), "https://h/mcp/");
        assert_eq!(normalize_url("https://h/mcp///"), "https://h/mcp/");
        assert_eq!(bearer_value("abc"), "Bearer abc");
        assert_eq!(bearer_value("Bearer abc"), "Bearer abc");
    }

    #[test]
    fn test_parse_event_stream() {
        let body = "event: message\ndata: not-json\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\ndata: {\"id\":2}\n\n";
        assert_eq!(parse_event_stream(body).unwrap()["id"], 1);
        assert_eq!(parse_event_stream("{\"id\":3}").unwrap()["id"], 3);
        assert!(parse_event_stream("event: ping\n\n").is_none());
    }

    #[tokio::test]
    async fn test_json_reply_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp/"))
            .and(header("authorization", "Bearer k1"))
            .and(header("accept", ACCEPT_VALUE))
            .and(header("x-extra", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": 10_001, "result": {"tools": []}}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let be = backend(&format!("{}/mcp", server.uri()), Some("k1"));
        be.connect().await.unwrap();
        let reply = be.send_message(request(10_001)).await.unwrap().unwrap();
        assert_eq!(reply["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_event_stream_reply() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        let reply = be.send_message(request(7)).await.unwrap().unwrap();
        assert_eq!(reply["result"]["ok"], true);
    }

    #[tokio::test]
    async fn test_error_status_is_failure_but_stays_connected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        let err = be.send_message(request(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::HttpStatus { status: 500, .. }));
        assert!(be.is_connected());
    }

    #[tokio::test]
    async fn test_slow_reply_times_out_with_client_bound() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let be = backend_with_timeout(&server.uri(), Some("k1"), Duration::from_secs(1));
        be.connect().await.unwrap();
        let err = be.send_message(request(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { timeout_secs: 1, .. }));
        assert!(be.is_connected());
    }

    #[tokio::test]
    async fn test_notification_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        let reply = be
            .send_message(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        let err = be.send_message(request(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_marks_disconnected() {
        // Bind and drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let be = backend(&format!("http://127.0.0.1:{port}/mcp"), Some("k1"));
        be.connect().await.unwrap();
        let err = be.send_message(request(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Http { .. }));
        assert!(!be.is_connected());
    }

    #[tokio::test]
    async fn test_initialize_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::body_partial_json(json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": "2024-11-05"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        be.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_rejected_without_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32600, "message": "no"}}),
            ))
            .mount(&server)
            .await;

        let be = backend(&server.uri(), Some("k1"));
        be.connect().await.unwrap();
        assert!(matches!(
            be.initialize().await,
            Err(BackendError::InitializeRejected { .. })
        ));
    }
}
