//! The wire seam below the publishers.
//!
//! Publishers speak [`HttpTransport`] rather than a concrete client so
//! protocol lifecycles are testable without a network. The production
//! implementation wraps a shared `reqwest::Client` configured with the
//! subsystem's timeouts and TLS floor.

use crate::config::PublishingConfig;
use crate::error::{PublishError, TransportKind};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Longest response-body prefix carried inside an error.
pub const BODY_PREFIX_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// One outbound request. Headers are passed through verbatim; the
/// transport adds only `Content-Type: application/json`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self { method: HttpMethod::Post, url: url.into(), headers: Vec::new(), body }
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self { method: HttpMethod::Put, url: url.into(), headers: Vec::new(), body }
    }

    pub fn with_headers<'a, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.headers.extend(headers.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// A response that made it back over the wire, any status included.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// `Retry-After` in seconds, when the endpoint sent one.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, tolerating empty and non-JSON bodies.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// Convert a non-2xx response into the typed error.
    pub fn into_error(self) -> PublishError {
        PublishError::Http {
            status: self.status,
            body_prefix: truncate_prefix(&self.body),
            retry_after: self.retry_after,
        }
    }
}

fn truncate_prefix(body: &str) -> String {
    let mut end = BODY_PREFIX_LEN.min(body.len());
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Executes requests. Implementations must map transport-level
/// failures to [`PublishError::Transport`] / [`PublishError::Timeout`]
/// and return `Ok` for any response that carries an HTTP status.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, PublishError>;
}

/// Production transport on a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_payload_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(config: &PublishingConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.http_connect_timeout)
            .timeout(config.http_request_timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|e| PublishError::Transport {
                kind: TransportKind::Other,
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client, max_payload_bytes: config.max_payload_bytes })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, PublishError> {
        let body = serde_json::to_vec(&request.body).map_err(|e| PublishError::Transport {
            kind: TransportKind::Other,
            message: format!("payload serialization failed: {e}"),
        })?;
        if body.len() > self.max_payload_bytes {
            return Err(PublishError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_payload_bytes,
            });
        }

        let method = match request.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };
        let mut builder = self
            .client
            .request(method, &request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let started = std::time::Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Err(map_reqwest_error(e, started.elapsed())),
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => return Err(map_reqwest_error(e, started.elapsed())),
        };

        Ok(HttpResponse { status, body, retry_after })
    }
}

fn map_reqwest_error(e: reqwest::Error, elapsed: Duration) -> PublishError {
    if e.is_timeout() {
        return PublishError::Timeout { elapsed };
    }
    let kind = io_kind(&e)
        .map(|kind| match kind {
            std::io::ErrorKind::ConnectionRefused => TransportKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                TransportKind::ConnectionReset
            }
            std::io::ErrorKind::TimedOut => TransportKind::Timeout,
            _ => TransportKind::Other,
        })
        .unwrap_or(if e.is_connect() { TransportKind::ConnectionRefused } else { TransportKind::Other });
    PublishError::Transport { kind, message: e.to_string() }
}

/// Walk the source chain looking for the underlying io error.
fn io_kind(e: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = err.source();
    }
    None
}
