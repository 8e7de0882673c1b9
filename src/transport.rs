//! Single-attempt HTTP transport.
//!
//! A [`Transport`] sends exactly one request and reports the outcome. It
//! applies the timeout and serializes the body, but never retries; the
//! retry loop and circuit breaker live in [`crate::client`].

use crate::error::{FreeseekError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tracing::trace;

/// Body of a response, delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A fully described outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers, including `Authorization`.
    pub headers: HeaderMap,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// Time budget for the attempt.
    pub timeout: Duration,
    /// Whether the caller will consume the body incrementally.
    ///
    /// For streaming requests the timeout bounds the wait for response
    /// headers only.
    pub streaming: bool,
}

impl HttpRequest {
    /// Bearer token carried by the request, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }
}

/// A successful (2xx) answer whose body has not been read yet.
pub struct RawResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: ByteStream,
}

impl RawResponse {
    /// Build a response from pre-split body chunks.
    pub fn from_chunks<I>(status: StatusCode, headers: HeaderMap, chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let chunks: Vec<Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self {
            status,
            headers,
            body: Box::pin(stream::iter(chunks)),
        }
    }

    /// A `200 OK` response carrying a JSON document.
    pub fn json(value: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::from_chunks(StatusCode::OK, headers, [value.to_string()])
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }

    /// Read the whole body as JSON.
    pub async fn into_json(self) -> Result<Value> {
        let bytes = self.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends one request, once.
///
/// Implementations return `Ok` only for 2xx answers. Anything else is
/// classified through [`FreeseekError::from_status`], and network failures
/// become [`FreeseekError::Timeout`] or [`FreeseekError::Connection`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a single attempt.
    async fn send(&self, request: HttpRequest) -> Result<RawResponse>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with connection pooling and compression.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, application/x-ndjson"),
        );
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(concat!("freeseek-rs/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| FreeseekError::Connection {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client })
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse> {
        let timeout = request.timeout;
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!(method = %request.method, url = %request.url, "Sending request");

        let response = if request.streaming {
            tokio::time::timeout(timeout, builder.send())
                .await
                .map_err(|_| FreeseekError::Timeout { timeout })?
        } else {
            builder.timeout(timeout).send().await
        }
        .map_err(|e| FreeseekError::from_reqwest(&e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FreeseekError::from_status(status.as_u16(), &headers, &body));
        }

        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| FreeseekError::from_reqwest(&e, timeout)));

        Ok(RawResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
