//! Pre-request and post-response interceptors.
//!
//! Middlewares are registered on [`crate::ClientBuilder`] and run in
//! registration order around every transport attempt. Both hooks are
//! synchronous and may mutate what they are given.

use crate::error::{FreeseekError, Result};
use crate::model::Model;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outgoing request as seen by middleware.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Identifier shared by every attempt of one logical call.
    pub request_id: String,
    /// Model the call targets, when there is one.
    pub model: Option<Model>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers. `Authorization` is present and marked sensitive.
    pub headers: HeaderMap,
    /// JSON body.
    pub body: Option<Value>,
}

/// Incoming response as seen by middleware.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// Identifier of the logical call.
    pub request_id: String,
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// JSON body. `None` for streaming responses.
    pub body: Option<Value>,
    /// Time spent in the transport for this attempt.
    pub elapsed: Duration,
}

/// A request/response interceptor.
///
/// Both hooks default to doing nothing. Returning an error aborts the call
/// with [`FreeseekError::Middleware`]; such failures are not retried.
pub trait Middleware: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Inspect or modify the request before it is sent.
    fn before_request(&self, _request: &mut RequestContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Inspect or modify the response after it is received.
    fn after_response(&self, _response: &mut ResponseContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An ordered list of middlewares.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run every `before_request` hook in order.
    pub fn before_request(&self, request: &mut RequestContext) -> Result<()> {
        for layer in &self.layers {
            layer
                .before_request(request)
                .map_err(|source| FreeseekError::Middleware {
                    name: layer.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every `after_response` hook in order.
    pub fn after_response(&self, response: &mut ResponseContext) -> Result<()> {
        for layer in &self.layers {
            layer
                .after_response(response)
                .map_err(|source| FreeseekError::Middleware {
                    name: layer.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|m| m.name()))
            .finish()
    }
}

/// Logs every request and response with its request id and model.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn name(&self) -> &str {
        "request-logger"
    }

    fn before_request(&self, request: &mut RequestContext) -> anyhow::Result<()> {
        info!(
            request_id = %request.request_id,
            model = request.model.map(Model::id),
            attempt = request.attempt,
            method = %request.method,
            url = %request.url,
            "Sending request"
        );
        Ok(())
    }

    fn after_response(&self, response: &mut ResponseContext) -> anyhow::Result<()> {
        info!(
            request_id = %response.request_id,
            status = response.status.as_u16(),
            elapsed_ms = response.elapsed.as_millis() as u64,
            "Response received"
        );
        Ok(())
    }
}

/// Adds fixed headers to every request.
#[derive(Debug, Clone, Default)]
pub struct HeaderInjector {
    headers: HeaderMap,
}

impl HeaderInjector {
    /// Create an injector with no headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, validating name and value.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            FreeseekError::InvalidConfig(format!("invalid header name '{name}': {e}"))
        })?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FreeseekError::InvalidConfig(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

impl Middleware for HeaderInjector {
    fn name(&self) -> &str {
        "header-injector"
    }

    fn before_request(&self, request: &mut RequestContext) -> anyhow::Result<()> {
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
