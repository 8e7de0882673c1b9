//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use freeseek::{Client, ClientConfig, FreeseekError, HttpRequest, RawResponse, Result, Transport};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A request as the stub saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub at: Instant,
    pub request: HttpRequest,
}

/// Transport that answers through a closure and records every invocation.
///
/// The closure receives the request and its zero-based call index.
pub struct StubTransport<F> {
    handler: F,
    seen: Mutex<Vec<Seen>>,
}

impl<F, Fut> StubTransport<F>
where
    F: Fn(HttpRequest, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse>> + Send,
{
    pub fn new(handler: F) -> Arc<Self> {
        Arc::new(Self {
            handler,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl<F, Fut> Transport for StubTransport<F>
where
    F: Fn(HttpRequest, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse>> + Send,
{
    async fn send(&self, request: HttpRequest) -> Result<RawResponse> {
        let index = {
            let mut seen = self.seen.lock();
            seen.push(Seen {
                at: Instant::now(),
                request: request.clone(),
            });
            seen.len() - 1
        };
        (self.handler)(request, index).await
    }
}

/// A 200 answer with the given generated text.
pub fn text(text: &str) -> Result<RawResponse> {
    Ok(RawResponse::json(&json!({ "text": text, "tokens_used": 1 })))
}

/// A non-2xx answer, classified the way the HTTP transport does.
pub fn status(code: u16) -> Result<RawResponse> {
    Err(FreeseekError::from_status(
        code,
        &HeaderMap::new(),
        &format!("status {code}"),
    ))
}

/// Config with fast backoff, pointed at a dummy host.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::new("test-key").with_base_url("http://stub.local/v1");
    config.backoff_factor = 0.01;
    config.max_backoff = Duration::from_secs(1);
    config
}

/// Client over the given transport.
pub fn client_with(config: ClientConfig, transport: Arc<dyn Transport>) -> Client {
    Client::builder(config)
        .transport(transport)
        .build()
        .expect("client should build")
}

/// Prompt sent in an inference request body.
pub fn prompt_of(request: &HttpRequest) -> String {
    request
        .body
        .as_ref()
        .and_then(|b| b.pointer("/data/prompt"))
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string()
}
