//! The Freeseek client.
//!
//! Every public operation funnels through one attempt loop:
//!
//! 1. pace (client-side rate limit and server quota hints)
//! 2. ask the circuit breaker for a permit
//! 3. attach a bearer token and run `before_request` middleware
//! 4. send once through the [`Transport`]
//! 5. classify the outcome, then retry, refresh the token, or return
//!
//! Configuration is held as an `Arc` snapshot taken at the start of each
//! call, so [`Client::update_config`] never disturbs calls in flight.

use crate::auth::{ApiKeyCredentials, CredentialSource, TokenManager};
use crate::circuit::{CircuitBreaker, CircuitSettings, CircuitSnapshot, CircuitState};
use crate::config::{ClientConfig, ConfigUpdate};
use crate::error::{FreeseekError, Result};
use crate::middleware::{Middleware, MiddlewareStack, RequestContext, ResponseContext};
use crate::model::Model;
use crate::request::{InferenceRequest, InferenceResponse, ModelInfo, WireResponse};
use crate::retry::RetryPolicy;
use crate::streaming::InferenceStream;
use crate::tracker::{RateLimitTracker, StatsSnapshot, StatsTracker};
use crate::transport::{HttpRequest, HttpTransport, RawResponse, Transport};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde_json::Value;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    middleware: MiddlewareStack,
}

impl ClientBuilder {
    /// Start from a configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            credentials: None,
            middleware: MiddlewareStack::new(),
        }
    }

    /// Send requests through a custom transport instead of `reqwest`.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Obtain bearer tokens from a custom source.
    ///
    /// Defaults to [`ApiKeyCredentials`].
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Register a middleware. Middlewares run in registration order.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a shared middleware.
    #[must_use]
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.timeout)?),
        };
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(ApiKeyCredentials));

        let limiter = config
            .rate_limit
            .map(|rps| {
                NonZeroU32::new(rps)
                    .map(|rps| RateLimiter::direct(Quota::per_second(rps)))
                    .ok_or_else(|| {
                        FreeseekError::InvalidConfig("rate_limit must be greater than 0".into())
                    })
            })
            .transpose()?;

        info!(
            base_url = %config.base_url,
            timeout_ms = config.timeout.as_millis() as u64,
            max_retries = config.max_retries,
            middleware = self.middleware.len(),
            "Freeseek client ready"
        );

        Ok(Client {
            inner: Arc::new(Inner {
                breaker: CircuitBreaker::new(circuit_settings(&config)),
                config: RwLock::new(Arc::new(config)),
                transport,
                tokens: TokenManager::new(credentials),
                stats: StatsTracker::new(),
                quota: RateLimitTracker::new(),
                limiter,
                middleware: self.middleware,
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

fn circuit_settings(config: &ClientConfig) -> CircuitSettings {
    CircuitSettings {
        failure_threshold: config.circuit_failure_threshold,
        recovery_timeout: config.circuit_recovery_timeout,
    }
}

struct Inner {
    config: RwLock<Arc<ClientConfig>>,
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
    breaker: CircuitBreaker,
    stats: StatsTracker,
    quota: RateLimitTracker,
    limiter: Option<DefaultDirectRateLimiter>,
    middleware: MiddlewareStack,
}

/// Async client for the Freeseek inference API.
///
/// Cheap to clone; clones share the token, circuit breaker, and statistics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// One logical call, before any attempt is made.
struct Call {
    method: Method,
    path: String,
    model: Option<Model>,
    body: Option<Value>,
    streaming: bool,
}

/// A successful attempt.
struct Answer {
    response: RawResponse,
    request_id: String,
    elapsed: Duration,
}

impl Client {
    /// Build a client with the default transport and credentials.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config).build()
    }

    /// Start a [`ClientBuilder`].
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Run one inference.
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let mut request = request;
        request.validate()?;
        request.stream = false;

        let config = self.config();
        let start = Instant::now();
        let call = Call {
            method: Method::POST,
            path: request.model.spec().endpoint.to_string(),
            model: Some(request.model),
            body: Some(request.build_body(&config.defaults)),
            streaming: false,
        };

        debug!(model = %request.model, prompt = %request.display_prompt(), "Inference requested");

        let result = async {
            let body = self.call_json(&config, call).await?;
            let wire: WireResponse = serde_json::from_value(body)?;
            Ok::<_, FreeseekError>(InferenceResponse::from_wire(wire, start.elapsed()))
        }
        .await;

        match &result {
            Ok(response) => {
                self.inner.stats.record_success(response.latency());
                debug!(
                    model = %request.model,
                    latency_ms = response.latency().as_millis() as u64,
                    tokens = response.tokens_used(),
                    "Inference complete"
                );
            }
            Err(e) => {
                self.inner.stats.record_failure();
                warn!(model = %request.model, error = %e, "Inference failed");
            }
        }
        result
    }

    /// Start a streaming inference.
    ///
    /// Retries and the circuit breaker cover establishing the stream; once
    /// fragments flow, errors are delivered through the stream itself.
    pub async fn stream_infer(&self, request: InferenceRequest) -> Result<InferenceStream> {
        let mut request = request;
        request.validate()?;
        request.stream = true;

        let config = self.config();
        let start = Instant::now();
        let call = Call {
            method: Method::POST,
            path: request.model.spec().endpoint.to_string(),
            model: Some(request.model),
            body: Some(request.build_body(&config.defaults)),
            streaming: true,
        };

        let result = async {
            let answer = self.execute(&config, call).await?;
            let mut context = ResponseContext {
                request_id: answer.request_id,
                status: answer.response.status,
                headers: answer.response.headers,
                body: None,
                elapsed: answer.elapsed,
            };
            self.inner.middleware.after_response(&mut context)?;
            Ok::<_, FreeseekError>(InferenceStream::from_body(answer.response.body))
        }
        .await;

        match &result {
            Ok(_) => self.inner.stats.record_success(start.elapsed()),
            Err(_) => self.inner.stats.record_failure(),
        }
        result
    }

    /// Metadata for one model.
    pub async fn get_model_info(&self, model: Model) -> Result<ModelInfo> {
        let body = self.get(&format!("models/{}", model.id()), Some(model)).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Input schema of one model, as raw JSON.
    pub async fn get_model_schema(&self, model: Model) -> Result<Value> {
        self.get(&format!("models/{}/schema", model.id()), Some(model))
            .await
    }

    /// Every model the service offers.
    ///
    /// Accepts either a bare array or an object wrapping it under `models`
    /// or `data`.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let body = self.get("models", None).await?;
        let list = match body {
            Value::Object(mut map) => map
                .remove("models")
                .or_else(|| map.remove("data"))
                .unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        Ok(serde_json::from_value(list)?)
    }

    /// Renew the bearer token now.
    pub async fn refresh_token(&self) -> Result<()> {
        let config = self.config();
        self.inner.tokens.refresh(&config).await?;
        Ok(())
    }

    /// Merge, validate, and swap in new settings.
    ///
    /// Calls already running keep the snapshot they started with.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<Arc<ClientConfig>> {
        let mut current = self.inner.config.write();
        let next = Arc::new(current.merged(update)?);
        self.inner.breaker.reconfigure(circuit_settings(&next));
        *current = Arc::clone(&next);

        info!(
            timeout_ms = next.timeout.as_millis() as u64,
            max_retries = next.max_retries,
            backoff_factor = next.backoff_factor,
            circuit_failure_threshold = next.circuit_failure_threshold,
            "Configuration updated"
        );
        Ok(next)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ClientConfig> {
        self.inner.config.read().clone()
    }

    /// Current circuit breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Circuit breaker state and counters.
    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.inner.breaker.snapshot()
    }

    /// Force the circuit breaker closed.
    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
    }

    /// Call statistics since the client was built.
    pub fn metrics(&self) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.tokens.refresh_count())
    }

    async fn get(&self, path: &str, model: Option<Model>) -> Result<Value> {
        let config = self.config();
        let call = Call {
            method: Method::GET,
            path: path.to_string(),
            model,
            body: None,
            streaming: false,
        };
        let start = Instant::now();
        let result = self.call_json(&config, call).await;
        match &result {
            Ok(_) => self.inner.stats.record_success(start.elapsed()),
            Err(_) => self.inner.stats.record_failure(),
        }
        result
    }

    /// Execute a call and decode its body, running `after_response` hooks.
    async fn call_json(&self, config: &ClientConfig, call: Call) -> Result<Value> {
        let answer = self.execute(config, call).await?;
        let status = answer.response.status;
        let headers = answer.response.headers.clone();
        let body = answer.response.into_json().await?;

        let mut context = ResponseContext {
            request_id: answer.request_id,
            status,
            headers,
            body: Some(body),
            elapsed: answer.elapsed,
        };
        self.inner.middleware.after_response(&mut context)?;
        Ok(context.body.unwrap_or(Value::Null))
    }

    /// The attempt loop.
    async fn execute(&self, config: &ClientConfig, call: Call) -> Result<Answer> {
        let inner = &self.inner;
        let policy = RetryPolicy::from_config(config);
        let request_id = new_request_id();
        let url = config.endpoint_url(&call.path);

        let mut attempt = 0u32;
        let mut retries = 0u32;
        let mut refreshed = false;

        loop {
            attempt += 1;
            self.pace(config).await;

            let permit = match inner.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    inner.stats.record_circuit_rejection();
                    warn!(request_id = %request_id, error = %e, "Request rejected by circuit breaker");
                    return Err(e);
                }
            };

            let token = inner.tokens.token(config).await?;
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, token.header_value()?);

            let mut context = RequestContext {
                request_id: request_id.clone(),
                model: call.model,
                attempt,
                method: call.method.clone(),
                url: url.clone(),
                headers,
                body: call.body.clone(),
            };
            inner.middleware.before_request(&mut context)?;

            let request = HttpRequest {
                method: context.method,
                url: context.url,
                headers: context.headers,
                body: context.body,
                timeout: config.timeout,
                streaming: call.streaming,
            };

            let started = Instant::now();
            let error = match inner.transport.send(request).await {
                Ok(response) => {
                    permit.success();
                    inner.quota.observe(&response.headers);
                    debug!(
                        request_id = %request_id,
                        attempt,
                        status = response.status.as_u16(),
                        "Attempt succeeded"
                    );
                    return Ok(Answer {
                        response,
                        request_id,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            if error.is_service_fault() {
                permit.failure();
            } else {
                permit.success();
            }
            if matches!(error, FreeseekError::RateLimited { .. }) {
                inner.stats.record_rate_limited();
            }

            if error.is_unauthorized() && !refreshed {
                refreshed = true;
                warn!(request_id = %request_id, attempt, "Token rejected, refreshing");
                inner.tokens.refresh_rejected(config, &token).await?;
                continue;
            }

            if !error.is_retryable() || retries >= policy.max_retries {
                if retries > 0 {
                    warn!(
                        request_id = %request_id,
                        attempts = attempt,
                        error = %error,
                        "Giving up after retries"
                    );
                }
                return Err(error);
            }

            retries += 1;
            inner.stats.record_retry();
            let backoff = policy.delay(retries, error.retry_after());
            warn!(
                request_id = %request_id,
                attempt,
                retry = retries,
                max_retries = policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );
            sleep(backoff).await;
        }
    }

    /// Wait for the client-side limiter and any server quota hint.
    async fn pace(&self, config: &ClientConfig) {
        if let Some(limiter) = &self.inner.limiter {
            limiter.until_ready().await;
        }
        if let Some(delay) = self
            .inner
            .quota
            .pacing_delay(config.rate_limit_low_water, config.max_backoff)
        {
            debug!(
                delay_ms = delay.as_millis() as u64,
                remaining = self.inner.quota.remaining(),
                "Quota low, pacing request"
            );
            sleep(delay).await;
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config())
            .field("circuit", &self.inner.breaker.snapshot())
            .field("tokens", &self.inner.tokens)
            .field("middleware", &self.inner.middleware)
            .finish_non_exhaustive()
    }
}

fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
