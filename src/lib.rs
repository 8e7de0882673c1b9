//! # Freeseek
//!
//! Resilient async client for the Freeseek hosted inference API.
//!
//! The client wraps a plain HTTP/JSON API with the plumbing every caller
//! ends up writing anyway: bounded retries with exponential backoff, a
//! shared circuit breaker, bearer token renewal, streaming decoding, and
//! bounded-concurrency batching.
//!
//! ## Features
//!
//! - **Retries**: timeouts, connection failures, 429 and 5xx are retried
//!   with exponential backoff and jitter, honouring `Retry-After`
//! - **Circuit breaking**: consecutive service faults open the breaker;
//!   a single trial request probes for recovery
//! - **Token renewal**: expired or rejected tokens are renewed once, however
//!   many calls notice at the same time
//! - **Streaming**: incremental fragments as a [`futures::Stream`]
//! - **Batching**: ordered results with per-item errors or fail-fast
//! - **Middleware**: synchronous hooks around every attempt
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use freeseek::{BatchOptions, Client, ClientConfig, InferenceRequest, Model};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(ClientConfig::from_env()?)?;
//!
//!     let response = client
//!         .infer(InferenceRequest::new(Model::V3, "What is the capital of France?").temperature(0.2))
//!         .await?;
//!     println!("{} ({:?})", response.text(), response.latency());
//!
//!     let results = client
//!         .batch_prompts(Model::Light, ["a", "b", "c"], BatchOptions::default())
//!         .await?;
//!     println!("{} answers", results.iter().filter(|r| r.is_ok()).count());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`ClientConfig`] can be built in code, read from a JSON file, or taken
//! from `FREESEEK_*` environment variables. See [`ClientConfig`] for every
//! option and its default.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod batch;
pub mod circuit;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod model;
pub mod optimizer;
pub mod request;
pub mod retry;
pub mod streaming;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use auth::{ApiKeyCredentials, CredentialSource, Token, TokenExchange, TokenManager};
pub use batch::BatchOptions;
pub use circuit::{CircuitBreaker, CircuitSettings, CircuitSnapshot, CircuitState};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConfigUpdate, LoggingConfig, SamplingDefaults};
pub use error::{FreeseekError, Result};
pub use logging::init_logging;
pub use middleware::{HeaderInjector, Middleware, RequestContext, RequestLogger, ResponseContext};
pub use model::{Model, ModelSpec};
pub use optimizer::{Priority, QueryKind, QueryOptimizer};
pub use request::{InferenceRequest, InferenceResponse, ModelInfo, SamplingParams};
pub use retry::RetryPolicy;
pub use streaming::{FragmentDecoder, InferenceStream, StreamFragment};
pub use tracker::{StatsSnapshot, StatsTracker};
pub use transport::{ByteStream, HttpRequest, HttpTransport, RawResponse, Transport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
