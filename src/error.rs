//! Error types for the Freeseek client.
//!
//! Every public operation returns [`Result`], so callers always receive
//! either a value or a typed [`FreeseekError`]. The classification helpers
//! on the error drive the retry loop and the circuit breaker.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Errors that can occur while talking to the inference service.
#[derive(Error, Debug)]
pub enum FreeseekError {
    /// A request parameter failed validation before anything was sent.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// The service rejected the credentials (after one token refresh).
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth {
        /// HTTP status code returned.
        status: u16,
        /// Response body or description.
        message: String,
    },

    /// The service throttled the request (HTTP 429).
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        /// Server-provided hint for when to try again.
        retry_after: Option<Duration>,
        /// Response body or description.
        message: String,
    },

    /// The service reported a server-side fault (HTTP 500/502/503/504).
    #[error("service unavailable (HTTP {status}): {message}")]
    ServiceUnavailable {
        /// HTTP status code returned.
        status: u16,
        /// Response body or description.
        message: String,
    },

    /// The operation did not finish within its time budget.
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// The connection could not be established or was lost.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// Any other non-success HTTP status.
    #[error("endpoint returned error status {status}: {message}")]
    Http {
        /// HTTP status code returned.
        status: u16,
        /// Response body content.
        message: String,
    },

    /// The circuit breaker is open; no request was sent.
    #[error("circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen {
        /// Time left until a trial request will be admitted.
        retry_in: Duration,
    },

    /// A streamed chunk could not be decoded.
    #[error("stream error: {message}")]
    Stream {
        /// Description of what was malformed.
        message: String,
    },

    /// A response body was not the JSON we expected.
    #[error("failed to decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read a configuration file.
    #[error("failed to read config file '{path}': {source}")]
    ConfigFileRead {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A registered middleware hook failed.
    #[error("middleware '{name}' failed: {source}")]
    Middleware {
        /// Name reported by the middleware.
        name: String,
        /// Error returned by the hook.
        #[source]
        source: anyhow::Error,
    },
}

impl FreeseekError {
    /// Shorthand for a validation failure.
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP answer.
    pub fn from_status(status: u16, headers: &HeaderMap, body: &str) -> Self {
        let message = truncate_body(body);
        match status {
            401 => Self::Auth { status, message },
            429 => Self::RateLimited {
                retry_after: parse_retry_after(headers),
                message,
            },
            500 | 502 | 503 | 504 => Self::ServiceUnavailable { status, message },
            _ => Self::Http { status, message },
        }
    }

    /// Map a transport-level reqwest failure.
    pub(crate) fn from_reqwest(error: &reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout { timeout }
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), &HeaderMap::new(), &error.to_string())
        } else {
            Self::Connection {
                message: error.to_string(),
            }
        }
    }

    /// Whether the retry loop may try this request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::RateLimited { .. }
                | Self::ServiceUnavailable { .. }
        )
    }

    /// Whether the service rejected our bearer token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Auth { status: 401, .. })
    }

    /// Whether the failure indicates the service itself is unhealthy.
    ///
    /// Only these outcomes count against the circuit breaker.
    pub fn is_service_fault(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::ServiceUnavailable { .. }
        )
    }

    /// HTTP status code, when the error came from an HTTP answer.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. }
            | Self::ServiceUnavailable { status, .. }
            | Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Server-provided wait hint.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() > MAX_ERROR_BODY {
        let kept: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{kept}...")
    } else {
        body.to_string()
    }
}

/// Read `Retry-After` as a number of seconds.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Result type alias for Freeseek operations.
pub type Result<T> = std::result::Result<T, FreeseekError>;
