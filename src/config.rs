//! Configuration management for the Freeseek client.
//!
//! Configuration can be built in code, loaded from a JSON file, or read
//! from `FREESEEK_*` environment variables. Every field has a documented
//! default; [`ClientConfig::validate`] is applied before a client accepts
//! a configuration.

use crate::error::{FreeseekError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default service root. The path is versioned `v1`.
pub const DEFAULT_BASE_URL: &str = "https://api.freeseek.com/v1";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FREESEEK_";

/// Full client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// API key used to obtain bearer credentials.
    pub api_key: SecretString,

    /// Root URL of the inference service.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-attempt request timeout.
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff multiplier, in seconds.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for a single backoff wait.
    #[serde(with = "duration_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Consecutive service faults before the breaker opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the breaker stays open before admitting a trial request.
    #[serde(with = "duration_serde", default = "default_circuit_recovery_timeout")]
    pub circuit_recovery_timeout: Duration,

    /// Lifetime of tokens minted from the API key.
    #[serde(with = "duration_serde", default = "default_token_ttl")]
    pub token_ttl: Duration,

    /// Requests in flight during batch inference.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Optional client-side cap in requests per second.
    #[serde(default)]
    pub rate_limit: Option<u32>,

    /// Remaining-quota level at which requests start being paced.
    #[serde(default = "default_rate_limit_low_water")]
    pub rate_limit_low_water: u64,

    /// Sampling defaults applied to requests that leave a parameter unset.
    #[serde(default)]
    pub defaults: SamplingDefaults,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sampling parameters used when a request does not set them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingDefaults {
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling mass.
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Generation length cap. Falls back to the model default when unset.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Level directive for the `freeseek` target (`trace` .. `error`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Emit JSON lines instead of the compact format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            json: false,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_batch_concurrency() -> usize {
    5
}

fn default_rate_limit_low_water() -> u64 {
    5
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Configuration with every default and the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            base_url: default_base_url(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            max_backoff: default_max_backoff(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout: default_circuit_recovery_timeout(),
            token_ttl: default_token_ttl(),
            batch_concurrency: default_batch_concurrency(),
            rate_limit: None,
            rate_limit_low_water: default_rate_limit_low_water(),
            defaults: SamplingDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Point the client at a different service root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| FreeseekError::ConfigFileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            FreeseekError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `FREESEEK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load configuration through a custom variable lookup.
    ///
    /// `lookup` receives full variable names such as `FREESEEK_API_KEY`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = var("API_KEY").ok_or_else(|| {
            FreeseekError::InvalidConfig(format!("{ENV_PREFIX}API_KEY is not set"))
        })?;
        let mut config = Self::new(api_key);

        if let Some(url) = var("BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = var("TIMEOUT") {
            config.timeout = parse_duration(&secs).map_err(|e| env_error("TIMEOUT", &e))?;
        }
        if let Some(n) = var("MAX_RETRIES") {
            config.max_retries = parse_number(&n, "MAX_RETRIES")?;
        }
        if let Some(f) = var("BACKOFF_FACTOR") {
            config.backoff_factor = parse_number(&f, "BACKOFF_FACTOR")?;
        }
        if let Some(n) = var("CIRCUIT_FAILURE_THRESHOLD") {
            config.circuit_failure_threshold = parse_number(&n, "CIRCUIT_FAILURE_THRESHOLD")?;
        }
        if let Some(secs) = var("CIRCUIT_RECOVERY_TIMEOUT") {
            config.circuit_recovery_timeout =
                parse_duration(&secs).map_err(|e| env_error("CIRCUIT_RECOVERY_TIMEOUT", &e))?;
        }
        if let Some(n) = var("BATCH_CONCURRENCY") {
            config.batch_concurrency = parse_number(&n, "BATCH_CONCURRENCY")?;
        }
        if let Some(n) = var("RATE_LIMIT") {
            config.rate_limit = Some(parse_number(&n, "RATE_LIMIT")?);
        }
        if let Some(level) = var("LOG_LEVEL") {
            config.logging.log_level = level.to_lowercase();
        }
        if let Some(file) = var("LOG_FILE") {
            config.logging.log_file = Some(PathBuf::from(file));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(invalid("api_key cannot be empty"));
        }

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(FreeseekError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }

        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than 0"));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(invalid("backoff_factor must be a finite, non-negative number"));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(invalid("circuit_failure_threshold must be greater than 0"));
        }

        if self.batch_concurrency == 0 {
            return Err(invalid("batch_concurrency must be greater than 0"));
        }

        if self.rate_limit == Some(0) {
            return Err(invalid("rate_limit must be greater than 0 when set"));
        }

        let defaults = &self.defaults;
        if !(0.0..=2.0).contains(&defaults.temperature) {
            return Err(invalid("defaults.temperature must be within [0, 2]"));
        }
        if !(defaults.top_p > 0.0 && defaults.top_p <= 1.0) {
            return Err(invalid("defaults.top_p must be within (0, 1]"));
        }
        if defaults.max_tokens == Some(0) {
            return Err(invalid("defaults.max_tokens must be greater than 0 when set"));
        }

        Ok(())
    }

    /// Base URL joined with a relative path.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Apply an update, returning the merged configuration.
    ///
    /// The result is validated; `self` is left untouched on error.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(timeout) = update.timeout {
            next.timeout = timeout;
        }
        if let Some(max_retries) = update.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(backoff_factor) = update.backoff_factor {
            next.backoff_factor = backoff_factor;
        }
        if let Some(max_backoff) = update.max_backoff {
            next.max_backoff = max_backoff;
        }
        if let Some(threshold) = update.circuit_failure_threshold {
            next.circuit_failure_threshold = threshold;
        }
        if let Some(recovery) = update.circuit_recovery_timeout {
            next.circuit_recovery_timeout = recovery;
        }
        if let Some(concurrency) = update.batch_concurrency {
            next.batch_concurrency = concurrency;
        }
        if let Some(low_water) = update.rate_limit_low_water {
            next.rate_limit_low_water = low_water;
        }
        if let Some(defaults) = &update.defaults {
            next.defaults = defaults.clone();
        }
        next.validate()?;
        Ok(next)
    }
}

/// The mutable subset of [`ClientConfig`].
///
/// Unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    /// New per-attempt timeout.
    #[serde(default, with = "duration_serde::option")]
    pub timeout: Option<Duration>,
    /// New retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// New backoff multiplier, in seconds.
    #[serde(default)]
    pub backoff_factor: Option<f64>,
    /// New backoff cap.
    #[serde(default, with = "duration_serde::option")]
    pub max_backoff: Option<Duration>,
    /// New breaker threshold.
    #[serde(default)]
    pub circuit_failure_threshold: Option<u32>,
    /// New breaker recovery timeout.
    #[serde(default, with = "duration_serde::option")]
    pub circuit_recovery_timeout: Option<Duration>,
    /// New batch concurrency.
    #[serde(default)]
    pub batch_concurrency: Option<usize>,
    /// New pacing threshold.
    #[serde(default)]
    pub rate_limit_low_water: Option<u64>,
    /// New sampling defaults.
    #[serde(default)]
    pub defaults: Option<SamplingDefaults>,
}

fn invalid(message: &str) -> FreeseekError {
    FreeseekError::InvalidConfig(message.to_string())
}

fn env_error(name: &str, detail: &str) -> FreeseekError {
    FreeseekError::InvalidConfig(format!("{ENV_PREFIX}{name}: {detail}"))
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| env_error(name, &e.to_string()))
}

/// Parse `"250ms"`, `"30s"` or a bare number of seconds.
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let (number, scale) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(secs) = raw.strip_suffix('s') {
        (secs, 1.0)
    } else {
        (raw, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a duration"))?;
    Duration::try_from_secs_f64(value * scale)
        .map_err(|_| format!("'{raw}' is not a valid duration"))
}

/// Serde support for durations written as `"30s"`, `"100ms"` or bare seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    fn convert<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Text(s) => super::parse_duration(&s).map_err(E::custom),
            Raw::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| E::custom(format!("{secs} is not a valid duration"))),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        convert(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::{Raw, convert};
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Raw>::deserialize(deserializer)?
                .map(convert)
                .transpose()
        }
    }
}
