//! Request and response types for inference calls.
//!
//! [`InferenceRequest`] is validated before it reaches the transport and
//! serialized into the JSON body the service expects. Response types are
//! immutable values once decoded.

use crate::config::SamplingDefaults;
use crate::error::{FreeseekError, Result};
use crate::model::Model;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Sampling parameters. Unset fields fall back to config, then model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature, within `[0, 2]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling mass, within `(0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Frequency penalty, within `[-2, 2]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,

    /// Presence penalty, within `[-2, 2]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    /// Generation length cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A single inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Model to run.
    pub model: Model,

    /// Prompt text.
    pub prompt: String,

    /// Sampling parameters.
    #[serde(flatten)]
    pub params: SamplingParams,

    /// Ask the service for an incremental response.
    #[serde(default)]
    pub stream: bool,
}

impl InferenceRequest {
    /// Create a request with default sampling parameters.
    pub fn new(model: Model, prompt: impl Into<String>) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            params: SamplingParams::default(),
            stream: false,
        }
    }

    /// Set the temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    /// Set top-p.
    #[must_use]
    pub fn top_p(mut self, top_p: f64) -> Self {
        self.params.top_p = Some(top_p);
        self
    }

    /// Set the frequency penalty.
    #[must_use]
    pub fn frequency_penalty(mut self, penalty: f64) -> Self {
        self.params.frequency_penalty = Some(penalty);
        self
    }

    /// Set the presence penalty.
    #[must_use]
    pub fn presence_penalty(mut self, penalty: f64) -> Self {
        self.params.presence_penalty = Some(penalty);
        self
    }

    /// Set the generation length cap.
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    /// Check every parameter against its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(FreeseekError::validation("prompt", "prompt cannot be empty"));
        }

        let p = &self.params;
        if let Some(t) = p.temperature {
            check_range("temperature", t, 0.0, 2.0)?;
        }
        if let Some(top_p) = p.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(FreeseekError::validation(
                    "top_p",
                    format!("{top_p} is outside (0, 1]"),
                ));
            }
        }
        if let Some(penalty) = p.frequency_penalty {
            check_range("frequency_penalty", penalty, -2.0, 2.0)?;
        }
        if let Some(penalty) = p.presence_penalty {
            check_range("presence_penalty", penalty, -2.0, 2.0)?;
        }
        if let Some(max_tokens) = p.max_tokens {
            let limit = self.model.spec().max_output_tokens;
            if max_tokens == 0 || max_tokens > limit {
                return Err(FreeseekError::validation(
                    "max_tokens",
                    format!("{max_tokens} is outside [1, {limit}] for {}", self.model),
                ));
            }
        }

        Ok(())
    }

    /// Build the JSON body sent to the inference endpoint.
    ///
    /// Parameters the request leaves unset are filled from `defaults`, then
    /// from the model's own defaults.
    pub fn build_body(&self, defaults: &SamplingDefaults) -> Value {
        let spec = self.model.spec();
        let p = &self.params;

        let mut data = Map::new();
        data.insert("prompt".into(), Value::String(self.prompt.clone()));
        data.insert(
            "temperature".into(),
            Value::from(p.temperature.unwrap_or(defaults.temperature)),
        );
        data.insert("top_p".into(), Value::from(p.top_p.unwrap_or(defaults.top_p)));
        if let Some(penalty) = p.frequency_penalty {
            data.insert("frequency_penalty".into(), Value::from(penalty));
        }
        if let Some(penalty) = p.presence_penalty {
            data.insert("presence_penalty".into(), Value::from(penalty));
        }
        let max_tokens = p
            .max_tokens
            .or(defaults.max_tokens)
            .unwrap_or(spec.default_max_tokens)
            .min(spec.max_output_tokens);
        data.insert("max_tokens".into(), Value::from(max_tokens));

        serde_json::json!({
            "model": self.model.id(),
            "data": data,
            "stream": self.stream,
        })
    }

    /// Get a display string for logging.
    pub fn display_prompt(&self) -> String {
        if self.prompt.chars().count() > 50 {
            let head: String = self.prompt.chars().take(50).collect();
            format!("{head}...")
        } else {
            self.prompt.clone()
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(FreeseekError::validation(
            field,
            format!("{value} is outside [{min}, {max}]"),
        ))
    }
}

/// Body of a successful inference answer, as sent by the service.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(alias = "output", alias = "result")]
    pub text: String,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub model_version: Option<String>,
}

/// A completed inference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResponse {
    text: String,
    latency: Duration,
    tokens_used: Option<u64>,
    model_version: Option<String>,
}

impl InferenceResponse {
    /// Create a response value.
    pub fn new(
        text: impl Into<String>,
        latency: Duration,
        tokens_used: Option<u64>,
        model_version: Option<String>,
    ) -> Self {
        Self {
            text: text.into(),
            latency,
            tokens_used,
            model_version,
        }
    }

    pub(crate) fn from_wire(wire: WireResponse, latency: Duration) -> Self {
        Self::new(wire.text, latency, wire.tokens_used, wire.model_version)
    }

    /// Generated text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Wall-clock time of the whole call, retries included.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Tokens billed for the call, if reported.
    pub fn tokens_used(&self) -> Option<u64> {
        self.tokens_used
    }

    /// Model version that served the call, if reported.
    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }
}

/// Metadata describing a model, as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier.
    #[serde(alias = "model_name")]
    pub id: String,

    /// Deployed version.
    #[serde(default)]
    pub version: Option<String>,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Context window size in tokens.
    #[serde(default)]
    pub context_length: Option<u64>,

    /// Availability, e.g. `available`.
    #[serde(default)]
    pub status: Option<String>,
}
