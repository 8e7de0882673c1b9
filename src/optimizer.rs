//! Prompt and model tuning applied as a middleware.

use crate::middleware::{Middleware, RequestContext, ResponseContext};
use crate::model::Model;
use crate::tracker::RATE_LIMIT_REMAINING;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Prompts kept for length statistics.
const HISTORY_LEN: usize = 50;
/// Prompt length cap under [`Priority::Speed`], in characters.
const SPEED_PROMPT_CHARS: usize = 250;
const ACCURACY_SUFFIX: &str = " Provide detailed and accurate results.";
/// Below this many remaining requests every prompt goes to [`Model::Light`].
pub const LOW_QUOTA_THRESHOLD: u64 = 10;
const QUOTA_UNKNOWN: u64 = u64::MAX;

/// What the optimizer trades for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Shorter prompts.
    Speed,
    /// Prompts are left as they are.
    #[default]
    Balanced,
    /// Prompts ask for detailed answers.
    Accuracy,
}

/// Rough category of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Mentions code, scripts or functions.
    Coding,
    /// Asks for writing, stories or poems.
    Creative,
    /// Anything else.
    General,
}

/// Rewrites inference requests before they are sent.
///
/// With auto model selection on, short prompts go to [`Model::Light`],
/// medium ones to [`Model::V3`] and long ones to [`Model::Pro`]. Once the
/// service reports fewer than [`LOW_QUOTA_THRESHOLD`] remaining requests,
/// everything goes to [`Model::Light`] until the quota recovers.
#[derive(Debug)]
pub struct QueryOptimizer {
    priority: Priority,
    auto_model: bool,
    history: Mutex<VecDeque<usize>>,
    quota_remaining: AtomicU64,
}

impl QueryOptimizer {
    /// Optimizer with the given priority and auto model selection off.
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            auto_model: false,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            quota_remaining: AtomicU64::new(QUOTA_UNKNOWN),
        }
    }

    /// Enable or disable model selection by prompt length.
    #[must_use]
    pub fn auto_model(mut self, enabled: bool) -> Self {
        self.auto_model = enabled;
        self
    }

    /// Model suited to a prompt of this length.
    pub fn select_model(prompt: &str) -> Model {
        match prompt.chars().count() {
            0..50 => Model::Light,
            50..200 => Model::V3,
            _ => Model::Pro,
        }
    }

    /// Model for this prompt, taking the last reported quota into account.
    pub fn choose_model(&self, prompt: &str) -> Model {
        if self.quota_remaining.load(Ordering::Relaxed) < LOW_QUOTA_THRESHOLD {
            Model::Light
        } else {
            Self::select_model(prompt)
        }
    }

    /// Apply the priority to a prompt.
    pub fn optimize_prompt(&self, prompt: &str) -> String {
        match self.priority {
            Priority::Speed => prompt.chars().take(SPEED_PROMPT_CHARS).collect(),
            Priority::Balanced => prompt.to_string(),
            Priority::Accuracy => format!("{prompt}{ACCURACY_SUFFIX}"),
        }
    }

    /// Categorize a prompt by keyword.
    pub fn classify(prompt: &str) -> QueryKind {
        let lower = prompt.to_lowercase();
        if ["code", "script", "function"].iter().any(|k| lower.contains(k)) {
            QueryKind::Coding
        } else if ["write", "story", "poem"].iter().any(|k| lower.contains(k)) {
            QueryKind::Creative
        } else {
            QueryKind::General
        }
    }

    /// Mean length, in characters, of recently seen prompts.
    pub fn average_prompt_len(&self) -> Option<f64> {
        let history = self.history.lock();
        if history.is_empty() {
            return None;
        }
        Some(history.iter().sum::<usize>() as f64 / history.len() as f64)
    }

    fn remember(&self, len: usize) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(len);
    }
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(Priority::Balanced)
    }
}

impl Middleware for QueryOptimizer {
    fn name(&self) -> &str {
        "query-optimizer"
    }

    fn before_request(&self, request: &mut RequestContext) -> anyhow::Result<()> {
        let Some(body) = request.body.as_mut() else {
            return Ok(());
        };
        let Some(prompt) = body
            .pointer("/data/prompt")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            return Ok(());
        };

        if request.attempt == 1 {
            self.remember(prompt.chars().count());
        }

        if self.auto_model {
            let model = self.choose_model(&prompt);
            body["model"] = Value::String(model.id().to_string());
            let limit = u64::from(model.spec().max_output_tokens);
            if let Some(max_tokens) = body.pointer_mut("/data/max_tokens") {
                if max_tokens.as_u64().is_some_and(|n| n > limit) {
                    *max_tokens = Value::from(limit);
                }
            }
            request.model = Some(model);
        }

        let optimized = self.optimize_prompt(&prompt);
        body["data"]["prompt"] = Value::String(optimized);

        let kind = Self::classify(&prompt);
        debug!(
            request_id = %request.request_id,
            model = request.model.map(Model::id),
            kind = ?kind,
            priority = ?self.priority,
            "Request optimized"
        );
        if request.attempt == 1 && self.history.lock().len() > 10 {
            if let Some(avg) = self.average_prompt_len() {
                info!(avg_prompt_chars = avg, "Prompt length trend");
            }
        }
        Ok(())
    }

    fn after_response(&self, response: &mut ResponseContext) -> anyhow::Result<()> {
        let remaining = response
            .headers
            .get(RATE_LIMIT_REMAINING)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(remaining) = remaining {
            self.quota_remaining.store(remaining, Ordering::Relaxed);
        }
        Ok(())
    }
}
