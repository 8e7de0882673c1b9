//! Concurrent fan-out of many inference requests.

use crate::client::Client;
use crate::error::{FreeseekError, Result};
use crate::model::Model;
use crate::request::{InferenceRequest, InferenceResponse};
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{info, warn};

/// How a batch is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Requests in flight at once. Defaults to `batch_concurrency` from the
    /// client configuration.
    pub concurrency: Option<usize>,
    /// Abort the whole batch on the first error.
    pub fail_fast: bool,
}

impl BatchOptions {
    /// Options with a fixed concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
            fail_fast: false,
        }
    }

    /// Enable or disable fail-fast mode.
    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

impl Client {
    /// Run many inferences with bounded concurrency.
    ///
    /// Results come back in input order. Without fail-fast every slot holds
    /// its own outcome and the outer `Result` is always `Ok`. With fail-fast
    /// the first error in completion order is returned and requests still
    /// in flight are cancelled.
    pub async fn batch_infer(
        &self,
        requests: Vec<InferenceRequest>,
        options: BatchOptions,
    ) -> Result<Vec<Result<InferenceResponse>>> {
        let workers = options
            .concurrency
            .unwrap_or_else(|| self.config().batch_concurrency);
        if workers == 0 {
            return Err(FreeseekError::InvalidConfig(
                "batch concurrency must be greater than 0".into(),
            ));
        }

        let total = requests.len();
        let start = Instant::now();
        info!(total, workers, fail_fast = options.fail_fast, "Starting batch");

        let results = if options.fail_fast {
            self.batch_fail_fast(requests, workers)
                .await?
                .into_iter()
                .map(Ok)
                .collect()
        } else {
            stream::iter(requests)
                .map(|request| self.infer(request))
                .buffered(workers)
                .collect::<Vec<_>>()
                .await
        };

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            total,
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        Ok(results)
    }

    /// Same prompt settings for every entry of `prompts`.
    pub async fn batch_prompts<I, S>(
        &self,
        model: Model,
        prompts: I,
        options: BatchOptions,
    ) -> Result<Vec<Result<InferenceResponse>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requests = prompts
            .into_iter()
            .map(|prompt| InferenceRequest::new(model, prompt))
            .collect();
        self.batch_infer(requests, options).await
    }

    async fn batch_fail_fast(
        &self,
        requests: Vec<InferenceRequest>,
        workers: usize,
    ) -> Result<Vec<InferenceResponse>> {
        let mut slots: Vec<Option<InferenceResponse>> = vec![None; requests.len()];

        let mut pending = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move { (index, self.infer(request).await) })
            .buffer_unordered(workers);

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(response) => slots[index] = Some(response),
                Err(e) => {
                    warn!(index, error = %e, "Batch aborted on first failure");
                    return Err(e);
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let options = BatchOptions::with_concurrency(3).fail_fast(true);
        assert_eq!(options.concurrency, Some(3));
        assert!(options.fail_fast);
        assert_eq!(BatchOptions::default().concurrency, None);
    }
}
