//! Batched, cached, retrying front of an embedding provider.
//!
//! [`Vectorizer::vectorize`] returns one result per input, in input order.
//! Identical texts are embedded once. Cached vectors (keyed by model,
//! dimensionality and content hash) skip the provider entirely; a failing
//! cache is treated as a miss.
//!
//! Providers answer per item. Items that failed transiently are re-sent
//! with exponential backoff (`base × 2^attempt`, capped at `backoff_max`)
//! up to `max_retries` times; items that succeeded keep their vectors. An
//! item whose retries run out fails alone and the call moves on to the next
//! sub-batch. A fatal error aborts the rest of the call: items still waiting
//! for a retry and every later sub-batch fail with it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kb_engine_core::cache::VectorCache;
use kb_engine_core::embedding::{EmbeddingProvider, TextEmbedder};
use kb_engine_core::text::content_hash;
use kb_engine_core::{EngineError, Result};

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl From<&EmbeddingConfig> for RetryPolicy {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

#[derive(Clone)]
pub struct Vectorizer {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Option<VectorCache>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Vectorizer {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Option<VectorCache>,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Configured batch size capped by the provider's request limit.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.min(self.provider.max_batch_size().max(1))
    }

    /// Embed `texts`, one result per input.
    pub async fn vectorize(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let model = self.provider.model_name().to_string();
        let dims = self.provider.dims();

        // unique texts by content hash, first occurrence wins
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let mut unique: Vec<(String, String)> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for (text, hash) in texts.iter().zip(&hashes) {
            if seen.insert(hash.as_str()) {
                unique.push((hash.clone(), text.clone()));
            }
        }

        let mut resolved: HashMap<String, Result<Vec<f32>>> = HashMap::new();
        let mut missing: Vec<(String, String)> = Vec::new();
        for (hash, text) in unique {
            match self.cached(&model, dims, &hash).await {
                Some(v) => {
                    resolved.insert(hash, Ok(v));
                }
                None => missing.push((hash, text)),
            }
        }

        let mut fatal: Option<EngineError> = None;
        for batch in missing.chunks(self.effective_batch_size()) {
            if let Some(err) = &fatal {
                for (hash, _) in batch {
                    resolved.insert(hash.clone(), Err(err.clone()));
                }
                continue;
            }
            let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let results = self.embed_with_retry(&inputs).await;
            for ((hash, _), result) in batch.iter().zip(results) {
                let result = match result {
                    Ok(vector) if vector.len() != dims => Err(EngineError::DimensionMismatch {
                        expected: dims,
                        actual: vector.len(),
                    }),
                    Ok(vector) => {
                        self.store(&model, dims, hash, &vector).await;
                        Ok(vector)
                    }
                    Err(e) => {
                        if matches!(e, EngineError::ProviderFatal(_)) && fatal.is_none() {
                            fatal = Some(e.clone());
                        }
                        Err(e)
                    }
                };
                resolved.insert(hash.clone(), result);
            }
        }

        hashes
            .iter()
            .map(|h| {
                resolved
                    .get(h)
                    .cloned()
                    .unwrap_or_else(|| Err(EngineError::ProviderFatal("missing embedding".into())))
            })
            .collect()
    }

    async fn cached(&self, model: &str, dims: usize, hash: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        match cache.get(model, dims, hash).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "vector cache read failed, embedding directly");
                None
            }
        }
    }

    async fn store(&self, model: &str, dims: usize, hash: &str, vector: &[f32]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(model, dims, hash, vector).await {
                tracing::warn!(error = %e, "vector cache write failed");
            }
        }
    }

    /// One result per input. Only transiently failed items are re-sent.
    async fn embed_with_retry(&self, inputs: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut results: Vec<Option<Result<Vec<f32>>>> = vec![None; inputs.len()];
        let mut pending: Vec<usize> = (0..inputs.len()).collect();
        let mut attempt = 0u32;

        while !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|&i| inputs[i].clone()).collect();
            let mut answers = self.provider.embed(&texts).await;
            if answers.len() != texts.len() {
                let err = EngineError::ProviderFatal(format!(
                    "provider returned {} results for {} inputs",
                    answers.len(),
                    texts.len()
                ));
                answers = vec![Err(err); texts.len()];
            }

            let mut retry = Vec::new();
            let mut last_transient = None;
            let mut fatal = None;
            for (i, answer) in pending.iter().copied().zip(answers) {
                match answer {
                    Err(e @ EngineError::ProviderTransient(_)) if attempt < self.retry.max_retries => {
                        retry.push(i);
                        last_transient = Some(e);
                    }
                    Err(e) => {
                        if matches!(e, EngineError::ProviderFatal(_)) {
                            fatal.get_or_insert_with(|| e.clone());
                        }
                        results[i] = Some(Err(e));
                    }
                    Ok(v) => results[i] = Some(Ok(v)),
                }
            }

            if let Some(e) = fatal {
                for i in retry {
                    results[i] = Some(Err(e.clone()));
                }
                break;
            }
            if let Some(e) = last_transient {
                let wait = self.retry.backoff(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    items = retry.len(),
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "transient embedding failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            pending = retry;
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(EngineError::ProviderFatal("missing embedding".into()))))
            .collect()
    }
}

/// All-or-nothing view used by chunking and query embedding.
#[async_trait]
impl TextEmbedder for Vectorizer {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.vectorize(texts).await.into_iter().collect()
    }
}
