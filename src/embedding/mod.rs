//! Embedding provider implementations.
//!
//! Concrete backends for the core [`EmbeddingProvider`] trait:
//! - **`hashing`**: [`HashingEmbedder`], deterministic and offline.
//! - **[`OpenAIProvider`]**: `POST {url}/embeddings` on any OpenAI-compatible API.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: fastembed models, with the `local-embeddings` feature.
//!
//! # Failure classification
//!
//! Providers make exactly one attempt per call; the vectorizer owns retry.
//! - HTTP 429, 5xx, timeouts, connection errors → `ProviderTransient`
//! - other HTTP 4xx, malformed or short responses → `ProviderFatal`
//!
//! A failed request fails every item of it. OpenAI-compatible responses are
//! matched per item by `index`, so one missing or malformed embedding fails
//! only its own input.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

pub use kb_engine_core::embedding::{EmbeddingProvider, HashingEmbedder};
use kb_engine_core::embedding::per_item;
use kb_engine_core::EngineError;

use crate::config::EmbeddingConfig;

/// Outcome for one input of an embedding request.
type ItemResult = kb_engine_core::Result<Vec<f32>>;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Map a transport error. Anything that never produced a response is worth
/// retrying.
fn transport_error(provider: &str, e: reqwest::Error) -> EngineError {
    if e.is_builder() {
        EngineError::ProviderFatal(format!("{} request could not be built: {}", provider, e))
    } else {
        EngineError::ProviderTransient(format!("{} request failed: {}", provider, e))
    }
}

/// Turn a response into JSON or a classified error.
async fn read_response(provider: &str, response: reqwest::Response) -> kb_engine_core::Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::ProviderTransient(format!("{} response timed out: {}", provider, e))
            } else {
                EngineError::ProviderFatal(format!("{} returned invalid JSON: {}", provider, e))
            }
        });
    }
    let body_text = response.text().await.unwrap_or_default();
    // Rate limited or server error, retryable
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EngineError::ProviderTransient(format!(
            "{} API error {}: {}",
            provider, status, body_text
        )))
    } else {
        Err(EngineError::ProviderFatal(format!(
            "{} API error {}: {}",
            provider, status, body_text
        )))
    }
}

fn json_vector(provider: &str, value: &Value) -> kb_engine_core::Result<Vec<f32>> {
    let items = value.as_array().ok_or_else(|| {
        EngineError::ProviderFatal(format!("invalid {} response: embedding is not an array", provider))
    })?;
    items
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EngineError::ProviderFatal(format!(
                    "invalid {} response: non-numeric embedding value",
                    provider
                ))
            })
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider for the OpenAI embeddings API and compatible servers.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    name: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let url = config
            .url
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            api_key,
            name: format!("openai:{}", model),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        2048
    }

    async fn embed(&self, texts: &[String]) -> Vec<ItemResult> {
        match self.request(texts).await {
            Ok(items) => items,
            Err(e) => vec![Err(e); texts.len()],
        }
    }
}

impl OpenAIProvider {
    async fn request(&self, texts: &[String]) -> kb_engine_core::Result<Vec<ItemResult>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;

        let json = read_response("OpenAI", response).await?;
        parse_openai_response(&json, texts.len())
    }
}

/// Extract `data[].embedding` into one slot per input, placed by `index`.
/// Inputs the response does not cover fail on their own.
fn parse_openai_response(
    json: &Value,
    expected: usize,
) -> kb_engine_core::Result<Vec<ItemResult>> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        EngineError::ProviderFatal("invalid OpenAI response: missing data array".into())
    })?;

    let mut slots: Vec<Option<ItemResult>> = vec![None; expected];
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        let Some(slot) = slots.get_mut(index) else {
            tracing::debug!(index, expected, "ignoring OpenAI embedding for unknown input");
            continue;
        };
        *slot = Some(match item.get("embedding") {
            Some(embedding) => json_vector("OpenAI", embedding),
            None => Err(EngineError::ProviderFatal(
                "invalid OpenAI response: missing embedding".into(),
            )),
        });
    }
    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.unwrap_or_else(|| {
                Err(EngineError::ProviderFatal(format!(
                    "OpenAI returned no embedding for input {}",
                    i
                )))
            })
        })
        .collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    name: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .as_deref()
            .unwrap_or(DEFAULT_OLLAMA_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            name: format!("ollama:{}", model),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        512
    }

    async fn embed(&self, texts: &[String]) -> Vec<ItemResult> {
        per_item(self.request(texts).await, texts.len())
    }
}

impl OllamaProvider {
    async fn request(&self, texts: &[String]) -> kb_engine_core::Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Ollama", e))?;

        let json = read_response("Ollama", response).await?;
        json.get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                EngineError::ProviderFatal(
                    "invalid Ollama response: missing embeddings array".into(),
                )
            })?
            .iter()
            .map(|v| json_vector("Ollama", v))
            .collect()
    }
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
mod local {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use kb_engine_core::embedding::{per_item, EmbeddingProvider};
    use kb_engine_core::rerank::PairScorer;
    use kb_engine_core::EngineError;

    use crate::config::EmbeddingConfig;

    pub fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "multilingual-e5-base" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });

        (model_name, dims)
    }

    fn fastembed_model(name: &str) -> kb_engine_core::Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => Err(EngineError::ProviderFatal(format!(
                "unknown local embedding model '{}'",
                other
            ))),
        }
    }

    /// fastembed inference on the blocking pool. The model is loaded (and
    /// downloaded on first use) by the first call.
    pub struct LocalProvider {
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
        model_id: String,
        name: String,
        dims: usize,
    }

    impl LocalProvider {
        pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
            let (model_id, dims) = resolve_local_model(config);
            fastembed_model(&model_id)?;
            Ok(Self {
                model: Arc::new(Mutex::new(None)),
                name: format!("local:{}", model_id),
                model_id,
                dims,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalProvider {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        fn max_batch_size(&self) -> usize {
            256
        }

        async fn embed(&self, texts: &[String]) -> Vec<kb_engine_core::Result<Vec<f32>>> {
            let model = self.model.clone();
            let model_id = self.model_id.clone();
            let expected = texts.len();
            let texts = texts.to_vec();

            let outcome = tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|_| EngineError::ProviderFatal("local model lock poisoned".into()))?;
                if guard.is_none() {
                    let init = fastembed::InitOptions::new(fastembed_model(&model_id)?)
                        .with_show_download_progress(false);
                    let loaded = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                        EngineError::ProviderTransient(format!(
                            "failed to initialize local embedding model: {}",
                            e
                        ))
                    })?;
                    *guard = Some(loaded);
                }
                let Some(embedder) = guard.as_mut() else {
                    return Err(EngineError::ProviderFatal("local model not loaded".into()));
                };
                embedder
                    .embed(texts, None)
                    .map_err(|e| EngineError::ProviderFatal(format!("local embedding failed: {}", e)))
            })
            .await
            .map_err(|e| EngineError::ProviderFatal(format!("embedding task failed: {}", e)))
            .and_then(|r| r);
            per_item(outcome, expected)
        }
    }

    /// Cross-encoder scores from a fastembed reranking model.
    pub struct LocalPairScorer {
        model: Arc<Mutex<Option<fastembed::TextRerank>>>,
    }

    impl LocalPairScorer {
        pub fn new() -> Self {
            Self {
                model: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl PairScorer for LocalPairScorer {
        async fn score_pairs(
            &self,
            query: &str,
            passages: &[String],
        ) -> kb_engine_core::Result<Vec<f64>> {
            let model = self.model.clone();
            let query = query.to_string();
            let passages = passages.to_vec();
            let count = passages.len();

            tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|_| EngineError::ProviderFatal("rerank model lock poisoned".into()))?;
                if guard.is_none() {
                    let init = fastembed::RerankInitOptions::new(
                        fastembed::RerankerModel::BGERerankerBase,
                    );
                    let loaded = fastembed::TextRerank::try_new(init).map_err(|e| {
                        EngineError::ProviderTransient(format!(
                            "failed to initialize rerank model: {}",
                            e
                        ))
                    })?;
                    *guard = Some(loaded);
                }
                let Some(reranker) = guard.as_mut() else {
                    return Err(EngineError::ProviderFatal("rerank model not loaded".into()));
                };
                let results = reranker
                    .rerank(query, passages, false, None)
                    .map_err(|e| EngineError::ProviderFatal(format!("rerank failed: {}", e)))?;
                let mut scores = vec![0.0; count];
                for r in results {
                    if let Some(slot) = scores.get_mut(r.index) {
                        *slot = f64::from(r.score);
                    }
                }
                Ok(scores)
            })
            .await
            .map_err(|e| EngineError::ProviderFatal(format!("rerank task failed: {}", e)))?
        }
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::{LocalPairScorer, LocalProvider};

/// Cross-encoder scorer for the `cross-encoder` rerank strategy, when one is
/// compiled in.
pub fn pair_scorer() -> Option<Arc<dyn kb_engine_core::rerank::PairScorer>> {
    #[cfg(feature = "local-embeddings")]
    {
        Some(Arc::new(LocalPairScorer::new()))
    }
    #[cfg(not(feature = "local-embeddings"))]
    {
        None
    }
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires the `local-embeddings` feature) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(HashingEmbedder::DEFAULT_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let out = parse_openai_response(&json, 2).unwrap();
        assert_eq!(out, vec![Ok(vec![1.0, 0.0]), Ok(vec![0.0, 1.0])]);
    }

    #[test]
    fn malformed_openai_response_is_fatal() {
        let err = parse_openai_response(&serde_json::json!({ "object": "list" }), 1).unwrap_err();
        assert!(matches!(err, EngineError::ProviderFatal(_)));
    }

    #[test]
    fn bad_openai_items_fail_alone() {
        let json = serde_json::json!({
            "data": [
                { "index": 0, "embedding": [1.0, 0.0] },
                { "index": 1, "embedding": ["x"] }
            ]
        });
        let out = parse_openai_response(&json, 3).unwrap();
        assert_eq!(out[0], Ok(vec![1.0, 0.0]));
        assert!(matches!(out[1], Err(EngineError::ProviderFatal(_))));
        assert!(matches!(out[2], Err(EngineError::ProviderFatal(ref m)) if m.contains("input 2")));
    }

    #[test]
    fn hashing_provider_is_default() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dims(), HashingEmbedder::DEFAULT_DIMS);
        assert!(provider.model_name().starts_with("hashing:"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "nope".to_string(),
            ..Default::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
