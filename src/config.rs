//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/kbe.sqlite"
//!
//! [chunking]
//! strategy = "recursive"
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [retrieval]
//! top_k = 5
//! mode = "hybrid"
//! hybrid_weight = 0.5
//!
//! [embedding]
//! provider = "hashing"
//!
//! [vector_store]
//! backend = "sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! Values under `[chunking]` and `[retrieval]` seed new knowledge bases;
//! each knowledge base keeps its own copy afterwards.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kb_engine_core::models::{
    ChunkStrategy, ChunkingPolicy, RerankStrategy, RetrievalDefaults, SearchMode,
};
use kb_engine_core::store::DistanceMetric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            semantic_threshold: default_semantic_threshold(),
        }
    }
}

impl ChunkingConfig {
    pub fn policy(&self) -> ChunkingPolicy {
        ChunkingPolicy {
            strategy: self.strategy,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            semantic_threshold: self.semantic_threshold,
        }
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Recursive
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_semantic_threshold() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_mode")]
    pub mode: SearchMode,
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_rerank")]
    pub rerank: RerankStrategy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            mode: default_mode(),
            hybrid_weight: default_hybrid_weight(),
            candidate_k: default_candidate_k(),
            rerank: default_rerank(),
        }
    }
}

impl RetrievalConfig {
    pub fn defaults(&self) -> RetrievalDefaults {
        RetrievalDefaults {
            top_k: self.top_k,
            mode: self.mode,
            hybrid_weight: self.hybrid_weight,
            candidate_k: self.candidate_k,
            rerank: self.rerank,
        }
    }
}

fn default_top_k() -> i64 {
    5
}
fn default_mode() -> SearchMode {
    SearchMode::Hybrid
}
fn default_hybrid_weight() -> f64 {
    0.5
}
fn default_candidate_k() -> usize {
    50
}
fn default_rerank() -> RerankStrategy {
    RerankStrategy::PassThrough
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_metric")]
    pub metric: DistanceMetric,
    #[serde(default)]
    pub qdrant: Option<QdrantConfig>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            metric: default_metric(),
            qdrant: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}

#[derive(Debug, Deserialize, Clone)]
pub struct QdrantConfig {
    pub url: String,
    /// Environment variable holding the API key, if the server needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

fn default_collection_prefix() -> String {
    "kb_".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_query_ttl_secs")]
    pub query_ttl_secs: u64,
    /// `None` keeps vectors until their content changes.
    #[serde(default)]
    pub vector_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            query_ttl_secs: default_query_ttl_secs(),
            vector_ttl_secs: None,
        }
    }
}

fn default_cache_backend() -> String {
    "sqlite".to_string()
}
fn default_query_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    /// Defaults everywhere, database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            cache: CacheConfig::default(),
            training: TrainingConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!("chunking.chunk_overlap must be < chunking.chunk_size");
        }
        if !(0.0..=1.0).contains(&self.chunking.semantic_threshold) {
            bail!("chunking.semantic_threshold must be in [0.0, 1.0]");
        }

        // Validate retrieval
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_weight) {
            bail!("retrieval.hybrid_weight must be in [0.0, 1.0]");
        }

        // Validate embedding
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        match self.embedding.provider.as_str() {
            "hashing" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }

        // Validate stores
        match self.vector_store.backend.as_str() {
            "sqlite" | "memory" => {}
            "qdrant" => {
                if self.vector_store.qdrant.is_none() {
                    bail!("[vector_store.qdrant] is required when backend is 'qdrant'");
                }
            }
            other => bail!(
                "Unknown vector store backend: '{}'. Must be sqlite, memory, or qdrant.",
                other
            ),
        }
        match self.cache.backend.as_str() {
            "sqlite" | "memory" => {}
            other => bail!(
                "Unknown cache backend: '{}'. Must be sqlite or memory.",
                other
            ),
        }

        if self.training.workers == 0 {
            bail!("training.workers must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./kb.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.mode, SearchMode::Hybrid);
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.embedding.max_retries, 3);
        assert_eq!(config.vector_store.backend, "sqlite");
        assert_eq!(config.cache.query_ttl_secs, 3600);
        assert_eq!(config.training.workers, 4);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
    }

    #[test]
    fn parses_enums_and_nested_tables() {
        let config = parse(
            r#"
            [db]
            path = "kb.sqlite"

            [chunking]
            strategy = "semantic"
            chunk_size = 400
            chunk_overlap = 0

            [retrieval]
            mode = "keyword"
            rerank = "rrf"

            [vector_store]
            backend = "qdrant"
            metric = "euclidean"

            [vector_store.qdrant]
            url = "http://localhost:6333"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.strategy, ChunkStrategy::Semantic);
        assert_eq!(config.retrieval.rerank, RerankStrategy::ReciprocalRankFusion);
        assert_eq!(config.vector_store.metric, DistanceMetric::Euclidean);
        let qdrant = config.vector_store.qdrant.unwrap();
        assert_eq!(qdrant.collection_prefix, "kb_");
    }

    #[test]
    fn rejects_overlap_not_below_size() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn rejects_out_of_range_weight_and_top_k() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\nhybrid_weight = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn network_providers_need_model_and_dims() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 8\n"
        )
        .is_ok());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"bogus\"\n").is_err());
    }

    #[test]
    fn qdrant_backend_requires_its_table() {
        let err = parse("[db]\npath = \"x\"\n[vector_store]\nbackend = \"qdrant\"\n").unwrap_err();
        assert!(err.to_string().contains("vector_store.qdrant"));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
