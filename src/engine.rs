//! The engine facade.
//!
//! [`KnowledgeEngine`] wires the metadata store, vector store, keyword
//! index, caches, embedding provider, retriever and training orchestrator
//! together and exposes the operations the CLI and HTTP server call:
//! knowledge-base and document management, background training runs,
//! training status and queries with citations.
//!
//! Build it from a [`Config`] with [`KnowledgeEngine::open`], or from
//! injected components with [`KnowledgeEngine::from_parts`]. Call
//! [`KnowledgeEngine::shutdown`] to cancel active runs and wait for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kb_engine_core::cache::{CacheStore, MemoryCache, QueryCache, VectorCache};
use kb_engine_core::embedding::EmbeddingProvider;
use kb_engine_core::models::{
    Candidate, ChunkingPolicy, Citation, Document, DocumentStatus, DocumentProgress,
    KnowledgeBaseConfig, QueryHit, QueryOptions, QueryResponse, RetrievalDefaults,
    RetrievalParams, SearchMode, SourceType, TrainingOptions, TrainingReport, TrainingStatus,
};
use kb_engine_core::rerank::{reranker_for, PairScorer};
use kb_engine_core::retrieve::Retriever;
use kb_engine_core::store::memory::{MemoryKeywordIndex, MemoryMetadataStore, MemoryVectorStore};
use kb_engine_core::store::{KeywordIndex, MetadataStore, VectorStore};
use kb_engine_core::{EngineError, Result};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::progress::{NoProgress, TrainingProgressReporter};
use crate::qdrant::QdrantStore;
use crate::sqlite_store::SqliteStore;
use crate::vectorizer::{RetryPolicy, Vectorizer};
use crate::{db, embedding, migrate};

/// Components an engine is assembled from.
pub struct EngineParts {
    pub metadata: Arc<dyn MetadataStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub keywords: Arc<dyn KeywordIndex>,
    /// Backs both the query cache and the vector cache. `None` disables caching.
    pub cache: Option<Arc<dyn CacheStore>>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub pair_scorer: Option<Arc<dyn PairScorer>>,
}

impl EngineParts {
    /// Everything in memory around the given provider.
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            metadata: Arc::new(MemoryMetadataStore::new()),
            vectors: Arc::new(MemoryVectorStore::default()),
            keywords: Arc::new(MemoryKeywordIndex::new()),
            cache: Some(Arc::new(MemoryCache::new())),
            provider,
            pair_scorer: None,
        }
    }
}

/// Parameters of a new knowledge base; unset fields take the configured defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewKnowledgeBase {
    pub name: String,
    #[serde(default)]
    pub chunking: Option<ChunkingPolicy>,
    #[serde(default)]
    pub retrieval: Option<RetrievalDefaults>,
}

/// Changes to an existing knowledge base.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct KnowledgeBaseUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// A new policy resets every document to `pending`.
    #[serde(default)]
    pub chunking: Option<ChunkingPolicy>,
    #[serde(default)]
    pub retrieval: Option<RetrievalDefaults>,
    /// Move the knowledge base onto the engine's current embedding provider
    /// and vector backend. Drops all vectors and the recorded dimensionality.
    #[serde(default)]
    pub reembed: bool,
}

type RunResult = Option<Result<TrainingReport>>;

struct RunHandle {
    serial: u64,
    cancel: CancellationToken,
    done: watch::Receiver<RunResult>,
}

/// Holds a knowledge base's run slot while its configuration changes.
/// Training cannot start until it is dropped.
struct ConfigSlot {
    runs: Arc<DashMap<String, RunHandle>>,
    kb_id: String,
    serial: u64,
    done: watch::Sender<RunResult>,
}

impl Drop for ConfigSlot {
    fn drop(&mut self) {
        self.runs
            .remove_if(&self.kb_id, |_, handle| handle.serial == self.serial);
        self.done.send_replace(Some(Err(EngineError::Conflict(format!(
            "knowledge base {} was reconfigured while training was requested",
            self.kb_id
        )))));
    }
}

pub struct KnowledgeEngine {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<dyn KeywordIndex>,
    query_cache: Option<QueryCache>,
    vectorizer: Vectorizer,
    retriever: Retriever,
    orchestrator: Orchestrator,
    pair_scorer: Option<Arc<dyn PairScorer>>,
    chunking: ChunkingPolicy,
    retrieval: RetrievalDefaults,
    runs: Arc<DashMap<String, RunHandle>>,
    last_reports: Arc<DashMap<String, TrainingReport>>,
    next_serial: AtomicU64,
    shutdown: CancellationToken,
    pool: Option<SqlitePool>,
}

impl KnowledgeEngine {
    /// Open the engine described by `config`: connect and migrate the
    /// database, then build the configured backends and provider.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let metric = config.vector_store.metric;
        let sqlite = Arc::new(SqliteStore::with_metric(pool.clone(), metric));
        let timeout = Duration::from_secs(config.embedding.timeout_secs);

        let vectors: Arc<dyn VectorStore> = match config.vector_store.backend.as_str() {
            "memory" => Arc::new(MemoryVectorStore::new(metric)),
            "qdrant" => {
                let qdrant = config
                    .vector_store
                    .qdrant
                    .as_ref()
                    .context("[vector_store.qdrant] is required when backend is 'qdrant'")?;
                Arc::new(QdrantStore::new(qdrant, metric, timeout)?)
            }
            _ => sqlite.clone(),
        };
        let cache: Arc<dyn CacheStore> = match config.cache.backend.as_str() {
            "memory" => Arc::new(MemoryCache::new()),
            _ => {
                let purged = sqlite.purge_expired_cache().await?;
                if purged > 0 {
                    tracing::debug!(purged, "removed expired cache entries");
                }
                sqlite.clone()
            }
        };

        let parts = EngineParts {
            metadata: sqlite.clone(),
            vectors,
            keywords: sqlite,
            cache: Some(cache),
            provider: embedding::create_provider(&config.embedding)?,
            pair_scorer: embedding::pair_scorer(),
        };
        let mut engine = Self::from_parts(parts, &config);
        engine.pool = Some(pool);
        tracing::info!(
            db = %config.db.path.display(),
            provider = engine.vectorizer.model_name(),
            vectors = engine.vectors.backend_name(),
            "engine ready"
        );
        Ok(engine)
    }

    /// Assemble an engine from injected components. `config` supplies the
    /// defaults, batching, retry, TTL and worker settings.
    pub fn from_parts(parts: EngineParts, config: &Config) -> Self {
        let query_cache = parts.cache.as_ref().map(|store| {
            QueryCache::new(
                store.clone(),
                Duration::from_secs(config.cache.query_ttl_secs),
            )
        });
        let vector_cache = parts.cache.as_ref().map(|store| {
            VectorCache::new(
                store.clone(),
                config.cache.vector_ttl_secs.map(Duration::from_secs),
            )
        });
        let vectorizer = Vectorizer::new(
            parts.provider,
            vector_cache,
            config.embedding.batch_size,
            RetryPolicy::from(&config.embedding),
        );
        let retriever = Retriever::new(
            parts.vectors.clone(),
            parts.keywords.clone(),
            parts.metadata.clone(),
        );
        let orchestrator = Orchestrator::new(
            parts.metadata.clone(),
            parts.vectors.clone(),
            parts.keywords.clone(),
            vectorizer.clone(),
            query_cache.clone(),
            config.training.workers,
        );
        Self {
            metadata: parts.metadata,
            vectors: parts.vectors,
            keywords: parts.keywords,
            query_cache,
            vectorizer,
            retriever,
            orchestrator,
            pair_scorer: parts.pair_scorer,
            chunking: config.chunking.policy(),
            retrieval: config.retrieval.defaults(),
            runs: Arc::new(DashMap::new()),
            last_reports: Arc::new(DashMap::new()),
            next_serial: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            pool: None,
        }
    }

    /// Cancel active training runs, wait for them and close the database.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let active: Vec<String> = self.runs.iter().map(|r| r.key().clone()).collect();
        for kb_id in active {
            if let Err(e) = self.wait_for_training(&kb_id).await {
                tracing::warn!(kb = %kb_id, error = %e, "training run ended with an error");
            }
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    pub fn embedding_model(&self) -> &str {
        self.vectorizer.model_name()
    }

    pub fn vector_backend(&self) -> &str {
        self.vectors.backend_name()
    }

    // ============ Knowledge bases ============

    pub async fn create_knowledge_base(&self, request: NewKnowledgeBase) -> Result<KnowledgeBaseConfig> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("knowledge base name must not be empty"));
        }
        if self
            .metadata
            .list_knowledge_bases()
            .await?
            .iter()
            .any(|kb| kb.name == name)
        {
            return Err(EngineError::Conflict(format!(
                "knowledge base '{}' already exists",
                name
            )));
        }

        let chunking = request.chunking.unwrap_or_else(|| self.chunking.clone());
        chunking.validate()?;
        let retrieval = request.retrieval.unwrap_or_else(|| self.retrieval.clone());
        RetrievalParams::from(&retrieval).validate()?;

        let kb = KnowledgeBaseConfig::new(
            name,
            chunking,
            self.vectorizer.model_name(),
            self.vectors.backend_name(),
            retrieval,
        );
        self.metadata.save_knowledge_base(&kb).await?;
        tracing::info!(kb = %kb.id, name = %kb.name, "knowledge base created");
        Ok(kb)
    }

    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseConfig>> {
        self.metadata.list_knowledge_bases().await
    }

    /// Look up a knowledge base by id, falling back to its name.
    pub async fn knowledge_base(&self, id_or_name: &str) -> Result<KnowledgeBaseConfig> {
        if let Some(kb) = self.metadata.load_knowledge_base_config(id_or_name).await? {
            return Ok(kb);
        }
        self.metadata
            .list_knowledge_bases()
            .await?
            .into_iter()
            .find(|kb| kb.name == id_or_name)
            .ok_or_else(|| EngineError::not_found(format!("knowledge base {}", id_or_name)))
    }

    pub async fn update_knowledge_base_config(
        &self,
        kb_id: &str,
        update: KnowledgeBaseUpdate,
    ) -> Result<KnowledgeBaseConfig> {
        let id = self.knowledge_base(kb_id).await?.id;
        let _slot = self.claim_config_slot(&id)?;
        // re-read under the slot
        let mut kb = self.knowledge_base(&id).await?;

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(EngineError::invalid("knowledge base name must not be empty"));
            }
            kb.name = name.trim().to_string();
        }
        if let Some(retrieval) = update.retrieval {
            RetrievalParams::from(&retrieval).validate()?;
            kb.retrieval = retrieval;
        }
        let mut reset = false;
        if let Some(chunking) = update.chunking {
            chunking.validate()?;
            if chunking != kb.chunking {
                kb.chunking = chunking;
                reset = true;
            }
        }
        let moved = update.reembed
            && (kb.embedding_model != self.vectorizer.model_name()
                || kb.vector_backend != self.vectors.backend_name()
                || kb.embedding_dims.is_some());
        if moved {
            if kb.vector_backend == self.vectors.backend_name() {
                self.vectors.delete_all(&kb.id).await?;
            }
            self.keywords.clear(&kb.id).await?;
            kb.embedding_model = self.vectorizer.model_name().to_string();
            kb.vector_backend = self.vectors.backend_name().to_string();
            kb.embedding_dims = None;
            reset = true;
        }
        kb.updated_at = kb_engine_core::models::now_ts();

        if reset {
            for doc in self.metadata.list_documents(&kb.id).await? {
                let lock = self.orchestrator.document_lock(&doc.id);
                let _guard = lock.lock().await;
                if moved {
                    self.orchestrator.clear_document(&kb.id, &doc.id).await?;
                }
                self.metadata
                    .save_document_state(&doc.id, DocumentStatus::Pending, None)
                    .await?;
            }
        }
        self.metadata.save_knowledge_base(&kb).await?;
        self.invalidate(&kb.id).await;
        tracing::info!(kb = %kb.id, reset, moved, "knowledge base updated");
        Ok(kb)
    }

    fn claim_config_slot(&self, kb_id: &str) -> Result<ConfigSlot> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        match self.runs.entry(kb_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "knowledge base {} is training; cancel or wait for the run first",
                kb_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    serial,
                    cancel: CancellationToken::new(),
                    done: rx,
                });
                Ok(ConfigSlot {
                    runs: self.runs.clone(),
                    kb_id: kb_id.to_string(),
                    serial,
                    done: tx,
                })
            }
        }
    }

    // ============ Documents ============

    /// Register a document as `pending`. `declared_type` is a short name
    /// (`pdf`, `md`, ...) or a MIME type.
    pub async fn add_document(
        &self,
        kb_id: &str,
        name: &str,
        declared_type: &str,
        content: &[u8],
        content_ref: Option<String>,
    ) -> Result<Document> {
        let kb = self.knowledge_base(kb_id).await?;
        let source_type = SourceType::from_declared(declared_type)?;
        if name.trim().is_empty() {
            return Err(EngineError::invalid("document name must not be empty"));
        }
        let doc = Document::new(&kb.id, name.trim(), source_type, content_ref, content);
        self.metadata.add_document(&doc, content).await?;
        tracing::debug!(kb = %kb.id, doc = %doc.id, name = %doc.name, "document added");
        Ok(doc)
    }

    pub async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>> {
        let kb = self.knowledge_base(kb_id).await?;
        self.metadata.list_documents(&kb.id).await
    }

    /// Soft-delete a document and purge its vectors, lexical entries and chunks.
    pub async fn remove_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        let kb = self.knowledge_base(kb_id).await?;
        let doc = self
            .metadata
            .load_document(doc_id)
            .await?
            .filter(|d| d.kb_id == kb.id && !d.deleted)
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;

        let lock = self.orchestrator.document_lock(&doc.id);
        let _guard = lock.lock().await;
        self.metadata.soft_delete_document(&doc.id).await?;
        self.orchestrator.clear_document(&kb.id, &doc.id).await?;
        self.invalidate(&kb.id).await;
        tracing::info!(kb = %kb.id, doc = %doc.id, "document removed");
        Ok(())
    }

    // ============ Training ============

    /// Start a background training run. Returns `false` when a run for this
    /// knowledge base is already active; that run keeps going untouched.
    pub async fn start_training(
        &self,
        kb_id: &str,
        options: TrainingOptions,
        progress: Arc<dyn TrainingProgressReporter>,
    ) -> Result<bool> {
        let kb = self.knowledge_base(kb_id).await?;
        Ok(self.spawn_run(&kb, options, progress)?.is_some())
    }

    /// Spawn a run unless one is active. The returned receiver resolves
    /// with the outcome of the new run.
    fn spawn_run(
        &self,
        kb: &KnowledgeBaseConfig,
        options: TrainingOptions,
        progress: Arc<dyn TrainingProgressReporter>,
    ) -> Result<Option<watch::Receiver<RunResult>>> {
        self.orchestrator.check_compatible(kb)?;

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        let (tx, rx) = watch::channel(None);
        match self.runs.entry(kb.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(kb = %kb.id, "training already running");
                return Ok(None);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    serial,
                    cancel: cancel.clone(),
                    done: rx.clone(),
                });
            }
        }

        let orchestrator = self.orchestrator.clone();
        let runs = self.runs.clone();
        let last_reports = self.last_reports.clone();
        let kb_id = kb.id.clone();
        tokio::spawn(async move {
            let result = orchestrator.run(&kb_id, &options, cancel, progress).await;
            match &result {
                Ok(report) => {
                    last_reports.insert(kb_id.clone(), report.clone());
                }
                Err(e) => tracing::warn!(kb = %kb_id, error = %e, "training run failed"),
            }
            runs.remove_if(&kb_id, |_, handle| handle.serial == serial);
            tx.send_replace(Some(result));
        });
        Ok(Some(rx))
    }

    /// Run training and wait for it to finish. If a run is already active,
    /// waits for that one instead.
    pub async fn train(
        &self,
        kb_id: &str,
        options: TrainingOptions,
        progress: Arc<dyn TrainingProgressReporter>,
    ) -> Result<TrainingReport> {
        let kb = self.knowledge_base(kb_id).await?;
        let outcome = match self.spawn_run(&kb, options, progress)? {
            Some(receiver) => await_run(receiver).await?,
            None => self.wait_for_training(&kb.id).await?,
        };
        outcome.ok_or_else(|| EngineError::storage("training run vanished"))
    }

    /// Like [`train`](Self::train) without progress output.
    pub async fn train_quiet(&self, kb_id: &str, options: TrainingOptions) -> Result<TrainingReport> {
        self.train(kb_id, options, Arc::new(NoProgress)).await
    }

    /// Stop scheduling new work for an active run. Returns `false` when no
    /// run is active.
    pub fn cancel_training(&self, kb_id: &str) -> bool {
        match self.runs.get(kb_id) {
            Some(handle) => {
                tracing::info!(kb = %kb_id, "cancelling training run");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the active run, or return the last finished one.
    pub async fn wait_for_training(&self, kb_id: &str) -> Result<Option<TrainingReport>> {
        let receiver = self.runs.get(kb_id).map(|h| h.done.clone());
        match receiver {
            Some(receiver) => await_run(receiver).await,
            None => Ok(self.last_reports.get(kb_id).map(|r| r.clone())),
        }
    }

    pub fn is_training(&self, kb_id: &str) -> bool {
        self.runs.contains_key(kb_id)
    }

    /// Per-document progress and aggregate state of a knowledge base.
    pub async fn training_status(&self, kb_id: &str) -> Result<TrainingStatus> {
        let kb = self.knowledge_base(kb_id).await?;
        let counts: HashMap<String, usize> =
            self.metadata.count_chunks(&kb.id).await?.into_iter().collect();
        let documents = self
            .metadata
            .list_documents(&kb.id)
            .await?
            .into_iter()
            .map(|doc| DocumentProgress {
                chunk_count: counts.get(&doc.id).copied().unwrap_or(0),
                document_id: doc.id,
                name: doc.name,
                source_type: doc.source_type,
                status: doc.status,
                failure_reason: doc.failure_reason,
                updated_at: doc.updated_at,
            })
            .collect();
        Ok(TrainingStatus::from_documents(
            &kb.id,
            self.is_training(&kb.id),
            documents,
            self.last_reports.get(&kb.id).map(|r| r.clone()),
        ))
    }

    // ============ Query ============

    /// Ranked results with citations.
    ///
    /// A failing query cache is bypassed; retrieval and rerank failures are
    /// returned to the caller.
    pub async fn query(&self, kb_id: &str, query: &str, options: &QueryOptions) -> Result<QueryResponse> {
        let kb = self.knowledge_base(kb_id).await?;
        let params = options.resolve(&kb.retrieval);
        params.validate()?;
        if query.trim().is_empty() {
            return Err(EngineError::invalid("query must not be empty"));
        }
        if params.mode != SearchMode::Keyword {
            self.orchestrator.check_compatible(&kb)?;
        }
        let reranker = reranker_for(params.rerank, self.pair_scorer.clone())?;

        let cache_key = self.cache_key(&kb.id, query, &params).await;
        if let (Some(cache), Some(key)) = (&self.query_cache, &cache_key) {
            match cache.get(key).await {
                Ok(Some(results)) => {
                    tracing::debug!(kb = %kb.id, "query served from cache");
                    return Ok(QueryResponse {
                        kb_id: kb.id,
                        query: query.to_string(),
                        mode: params.mode,
                        results,
                        cached: true,
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "query cache read failed, computing directly"),
            }
        }

        let candidates = self
            .retriever
            .retrieve(&kb, query, &params, &self.vectorizer)
            .await?;
        let reranked = reranker.rerank(query, candidates).await?;
        let results = self.cite(reranked).await?;

        if let (Some(cache), Some(key)) = (&self.query_cache, &cache_key) {
            if let Err(e) = cache.put(key, &results, None).await {
                tracing::warn!(error = %e, "query cache write failed");
            }
        }

        Ok(QueryResponse {
            kb_id: kb.id,
            query: query.to_string(),
            mode: params.mode,
            results,
            cached: false,
        })
    }

    async fn cache_key(&self, kb_id: &str, query: &str, params: &RetrievalParams) -> Option<String> {
        let cache = self.query_cache.as_ref()?;
        match cache.key_for(kb_id, query, params).await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "query cache unavailable, computing directly");
                None
            }
        }
    }

    async fn cite(&self, candidates: Vec<Candidate>) -> Result<Vec<QueryHit>> {
        let mut names: HashMap<String, String> = HashMap::new();
        let mut hits = Vec::with_capacity(candidates.len());
        for (i, c) in candidates.into_iter().enumerate() {
            if !names.contains_key(&c.document_id) {
                let name = self
                    .metadata
                    .load_document(&c.document_id)
                    .await?
                    .map(|d| d.name)
                    .unwrap_or_default();
                names.insert(c.document_id.clone(), name);
            }
            let document_name = names.get(&c.document_id).cloned().unwrap_or_default();
            hits.push(QueryHit {
                rank: i + 1,
                score: c.score,
                semantic_score: c.semantic_score,
                keyword_score: c.keyword_score,
                citation: Citation {
                    document_id: c.document_id,
                    document_name,
                    chunk_id: c.chunk_id,
                    ordinal: c.ordinal,
                    section_title: c.section_title,
                    page_number: c.page_number,
                },
                text: c.text,
            });
        }
        Ok(hits)
    }

    async fn invalidate(&self, kb_id: &str) {
        if let Some(cache) = &self.query_cache {
            if let Err(e) = cache.invalidate_namespace(kb_id).await {
                tracing::warn!(kb = %kb_id, error = %e, "query cache invalidation failed");
            }
        }
    }
}

async fn await_run(mut receiver: watch::Receiver<RunResult>) -> Result<Option<TrainingReport>> {
    let result = receiver
        .wait_for(Option::is_some)
        .await
        .map_err(|_| EngineError::storage("training run aborted"))?
        .clone();
    match result {
        Some(r) => r.map(Some),
        None => Ok(None),
    }
}
