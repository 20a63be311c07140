//! Training runs.
//!
//! A run walks the documents of one knowledge base through
//!
//! ```text
//! pending → extracting → chunked → vectorizing → ready | failed
//! ```
//!
//! on a bounded worker pool (`training.workers` permits). Every state write
//! goes through the metadata store while the worker holds that document's
//! lock, so two workers never transition the same document.
//!
//! A document's vectors and lexical entries are committed only after all of
//! its chunks are vectorized. If the commit fails, whatever reached the
//! vector store is rolled back, so a document is searchable completely or
//! not at all.
//!
//! Cancellation stops scheduling: documents not yet picked up stay
//! `pending`, and a document between vectorization batches stays in its
//! transitional state. Running the same request again resumes; `ready`
//! documents are skipped unless forced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kb_engine_core::cache::QueryCache;
use kb_engine_core::chunk::{chunk_text, make_chunks};
use kb_engine_core::models::{
    now_ts, Chunk, Document, DocumentStatus, KnowledgeBaseConfig, TrainingOptions, TrainingReport,
};
use kb_engine_core::store::{KeywordIndex, MetadataStore, VectorMetadata, VectorRecord, VectorStore};
use kb_engine_core::{EngineError, Result};

use crate::extract::extract;
use crate::progress::{TrainingEvent, TrainingProgressReporter};
use crate::vectorizer::Vectorizer;

/// How one document's attempt ended.
#[derive(Debug)]
enum Outcome {
    Ready,
    Failed {
        reason: String,
        warning: Option<String>,
    },
    /// Locked by another worker or no longer eligible.
    Skipped,
    /// Stopped between batches by cancellation.
    Cancelled,
}

#[derive(Clone)]
pub struct Orchestrator {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<dyn KeywordIndex>,
    vectorizer: Vectorizer,
    query_cache: Option<QueryCache>,
    workers: usize,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<dyn KeywordIndex>,
        vectorizer: Vectorizer,
        query_cache: Option<QueryCache>,
        workers: usize,
    ) -> Self {
        Self {
            metadata,
            vectors,
            keywords,
            vectorizer,
            query_cache,
            workers: workers.max(1),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Lock guarding state transitions of one document.
    pub fn document_lock(&self, doc_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, doc_id: &str) {
        self.locks
            .remove_if(doc_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Check that the knowledge base can be served by this orchestrator's
    /// provider and vector backend.
    pub fn check_compatible(&self, kb: &KnowledgeBaseConfig) -> Result<()> {
        if kb.embedding_model != self.vectorizer.model_name() {
            return Err(EngineError::invalid(format!(
                "knowledge base '{}' is embedded with '{}' but the engine serves '{}'; \
                 update the knowledge base to re-embed it",
                kb.name,
                kb.embedding_model,
                self.vectorizer.model_name()
            )));
        }
        if kb.vector_backend != self.vectors.backend_name() {
            return Err(EngineError::invalid(format!(
                "knowledge base '{}' lives in vector backend '{}' but the engine uses '{}'",
                kb.name,
                kb.vector_backend,
                self.vectors.backend_name()
            )));
        }
        Ok(())
    }

    /// Run one training pass over a knowledge base.
    pub async fn run(
        &self,
        kb_id: &str,
        options: &TrainingOptions,
        cancel: CancellationToken,
        progress: Arc<dyn TrainingProgressReporter>,
    ) -> Result<TrainingReport> {
        let kb = self
            .metadata
            .load_knowledge_base_config(kb_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("knowledge base {}", kb_id)))?;
        self.check_compatible(&kb)?;
        kb.chunking.validate()?;

        let mut report = TrainingReport {
            kb_id: kb.id.clone(),
            started_at: now_ts(),
            ..Default::default()
        };

        let mut selected = Vec::new();
        for doc in self.metadata.list_documents(&kb.id).await? {
            if let Some(ids) = &options.document_ids {
                if !ids.contains(&doc.id) {
                    continue;
                }
            }
            if doc.status == DocumentStatus::Ready && !options.force {
                report.skipped += 1;
                continue;
            }
            selected.push(doc);
        }

        let total = selected.len() as u64;
        tracing::info!(kb = %kb.id, total, skipped = report.skipped, "training run started");
        progress.report(TrainingEvent::Started {
            kb_id: kb.id.clone(),
            total,
            skipped: report.skipped as u64,
        });

        let kb = Arc::new(kb);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let finished = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();

        for doc in selected {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| EngineError::storage(format!("worker pool closed: {}", e)))?,
            };
            if cancel.is_cancelled() {
                break;
            }
            let this = self.clone();
            let kb = kb.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let finished = finished.clone();
            let force = options.force;
            tasks.spawn(async move {
                let outcome = this.process_document(&kb, &doc, force, &cancel).await;
                let event = match &outcome {
                    Outcome::Ready => Some((DocumentStatus::Ready, None)),
                    Outcome::Failed { reason, .. } => {
                        Some((DocumentStatus::Failed, Some(reason.clone())))
                    }
                    Outcome::Cancelled => {
                        Some((DocumentStatus::Vectorizing, Some("cancelled".to_string())))
                    }
                    Outcome::Skipped => None,
                };
                if let Some((status, reason)) = event {
                    progress.report(TrainingEvent::Document {
                        kb_id: kb.id.clone(),
                        name: doc.name.clone(),
                        status,
                        reason,
                        n: finished.fetch_add(1, Ordering::SeqCst) + 1,
                        total,
                    });
                }
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Ready) => {
                    report.processed += 1;
                    report.ready += 1;
                }
                Ok(Outcome::Failed { warning, .. }) => {
                    report.processed += 1;
                    report.failed += 1;
                    report.warnings.extend(warning);
                }
                Ok(Outcome::Cancelled) => report.processed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => report.warnings.push(format!("training worker failed: {}", e)),
            }
        }

        report.cancelled = cancel.is_cancelled();
        report.finished_at = now_ts();
        tracing::info!(
            kb = %kb.id,
            ready = report.ready,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "training run finished"
        );
        progress.report(TrainingEvent::Finished {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn process_document(
        &self,
        kb: &KnowledgeBaseConfig,
        doc: &Document,
        force: bool,
        cancel: &CancellationToken,
    ) -> Outcome {
        let lock = self.document_lock(&doc.id);
        let outcome = match lock.clone().try_lock_owned() {
            Ok(_guard) => self.process_locked(kb, doc, force, cancel).await,
            Err(_) => {
                tracing::debug!(doc = %doc.id, "document locked by another worker, skipping");
                Outcome::Skipped
            }
        };
        drop(lock);
        self.release_lock(&doc.id);
        outcome
    }

    async fn process_locked(
        &self,
        kb: &KnowledgeBaseConfig,
        doc: &Document,
        force: bool,
        cancel: &CancellationToken,
    ) -> Outcome {
        // state may have moved on since the run listed it
        let current = match self.metadata.load_document(&doc.id).await {
            Ok(Some(d)) if !d.deleted => d,
            Ok(_) => return Outcome::Skipped,
            Err(e) => return self.fail(doc, e).await,
        };
        if current.status == DocumentStatus::Ready && !force {
            return Outcome::Skipped;
        }

        match self.train_document(kb, &current, cancel).await {
            Ok(true) => {
                self.invalidate_queries(&kb.id).await;
                Outcome::Ready
            }
            Ok(false) => {
                tracing::info!(doc = %doc.id, "training cancelled, document left resumable");
                Outcome::Cancelled
            }
            Err(e) => self.fail(&current, e).await,
        }
    }

    async fn invalidate_queries(&self, kb_id: &str) {
        if let Some(cache) = &self.query_cache {
            if let Err(e) = cache.invalidate_namespace(kb_id).await {
                tracing::warn!(kb = %kb_id, error = %e, "query cache invalidation failed");
            }
        }
    }

    async fn set_state(&self, doc_id: &str, status: DocumentStatus) -> Result<()> {
        tracing::debug!(doc = %doc_id, status = %status, "document transition");
        self.metadata.save_document_state(doc_id, status, None).await
    }

    /// Attempt one document. `Ok(false)` when cancelled between batches.
    async fn train_document(
        &self,
        kb: &KnowledgeBaseConfig,
        doc: &Document,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        // fresh attempt: nothing from a previous run may survive
        self.clear_document(&kb.id, &doc.id).await?;
        if doc.status != DocumentStatus::Pending {
            self.set_state(&doc.id, DocumentStatus::Pending).await?;
        }

        self.set_state(&doc.id, DocumentStatus::Extracting).await?;
        let raw = self.metadata.load_raw_content(&doc.id).await?;
        let source_type = doc.source_type;
        let extraction = tokio::task::spawn_blocking(move || extract(&raw, source_type))
            .await
            .map_err(|e| EngineError::CorruptSource(format!("extractor crashed: {}", e)))??;
        self.metadata
            .save_extracted_text(&doc.id, &extraction.text)
            .await?;

        let drafts = chunk_text(
            &extraction.text,
            &extraction.hints,
            &kb.chunking,
            &self.vectorizer,
        )
        .await?;
        if drafts.is_empty() {
            return Err(EngineError::EmptyContent);
        }
        let chunks = make_chunks(&kb.id, &doc.id, drafts);
        self.metadata.save_chunks(&doc.id, &chunks).await?;
        self.set_state(&doc.id, DocumentStatus::Chunked).await?;

        self.set_state(&doc.id, DocumentStatus::Vectorizing).await?;
        let Some(vectors) = self.vectorize_chunks(&chunks, cancel).await? else {
            return Ok(false);
        };

        let dims = vectors.first().map(Vec::len).unwrap_or_default();
        let stored = self.metadata.claim_embedding_dims(&kb.id, dims).await?;
        if stored != dims {
            return Err(EngineError::DimensionMismatch {
                expected: stored,
                actual: dims,
            });
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                chunk_id: chunk.id.clone(),
                vector,
                metadata: VectorMetadata {
                    document_id: doc.id.clone(),
                    ordinal: chunk.ordinal,
                    content_hash: chunk.content_hash.clone(),
                },
            })
            .collect();

        if let Err(e) = self.commit(&kb.id, &chunks, &records).await {
            self.rollback(&kb.id, &doc.id).await;
            return Err(e);
        }
        if let Err(e) = self.set_state(&doc.id, DocumentStatus::Ready).await {
            self.rollback(&kb.id, &doc.id).await;
            return Err(e);
        }
        tracing::debug!(doc = %doc.id, chunks = chunks.len(), "document ready");
        Ok(true)
    }

    /// Vectorize in sequential batches. `None` when cancelled.
    async fn vectorize_chunks(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Vec<f32>>>> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.vectorizer.effective_batch_size()) {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let results = self.vectorizer.vectorize(&texts).await;

            let mut first_error = None;
            let mut failed = 0usize;
            for result in results {
                match result {
                    Ok(v) => vectors.push(v),
                    Err(e) => {
                        failed += 1;
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                tracing::warn!(failed, total = chunks.len(), error = %e, "chunks failed to vectorize");
                return Err(e);
            }
        }
        Ok(Some(vectors))
    }

    async fn commit(&self, kb_id: &str, chunks: &[Chunk], records: &[VectorRecord]) -> Result<()> {
        self.vectors.upsert_batch(kb_id, records).await?;
        self.keywords.index_chunks(kb_id, chunks).await
    }

    async fn rollback(&self, kb_id: &str, doc_id: &str) {
        if let Err(e) = self.vectors.delete_document(kb_id, doc_id).await {
            tracing::warn!(doc = %doc_id, error = %e, "vector rollback failed");
        }
        if let Err(e) = self.keywords.remove_document(kb_id, doc_id).await {
            tracing::warn!(doc = %doc_id, error = %e, "keyword rollback failed");
        }
    }

    /// Drop vectors, lexical entries and chunks of a document.
    pub async fn clear_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        self.vectors.delete_document(kb_id, doc_id).await?;
        self.keywords.remove_document(kb_id, doc_id).await?;
        self.metadata.delete_chunks(doc_id).await
    }

    async fn fail(&self, doc: &Document, error: EngineError) -> Outcome {
        let reason = error.to_string();
        tracing::warn!(doc = %doc.id, name = %doc.name, code = error.code(), %reason, "document failed");

        let warning = match &error {
            EngineError::BackendUnavailable(_) => Some(format!(
                "{}: {}; retry the run once the backend is reachable",
                doc.name, reason
            )),
            _ => None,
        };

        if let Err(e) = self.metadata.delete_chunks(&doc.id).await {
            tracing::warn!(doc = %doc.id, error = %e, "could not clear chunks of failed document");
        }
        if let Err(e) = self
            .metadata
            .save_document_state(&doc.id, DocumentStatus::Failed, Some(&reason))
            .await
        {
            tracing::warn!(doc = %doc.id, error = %e, "could not record failure");
        }
        // answers cached while the document was ready no longer hold
        self.invalidate_queries(&doc.kb_id).await;
        Outcome::Failed { reason, warning }
    }
}
