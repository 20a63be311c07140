//! Storage abstractions.
//!
//! Three traits split storage by concern so backends can be mixed:
//!
//! | Trait | Role | Implementations |
//! |-------|------|-----------------|
//! | [`VectorStore`] | Vector upsert, similarity search, delete | memory, SQLite, Qdrant |
//! | [`KeywordIndex`] | Lexical index over chunk text | memory (BM25), SQLite FTS5 |
//! | [`MetadataStore`] | Knowledge bases, documents, chunks, state | memory, SQLite |
//!
//! The metadata store is the single source of truth for document state.
//! Vector search scores are normalized to `[0, 1]`, higher is more similar,
//! whatever the backend's native metric.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Chunk, Document, DocumentStatus, KnowledgeBaseConfig, SearchFilter};

/// A hit from a vector or keyword search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    /// Normalized similarity for vector search; raw relevance (higher is
    /// better) for keyword search.
    pub score: f64,
}

/// Payload stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub document_id: String,
    pub ordinal: u32,
    pub content_hash: String,
}

/// A vector ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// Native distance metric of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// Map a native score onto `[0, 1]`, higher is more similar.
    ///
    /// Cosine similarity `c` becomes `(c + 1) / 2`; Euclidean distance `d`
    /// becomes `1 / (1 + d)`.
    pub fn normalize(&self, raw: f64) -> f64 {
        match self {
            DistanceMetric::Cosine => ((raw + 1.0) / 2.0).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => {
                if raw.is_finite() {
                    1.0 / (1.0 + raw.max(0.0))
                } else {
                    0.0
                }
            }
        }
    }
}

/// Pluggable vector database backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name as used in configuration (`memory`, `sqlite`, `qdrant`).
    fn backend_name(&self) -> &str;

    async fn upsert(
        &self,
        kb_id: &str,
        chunk_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<()>;

    /// Write many vectors. Backends with a bulk API override this.
    async fn upsert_batch(&self, kb_id: &str, records: &[VectorRecord]) -> Result<()> {
        for r in records {
            self.upsert(kb_id, &r.chunk_id, &r.vector, &r.metadata)
                .await?;
        }
        Ok(())
    }

    /// Top `k` chunks by normalized similarity, best first.
    async fn search(
        &self,
        kb_id: &str,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>>;

    async fn delete(&self, kb_id: &str, chunk_id: &str) -> Result<()>;

    /// Remove every vector belonging to one document.
    async fn delete_document(&self, kb_id: &str, document_id: &str) -> Result<()>;

    /// Remove every vector of a knowledge base.
    async fn delete_all(&self, kb_id: &str) -> Result<()>;
}

/// Lexical index over chunk text.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn index_chunks(&self, kb_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn remove_document(&self, kb_id: &str, document_id: &str) -> Result<()>;

    async fn clear(&self, kb_id: &str) -> Result<()>;

    /// Top `k` chunks by lexical relevance (higher is better), best first.
    async fn search(
        &self,
        kb_id: &str,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>>;
}

/// Relational metadata: knowledge bases, documents and chunks.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn save_knowledge_base(&self, config: &KnowledgeBaseConfig) -> Result<()>;

    async fn load_knowledge_base_config(&self, kb_id: &str) -> Result<Option<KnowledgeBaseConfig>>;

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseConfig>>;

    /// Record the knowledge base's embedding dimensionality on first use and
    /// return the stored value. Later calls never change it.
    async fn claim_embedding_dims(&self, kb_id: &str, dims: usize) -> Result<usize>;

    async fn add_document(&self, doc: &Document, raw: &[u8]) -> Result<()>;

    async fn load_document(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Non-deleted documents of a knowledge base, oldest first.
    async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>>;

    async fn load_raw_content(&self, doc_id: &str) -> Result<Vec<u8>>;

    async fn save_document_state(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()>;

    async fn save_extracted_text(&self, doc_id: &str, text: &str) -> Result<()>;

    async fn soft_delete_document(&self, doc_id: &str) -> Result<()>;

    /// Replace all chunks of a document in one step.
    async fn save_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn delete_chunks(&self, doc_id: &str) -> Result<()>;

    async fn load_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    /// Chunks by id, in no particular order. Unknown ids are skipped.
    async fn load_chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>>;

    /// Chunk counts per document of a knowledge base.
    async fn count_chunks(&self, kb_id: &str) -> Result<Vec<(String, usize)>>;
}
