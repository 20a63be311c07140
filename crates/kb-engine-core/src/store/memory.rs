//! In-memory store implementations for tests and embedded use.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Vector search is brute-force
//! over the knowledge base's vectors; keyword search is BM25 over an
//! inverted index maintained on every write.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, euclidean_distance};
use crate::error::{poisoned, EngineError, Result};
use crate::models::{now_ts, Chunk, Document, DocumentStatus, KnowledgeBaseConfig, SearchFilter};
use crate::text::tokenize;

use super::{
    DistanceMetric, KeywordIndex, MetadataStore, ScoredChunk, VectorMetadata, VectorStore,
};

fn rank_hits(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}

// ============ Vectors ============

struct StoredVector {
    vector: Vec<f32>,
    metadata: VectorMetadata,
}

/// Embedded vector backend holding everything in process memory.
pub struct MemoryVectorStore {
    metric: DistanceMetric,
    kbs: RwLock<HashMap<String, HashMap<String, StoredVector>>>,
}

impl MemoryVectorStore {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            kbs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of vectors stored for a knowledge base.
    pub fn len(&self, kb_id: &str) -> Result<usize> {
        let kbs = self.kbs.read().map_err(poisoned)?;
        Ok(kbs.get(kb_id).map(|m| m.len()).unwrap_or(0))
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new(DistanceMetric::Cosine)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn upsert(
        &self,
        kb_id: &str,
        chunk_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        kbs.entry(kb_id.to_string()).or_default().insert(
            chunk_id.to_string(),
            StoredVector {
                vector: vector.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &str,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let kbs = self.kbs.read().map_err(poisoned)?;
        let Some(vectors) = kbs.get(kb_id) else {
            return Ok(Vec::new());
        };

        let mut hits = Vec::with_capacity(vectors.len());
        for (chunk_id, stored) in vectors {
            if !filter.allows(&stored.metadata.document_id) {
                continue;
            }
            if stored.vector.len() != query.len() {
                return Err(EngineError::DimensionMismatch {
                    expected: stored.vector.len(),
                    actual: query.len(),
                });
            }
            let raw = match self.metric {
                DistanceMetric::Cosine => cosine_similarity(query, &stored.vector),
                DistanceMetric::Euclidean => euclidean_distance(query, &stored.vector),
            };
            hits.push(ScoredChunk {
                chunk_id: chunk_id.clone(),
                document_id: stored.metadata.document_id.clone(),
                score: self.metric.normalize(f64::from(raw)),
            });
        }
        Ok(rank_hits(hits, k))
    }

    async fn delete(&self, kb_id: &str, chunk_id: &str) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        if let Some(vectors) = kbs.get_mut(kb_id) {
            vectors.remove(chunk_id);
        }
        Ok(())
    }

    async fn delete_document(&self, kb_id: &str, document_id: &str) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        if let Some(vectors) = kbs.get_mut(kb_id) {
            vectors.retain(|_, v| v.metadata.document_id != document_id);
        }
        Ok(())
    }

    async fn delete_all(&self, kb_id: &str) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        kbs.remove(kb_id);
        Ok(())
    }
}

// ============ Keywords (BM25) ============

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct IndexedChunk {
    document_id: String,
    term_freqs: HashMap<String, usize>,
    len: usize,
}

#[derive(Default)]
struct KbIndex {
    chunks: HashMap<String, IndexedChunk>,
    doc_freq: HashMap<String, usize>,
    total_len: usize,
}

impl KbIndex {
    fn insert(&mut self, chunk: &Chunk) {
        self.remove(&chunk.id);
        let terms = tokenize(&chunk.text);
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for t in &terms {
            *term_freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for t in term_freqs.keys() {
            *self.doc_freq.entry(t.clone()).or_insert(0) += 1;
        }
        self.total_len += terms.len();
        self.chunks.insert(
            chunk.id.clone(),
            IndexedChunk {
                document_id: chunk.document_id.clone(),
                term_freqs,
                len: terms.len(),
            },
        );
    }

    fn remove(&mut self, chunk_id: &str) {
        if let Some(old) = self.chunks.remove(chunk_id) {
            self.total_len -= old.len;
            for t in old.term_freqs.keys() {
                if let Some(df) = self.doc_freq.get_mut(t) {
                    *df -= 1;
                    if *df == 0 {
                        self.doc_freq.remove(t);
                    }
                }
            }
        }
    }
}

/// BM25 keyword index kept in memory.
#[derive(Default)]
pub struct MemoryKeywordIndex {
    kbs: RwLock<HashMap<String, KbIndex>>,
}

impl MemoryKeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeywordIndex for MemoryKeywordIndex {
    async fn index_chunks(&self, kb_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        let index = kbs.entry(kb_id.to_string()).or_default();
        for c in chunks {
            index.insert(c);
        }
        Ok(())
    }

    async fn remove_document(&self, kb_id: &str, document_id: &str) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        if let Some(index) = kbs.get_mut(kb_id) {
            let ids: Vec<String> = index
                .chunks
                .iter()
                .filter(|(_, c)| c.document_id == document_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                index.remove(&id);
            }
        }
        Ok(())
    }

    async fn clear(&self, kb_id: &str) -> Result<()> {
        let mut kbs = self.kbs.write().map_err(poisoned)?;
        kbs.remove(kb_id);
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &str,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let kbs = self.kbs.read().map_err(poisoned)?;
        let Some(index) = kbs.get(kb_id) else {
            return Ok(Vec::new());
        };
        if index.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let n = index.chunks.len() as f64;
        let avg_len = (index.total_len as f64 / n).max(1.0);

        let mut hits = Vec::new();
        for (chunk_id, chunk) in &index.chunks {
            if !filter.allows(&chunk.document_id) {
                continue;
            }
            let mut score = 0.0;
            for t in &terms {
                let Some(&tf) = chunk.term_freqs.get(t) else {
                    continue;
                };
                let df = index.doc_freq.get(t).copied().unwrap_or(0) as f64;
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                let tf = tf as f64;
                let norm = 1.0 - BM25_B + BM25_B * chunk.len as f64 / avg_len;
                score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
            }
            if score > 0.0 {
                hits.push(ScoredChunk {
                    chunk_id: chunk_id.clone(),
                    document_id: chunk.document_id.clone(),
                    score,
                });
            }
        }
        Ok(rank_hits(hits, k))
    }
}

// ============ Metadata ============

#[derive(Default)]
struct MetadataState {
    kbs: HashMap<String, KnowledgeBaseConfig>,
    docs: HashMap<String, Document>,
    doc_order: Vec<String>,
    raw: HashMap<String, Vec<u8>>,
    extracted: HashMap<String, String>,
    chunks: HashMap<String, Vec<Chunk>>,
}

/// Metadata store held in memory.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: RwLock<MetadataState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracted text saved for a document, if any.
    pub fn extracted_text(&self, doc_id: &str) -> Result<Option<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.extracted.get(doc_id).cloned())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn save_knowledge_base(&self, config: &KnowledgeBaseConfig) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.kbs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn load_knowledge_base_config(&self, kb_id: &str) -> Result<Option<KnowledgeBaseConfig>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.kbs.get(kb_id).cloned())
    }

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseConfig>> {
        let state = self.state.read().map_err(poisoned)?;
        let mut kbs: Vec<KnowledgeBaseConfig> = state.kbs.values().cloned().collect();
        kbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(kbs)
    }

    async fn claim_embedding_dims(&self, kb_id: &str, dims: usize) -> Result<usize> {
        let mut state = self.state.write().map_err(poisoned)?;
        let kb = state
            .kbs
            .get_mut(kb_id)
            .ok_or_else(|| EngineError::not_found(format!("knowledge base {}", kb_id)))?;
        Ok(*kb.embedding_dims.get_or_insert(dims))
    }

    async fn add_document(&self, doc: &Document, raw: &[u8]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        if !state.docs.contains_key(&doc.id) {
            state.doc_order.push(doc.id.clone());
        }
        state.docs.insert(doc.id.clone(), doc.clone());
        state.raw.insert(doc.id.clone(), raw.to_vec());
        Ok(())
    }

    async fn load_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.docs.get(doc_id).cloned())
    }

    async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .doc_order
            .iter()
            .filter_map(|id| state.docs.get(id))
            .filter(|d| d.kb_id == kb_id && !d.deleted)
            .cloned()
            .collect())
    }

    async fn load_raw_content(&self, doc_id: &str) -> Result<Vec<u8>> {
        let state = self.state.read().map_err(poisoned)?;
        state
            .raw
            .get(doc_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("content of document {}", doc_id)))
    }

    async fn save_document_state(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let doc = state
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        doc.status = status;
        doc.failure_reason = reason.map(str::to_string);
        doc.updated_at = now_ts();
        Ok(())
    }

    async fn save_extracted_text(&self, doc_id: &str, text: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.extracted.insert(doc_id.to_string(), text.to_string());
        Ok(())
    }

    async fn soft_delete_document(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let doc = state
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        doc.deleted = true;
        doc.updated_at = now_ts();
        Ok(())
    }

    async fn save_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.chunks.insert(doc_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn delete_chunks(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.chunks.remove(doc_id);
        Ok(())
    }

    async fn load_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.chunks.get(doc_id).cloned().unwrap_or_default())
    }

    async fn load_chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .chunks
            .values()
            .flatten()
            .filter(|c| chunk_ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn count_chunks(&self, kb_id: &str) -> Result<Vec<(String, usize)>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .chunks
            .iter()
            .filter(|(doc_id, _)| {
                state
                    .docs
                    .get(doc_id.as_str())
                    .map(|d| d.kb_id == kb_id)
                    .unwrap_or(false)
            })
            .map(|(doc_id, chunks)| (doc_id.clone(), chunks.len()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkingPolicy, RetrievalDefaults, SourceType};
    use crate::text::content_hash;

    fn chunk(id: &str, doc: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            kb_id: "kb".to_string(),
            document_id: doc.to_string(),
            ordinal: 0,
            text: text.to_string(),
            content_hash: content_hash(text),
            section_title: None,
            page_number: None,
        }
    }

    fn meta(doc: &str) -> VectorMetadata {
        VectorMetadata {
            document_id: doc.to_string(),
            ordinal: 0,
            content_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn vector_search_ranks_by_normalized_similarity() {
        let store = MemoryVectorStore::default();
        store.upsert("kb", "a", &[1.0, 0.0], &meta("d1")).await.unwrap();
        store.upsert("kb", "b", &[0.0, 1.0], &meta("d1")).await.unwrap();
        store.upsert("kb", "c", &[-1.0, 0.0], &meta("d2")).await.unwrap();

        let hits = store
            .search("kb", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.5).abs() < 1e-9);
        assert!(hits[2].score.abs() < 1e-9);
    }

    #[tokio::test]
    async fn euclidean_store_scores_closer_vectors_higher() {
        let store = MemoryVectorStore::new(DistanceMetric::Euclidean);
        store.upsert("kb", "near", &[1.0, 1.0], &meta("d")).await.unwrap();
        store.upsert("kb", "far", &[5.0, 5.0], &meta("d")).await.unwrap();
        let hits = store
            .search("kb", &[1.0, 1.0], 2, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "near");
        assert_eq!(hits[0].score, 1.0);
        assert!(hits[1].score > 0.0 && hits[1].score < 1.0);
    }

    #[tokio::test]
    async fn vector_search_rejects_wrong_dimensions() {
        let store = MemoryVectorStore::default();
        store.upsert("kb", "a", &[1.0, 0.0], &meta("d")).await.unwrap();
        let err = store
            .search("kb", &[1.0, 0.0, 0.0], 1, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_operations_scope_correctly() {
        let store = MemoryVectorStore::default();
        store.upsert("kb", "a", &[1.0], &meta("d1")).await.unwrap();
        store.upsert("kb", "b", &[1.0], &meta("d2")).await.unwrap();
        store.upsert("other", "c", &[1.0], &meta("d3")).await.unwrap();

        store.delete_document("kb", "d1").await.unwrap();
        assert_eq!(store.len("kb").unwrap(), 1);
        store.delete("kb", "b").await.unwrap();
        assert_eq!(store.len("kb").unwrap(), 0);
        store.delete_all("other").await.unwrap();
        assert_eq!(store.len("other").unwrap(), 0);
    }

    #[tokio::test]
    async fn vector_search_applies_document_filter() {
        let store = MemoryVectorStore::default();
        store.upsert("kb", "a", &[1.0], &meta("d1")).await.unwrap();
        store.upsert("kb", "b", &[1.0], &meta("d2")).await.unwrap();
        let filter = SearchFilter {
            document_ids: Some(vec!["d2".to_string()]),
        };
        let hits = store.search("kb", &[1.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");
    }

    #[tokio::test]
    async fn bm25_prefers_rarer_and_denser_matches() {
        let index = MemoryKeywordIndex::new();
        index
            .index_chunks(
                "kb",
                &[
                    chunk("c1", "d1", "the tokio runtime schedules tasks"),
                    chunk("c2", "d1", "the garden needs water"),
                    chunk("c3", "d2", "tokio tokio tokio"),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .search("kb", "tokio", 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c1"]);

        let none = index
            .search("kb", "nonexistent", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn keyword_remove_document_drops_its_chunks() {
        let index = MemoryKeywordIndex::new();
        index
            .index_chunks("kb", &[chunk("c1", "d1", "alpha"), chunk("c2", "d2", "alpha")])
            .await
            .unwrap();
        index.remove_document("kb", "d1").await.unwrap();
        let hits = index
            .search("kb", "alpha", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn metadata_tracks_state_and_dims() {
        let store = MemoryMetadataStore::new();
        let kb = KnowledgeBaseConfig::new(
            "docs",
            ChunkingPolicy::default(),
            "hashing:bow-256",
            "memory",
            RetrievalDefaults::default(),
        );
        store.save_knowledge_base(&kb).await.unwrap();
        assert_eq!(store.claim_embedding_dims(&kb.id, 256).await.unwrap(), 256);
        assert_eq!(store.claim_embedding_dims(&kb.id, 384).await.unwrap(), 256);

        let doc = Document::new(&kb.id, "a.txt", SourceType::PlainText, None, b"hello");
        store.add_document(&doc, b"hello").await.unwrap();
        store
            .save_document_state(&doc.id, DocumentStatus::Failed, Some("empty content"))
            .await
            .unwrap();
        let loaded = store.load_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("empty content"));
        assert_eq!(store.load_raw_content(&doc.id).await.unwrap(), b"hello");

        store.soft_delete_document(&doc.id).await.unwrap();
        assert!(store.list_documents(&kb.id).await.unwrap().is_empty());
        assert!(store.load_document(&doc.id).await.unwrap().is_some());
    }
}
