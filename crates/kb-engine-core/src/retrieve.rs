//! Semantic, keyword and hybrid retrieval.
//!
//! # Hybrid scoring
//!
//! 1. Fetch `candidate_k` hits from the vector store (scores already in `[0, 1]`).
//! 2. Fetch `candidate_k` hits from the keyword index and min-max normalize them.
//! 3. Merge by chunk id: `score = w × semantic + (1 − w) × keyword`, a
//!    channel that missed the chunk contributing `0`.
//! 4. Sort with [`rank_order`] and truncate to `top_k`.
//!
//! Each chunk appears at most once. Ties on score fall back to semantic
//! rank, then keyword rank, then chunk id.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::TextEmbedder;
use crate::error::{EngineError, Result};
use crate::models::{Candidate, KnowledgeBaseConfig, RetrievalParams, SearchMode};
use crate::store::{KeywordIndex, MetadataStore, ScoredChunk, VectorStore};

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(hits: &[ScoredChunk]) -> Vec<f64> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|h| h.score).fold(f64::NEG_INFINITY, f64::max);
    hits.iter()
        .map(|h| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.score - min) / (max - min)
            }
        })
        .collect()
}

/// Total order used for every result list: score descending, then semantic
/// rank, then keyword rank (present ranks before missing ones), then chunk id.
pub fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    fn rank_key(r: Option<usize>) -> usize {
        r.unwrap_or(usize::MAX)
    }
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| rank_key(a.semantic_rank).cmp(&rank_key(b.semantic_rank)))
        .then_with(|| rank_key(a.keyword_rank).cmp(&rank_key(b.keyword_rank)))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[derive(Default)]
struct Merged {
    document_id: String,
    semantic: Option<(f64, usize)>,
    keyword: Option<(f64, usize)>,
}

/// Runs retrieval against a vector store and a keyword index, hydrating
/// candidates from the metadata store.
#[derive(Clone)]
pub struct Retriever {
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<dyn KeywordIndex>,
    metadata: Arc<dyn MetadataStore>,
}

impl Retriever {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<dyn KeywordIndex>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            vectors,
            keywords,
            metadata,
        }
    }

    /// Ranked candidates for `query`, at most `params.top_k` of them.
    ///
    /// A knowledge base with nothing indexed yields an empty list.
    pub async fn retrieve(
        &self,
        kb: &KnowledgeBaseConfig,
        query: &str,
        params: &RetrievalParams,
        embedder: &dyn TextEmbedder,
    ) -> Result<Vec<Candidate>> {
        params.validate()?;
        if query.trim().is_empty() {
            return Err(EngineError::invalid("query must not be empty"));
        }
        let top_k = params.top_k as usize;
        let candidate_k = params.candidate_k.max(top_k);

        let semantic_hits = if params.mode != SearchMode::Keyword {
            self.semantic(kb, query, candidate_k, params, embedder)
                .await?
        } else {
            Vec::new()
        };
        let keyword_hits = if params.mode != SearchMode::Semantic {
            self.keywords
                .search(&kb.id, query, candidate_k, &params.filter)
                .await?
        } else {
            Vec::new()
        };

        if semantic_hits.is_empty() && keyword_hits.is_empty() {
            return Ok(Vec::new());
        }

        let weight = match params.mode {
            SearchMode::Semantic => 1.0,
            SearchMode::Keyword => 0.0,
            SearchMode::Hybrid => params.hybrid_weight,
        };

        let mut merged: HashMap<String, Merged> = HashMap::new();
        for (rank, hit) in semantic_hits.iter().enumerate() {
            let m = merged.entry(hit.chunk_id.clone()).or_default();
            m.document_id = hit.document_id.clone();
            if m.semantic.is_none() {
                m.semantic = Some((hit.score, rank + 1));
            }
        }
        let keyword_norm = normalize_scores(&keyword_hits);
        for (rank, (hit, norm)) in keyword_hits.iter().zip(keyword_norm).enumerate() {
            let m = merged.entry(hit.chunk_id.clone()).or_default();
            m.document_id = hit.document_id.clone();
            if m.keyword.is_none() {
                m.keyword = Some((norm, rank + 1));
            }
        }

        let ids: Vec<String> = merged.keys().cloned().collect();
        let chunks: HashMap<String, _> = self
            .metadata
            .load_chunks_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut candidates: Vec<Candidate> = merged
            .into_iter()
            .filter_map(|(chunk_id, m)| {
                let Some(chunk) = chunks.get(&chunk_id) else {
                    tracing::debug!(chunk_id, "search hit without chunk metadata, skipping");
                    return None;
                };
                let s = m.semantic.map(|(score, _)| score);
                let k = m.keyword.map(|(score, _)| score);
                let combined = weight * s.unwrap_or(0.0) + (1.0 - weight) * k.unwrap_or(0.0);
                Some(Candidate {
                    chunk_id,
                    document_id: m.document_id,
                    ordinal: chunk.ordinal,
                    text: chunk.text.clone(),
                    section_title: chunk.section_title.clone(),
                    page_number: chunk.page_number,
                    retrieval_score: combined,
                    score: combined,
                    semantic_score: s,
                    keyword_score: k,
                    semantic_rank: m.semantic.map(|(_, r)| r),
                    keyword_rank: m.keyword.map(|(_, r)| r),
                })
            })
            .collect();

        candidates.sort_by(rank_order);
        candidates.truncate(top_k);
        Ok(candidates)
    }

    async fn semantic(
        &self,
        kb: &KnowledgeBaseConfig,
        query: &str,
        k: usize,
        params: &RetrievalParams,
        embedder: &dyn TextEmbedder,
    ) -> Result<Vec<ScoredChunk>> {
        // nothing has been vectorized yet
        let Some(dims) = kb.embedding_dims else {
            return Ok(Vec::new());
        };
        let vectors = embedder.embed_texts(&[query.to_string()]).await?;
        let query_vec = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderFatal("empty embedding response".into()))?;
        if query_vec.len() != dims {
            return Err(EngineError::DimensionMismatch {
                expected: dims,
                actual: query_vec.len(),
            });
        }
        self.vectors
            .search(&kb.id, &query_vec, k, &params.filter)
            .await
    }
}
