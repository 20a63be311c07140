//! Second-stage reordering of retrieval candidates.
//!
//! A [`Reranker`] receives the retriever's candidates and returns the same
//! set in a new order with rewritten `score`s. Candidates are never added or
//! dropped. Every strategy derives its score from fields it does not write
//! (`retrieval_score`, channel ranks, text), so applying a reranker to its
//! own output is a no-op.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::models::{Candidate, RerankStrategy};
use crate::retrieve::rank_order;
use crate::text::tokenize;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    async fn rerank(&self, query: &str, candidates: Vec<Candidate>) -> Result<Vec<Candidate>>;
}

/// Keeps retrieval order and scores.
pub struct PassThrough;

#[async_trait]
impl Reranker for PassThrough {
    fn name(&self) -> &str {
        "none"
    }

    async fn rerank(&self, _query: &str, mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        for c in &mut candidates {
            c.score = c.retrieval_score;
        }
        candidates.sort_by(rank_order);
        Ok(candidates)
    }
}

/// Reciprocal rank fusion over the semantic and keyword channel ranks:
/// `score = Σ 1 / (k + rank)`.
pub struct ReciprocalRankFusion {
    pub k: f64,
}

impl Default for ReciprocalRankFusion {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

#[async_trait]
impl Reranker for ReciprocalRankFusion {
    fn name(&self) -> &str {
        "rrf"
    }

    async fn rerank(&self, _query: &str, mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        for c in &mut candidates {
            let fuse = |rank: Option<usize>| rank.map(|r| 1.0 / (self.k + r as f64)).unwrap_or(0.0);
            c.score = fuse(c.semantic_rank) + fuse(c.keyword_rank);
        }
        candidates.sort_by(rank_order);
        Ok(candidates)
    }
}

/// Blends the retrieval score with the fraction of query terms present in
/// the candidate text.
pub struct LexicalOverlap {
    /// Share of the retrieval score in the blend.
    pub retrieval_weight: f64,
}

impl Default for LexicalOverlap {
    fn default() -> Self {
        Self {
            retrieval_weight: 0.5,
        }
    }
}

fn term_overlap(query_terms: &[String], text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms: std::collections::HashSet<String> = tokenize(text).into_iter().collect();
    let hits = query_terms
        .iter()
        .filter(|t| text_terms.contains(*t))
        .count();
    hits as f64 / query_terms.len() as f64
}

#[async_trait]
impl Reranker for LexicalOverlap {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn rerank(&self, query: &str, mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();
        let w = self.retrieval_weight;
        for c in &mut candidates {
            c.score = w * c.retrieval_score + (1.0 - w) * term_overlap(&terms, &c.text);
        }
        candidates.sort_by(rank_order);
        Ok(candidates)
    }
}

/// Scores a `(query, passage)` pair; larger means more relevant.
#[async_trait]
pub trait PairScorer: Send + Sync {
    async fn score_pairs(&self, query: &str, passages: &[String]) -> Result<Vec<f64>>;
}

/// Reranks with a cross-encoder style pair scorer. Raw logits are squashed
/// through a sigmoid so scores stay in `(0, 1)`.
pub struct CrossEncoderReranker {
    scorer: Arc<dyn PairScorer>,
}

impl CrossEncoderReranker {
    pub fn new(scorer: Arc<dyn PairScorer>) -> Self {
        Self { scorer }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "cross-encoder"
    }

    async fn rerank(&self, query: &str, mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let logits = self.scorer.score_pairs(query, &passages).await?;
        if logits.len() != candidates.len() {
            return Err(EngineError::ProviderFatal(format!(
                "pair scorer returned {} scores for {} passages",
                logits.len(),
                candidates.len()
            )));
        }
        for (c, logit) in candidates.iter_mut().zip(logits) {
            c.score = sigmoid(logit);
        }
        candidates.sort_by(rank_order);
        Ok(candidates)
    }
}

/// Reranker for a configured strategy. `cross-encoder` needs a pair scorer.
pub fn reranker_for(
    strategy: RerankStrategy,
    scorer: Option<Arc<dyn PairScorer>>,
) -> Result<Arc<dyn Reranker>> {
    match strategy {
        RerankStrategy::PassThrough => Ok(Arc::new(PassThrough)),
        RerankStrategy::ReciprocalRankFusion => Ok(Arc::new(ReciprocalRankFusion::default())),
        RerankStrategy::LexicalOverlap => Ok(Arc::new(LexicalOverlap::default())),
        RerankStrategy::CrossEncoder => match scorer {
            Some(scorer) => Ok(Arc::new(CrossEncoderReranker::new(scorer))),
            None => Err(EngineError::invalid(
                "cross-encoder reranking requires a configured pair scorer",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, text: &str, score: f64, s: Option<usize>, k: Option<usize>) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            document_id: "d".to_string(),
            ordinal: 0,
            text: text.to_string(),
            section_title: None,
            page_number: None,
            retrieval_score: score,
            score,
            semantic_score: None,
            keyword_score: None,
            semantic_rank: s,
            keyword_rank: k,
        }
    }

    fn sample() -> Vec<Candidate> {
        vec![
            candidate("a", "alpha beta", 0.9, Some(1), Some(3)),
            candidate("b", "gamma delta tokio", 0.8, Some(2), Some(1)),
            candidate("c", "tokio runtime gamma", 0.7, None, Some(2)),
            candidate("d", "unrelated", 0.6, Some(3), None),
        ]
    }

    fn ids(list: &[Candidate]) -> Vec<&str> {
        list.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    struct LengthScorer;

    #[async_trait]
    impl PairScorer for LengthScorer {
        async fn score_pairs(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>> {
            Ok(passages.iter().map(|p| p.len() as f64 / 10.0).collect())
        }
    }

    fn all_rerankers() -> Vec<Arc<dyn Reranker>> {
        vec![
            Arc::new(PassThrough),
            Arc::new(ReciprocalRankFusion::default()),
            Arc::new(LexicalOverlap::default()),
            Arc::new(CrossEncoderReranker::new(Arc::new(LengthScorer))),
        ]
    }

    #[tokio::test]
    async fn rerankers_preserve_the_candidate_set() {
        for r in all_rerankers() {
            let out = r.rerank("tokio gamma", sample()).await.unwrap();
            let mut got = ids(&out);
            got.sort();
            assert_eq!(got, vec!["a", "b", "c", "d"], "{}", r.name());
        }
    }

    #[tokio::test]
    async fn rerankers_are_idempotent() {
        for r in all_rerankers() {
            let once = r.rerank("tokio gamma", sample()).await.unwrap();
            let twice = r.rerank("tokio gamma", once.clone()).await.unwrap();
            assert_eq!(once, twice, "{}", r.name());
        }
    }

    #[tokio::test]
    async fn rrf_rewards_agreement_between_channels() {
        let out = ReciprocalRankFusion::default()
            .rerank("q", sample())
            .await
            .unwrap();
        // b: 1/62 + 1/61 beats a: 1/61 + 1/63
        assert_eq!(ids(&out)[..2], ["b", "a"]);
        assert_eq!(out.last().unwrap().chunk_id, "d");
    }

    #[tokio::test]
    async fn lexical_overlap_promotes_term_matches() {
        let out = LexicalOverlap::default()
            .rerank("tokio gamma", sample())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["b", "c", "a", "d"]);
        assert_eq!(out[0].retrieval_score, 0.8);
    }

    #[tokio::test]
    async fn cross_encoder_orders_by_squashed_scores() {
        let out = CrossEncoderReranker::new(Arc::new(LengthScorer))
            .rerank("q", sample())
            .await
            .unwrap();
        assert_eq!(ids(&out)[0], "c");
        assert!(out.iter().all(|c| c.score > 0.0 && c.score < 1.0));
    }

    #[test]
    fn cross_encoder_requires_scorer() {
        assert!(reranker_for(RerankStrategy::CrossEncoder, None).is_err());
        let r = reranker_for(RerankStrategy::ReciprocalRankFusion, None).unwrap();
        assert_eq!(r.name(), "rrf");
    }
}
