//! Embedding provider trait and vector utilities.
//!
//! [`EmbeddingProvider`] is the contract every embedding backend implements.
//! [`TextEmbedder`] is the narrower view the chunker and retriever use; the
//! application's vectorizer implements it on top of a provider so those
//! calls share its cache, batching and retry path.
//!
//! [`HashingEmbedder`] is a deterministic, dependency-free provider based on
//! feature hashing of lowercased terms. It needs no network and no model,
//! which makes it the default for tests and offline installs.
//!
//! Concrete network providers (OpenAI, Ollama, fastembed) live in the
//! `kb-engine` app crate.

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::text::tokenize;

/// An embedding backend.
///
/// `embed` makes a single attempt and returns one result per input, in
/// input order. An item that failed does not take its neighbours down with
/// it; a request that failed as a whole reports its error on every item
/// (see [`per_item`]). Failures are classified as
/// [`ProviderTransient`](crate::EngineError::ProviderTransient) or
/// [`ProviderFatal`](crate::EngineError::ProviderFatal); retrying is the
/// caller's job.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"openai:text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Largest batch the backend accepts in one request.
    fn max_batch_size(&self) -> usize {
        64
    }
    async fn embed(&self, texts: &[String]) -> Vec<Result<Vec<f32>>>;
}

/// Spread the outcome of a whole-request call over its `expected` items.
/// A response with the wrong number of vectors fails every item.
pub fn per_item(outcome: Result<Vec<Vec<f32>>>, expected: usize) -> Vec<Result<Vec<f32>>> {
    match outcome {
        Ok(vectors) if vectors.len() == expected => vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => {
            let err = EngineError::ProviderFatal(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                expected
            ));
            vec![Err(err); expected]
        }
        Err(e) => vec![Err(e); expected],
    }
}

/// Turns texts into vectors, all or nothing.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Hashing embedder ============

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Feature-hashing bag-of-words embedder.
///
/// Each term is hashed into one of `dims` buckets with a hash-derived sign,
/// and the result is L2-normalized. Texts sharing vocabulary land close in
/// cosine space; identical texts always produce identical vectors.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    name: String,
    dims: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMS: usize = 256;

    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            name: format!("hashing:bow-{}", dims),
            dims,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for term in tokenize(text) {
            let h = fnv1a(term.as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        512
    }
    async fn embed(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        texts.iter().map(|t| Ok(self.embed_one(t))).collect()
    }
}

#[async_trait]
impl TextEmbedder for HashingEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed(texts).await.into_iter().collect()
    }
}

// ============ Vector helpers ============

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Euclidean (L2) distance; `f32::INFINITY` for mismatched vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_edge_cases() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn euclidean_distance_basics() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(euclidean_distance(&[1.0], &[1.0, 2.0]), f32::INFINITY);
    }

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_one("Rust ownership and borrowing");
        let b = e.embed_one("Rust ownership and borrowing");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedder_ranks_shared_vocabulary_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed_one("tokio runtime scheduler");
        let near = e.embed_one("the tokio runtime has a work stealing scheduler");
        let far = e.embed_one("bake the bread at two hundred degrees");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn hashing_embedder_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8);
        assert!(e.embed_one("").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn hashing_provider_preserves_order() {
        let e = HashingEmbedder::new(16);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = e.embed_texts(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], e.embed_one("alpha"));
        assert_eq!(out[1], e.embed_one("beta"));
    }

    #[test]
    fn whole_request_outcomes_spread_over_items() {
        let ok = per_item(Ok(vec![vec![1.0], vec![2.0]]), 2);
        assert_eq!(ok, vec![Ok(vec![1.0]), Ok(vec![2.0])]);

        let short = per_item(Ok(vec![vec![1.0]]), 2);
        assert_eq!(short.len(), 2);
        assert!(short
            .iter()
            .all(|r| matches!(r, Err(EngineError::ProviderFatal(_)))));

        let down = per_item(Err(EngineError::ProviderTransient("503".into())), 3);
        assert_eq!(down.len(), 3);
        assert!(down
            .iter()
            .all(|r| matches!(r, Err(EngineError::ProviderTransient(_)))));
    }
}
