//! Key-value caching for query results and embedding vectors.
//!
//! Both caches sit on a [`CacheStore`], so one backend (memory or SQLite)
//! serves both. Caches are performance only: every caller treats a cache
//! error as a miss and recomputes.
//!
//! # Namespace invalidation
//!
//! Query keys embed a per-knowledge-base generation token. Invalidating a
//! namespace replaces the token, which orphans every entry of that
//! knowledge base in one write; orphans age out through their TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{now_ts, QueryHit, RetrievalParams};
use crate::text::content_hash;

/// TTL-aware key-value store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// `ttl = None` keeps the entry until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============ Memory backend ============

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Sharded in-process cache. Readers of one key never wait on writers of
/// another.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| e.expires_at.map(|t| t > now).unwrap_or(true));
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = match self.entries.get(key) {
            Some(e) => match e.expires_at {
                Some(t) if t <= Instant::now() => true,
                _ => return Ok(Some(e.value.clone())),
            },
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ============ Query cache ============

#[derive(Serialize, Deserialize)]
struct CachedResult {
    stored_at: i64,
    results: Vec<QueryHit>,
}

/// Memoizes ranked query results per knowledge base.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn generation_key(kb_id: &str) -> String {
        format!("query:gen:{}", kb_id)
    }

    /// Cache key for `(kb_id, normalized query, params)` under the current
    /// generation of the knowledge base's namespace.
    pub async fn key_for(
        &self,
        kb_id: &str,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<String> {
        let generation = self
            .store
            .get(&Self::generation_key(kb_id))
            .await?
            .unwrap_or_else(|| "0".to_string());
        let normalized = normalize_query(query);
        let params_json = serde_json::to_string(params).unwrap_or_default();
        let digest = content_hash(&format!("{}\0{}\0{}", kb_id, normalized, params_json));
        Ok(format!("query:{}:{}:{}", kb_id, generation, digest))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<QueryHit>>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CachedResult>(&raw) {
            Ok(cached) => Ok(Some(cached.results)),
            Err(e) => {
                tracing::warn!(key, error = %e, "dropping undecodable query cache entry");
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Store results; `ttl = None` uses the cache's default TTL.
    pub async fn put(&self, key: &str, results: &[QueryHit], ttl: Option<Duration>) -> Result<()> {
        let value = CachedResult {
            stored_at: now_ts(),
            results: results.to_vec(),
        };
        let raw = serde_json::to_string(&value)
            .map_err(|e| crate::EngineError::storage(e.to_string()))?;
        self.store
            .set(key, &raw, Some(ttl.unwrap_or(self.ttl)))
            .await
    }

    /// Orphan every cached result of a knowledge base.
    pub async fn invalidate_namespace(&self, kb_id: &str) -> Result<()> {
        self.store
            .set(
                &Self::generation_key(kb_id),
                &Uuid::new_v4().to_string(),
                None,
            )
            .await
    }
}

/// Lowercase and collapse whitespace so trivially different spellings of a
/// query share one entry.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============ Vector cache ============

/// Embedding vectors keyed by model, dimensionality and content hash.
#[derive(Clone)]
pub struct VectorCache {
    store: Arc<dyn CacheStore>,
    ttl: Option<Duration>,
}

impl VectorCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    fn key(model: &str, dims: usize, hash: &str) -> String {
        format!("vec:{}:{}:{}", model, dims, hash)
    }

    pub async fn get(&self, model: &str, dims: usize, hash: &str) -> Result<Option<Vec<f32>>> {
        let Some(raw) = self.store.get(&Self::key(model, dims, hash)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<f32>>(&raw) {
            Ok(v) if v.len() == dims => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn put(&self, model: &str, dims: usize, hash: &str, vector: &[f32]) -> Result<()> {
        let raw = serde_json::to_string(vector)
            .map_err(|e| crate::EngineError::storage(e.to_string()))?;
        self.store
            .set(&Self::key(model, dims, hash), &raw, self.ttl)
            .await
    }
}
