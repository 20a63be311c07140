//! Qdrant vector store over the REST API.
//!
//! One collection per knowledge base, named `{collection_prefix}{kb_id}`,
//! created on the first upsert with that upsert's vector size. Point ids
//! must be UUIDs, so chunk ids that are not UUIDs are mapped onto one
//! deterministically; the original chunk id travels in the payload.
//!
//! Transport failures and HTTP 5xx map to
//! [`BackendUnavailable`](EngineError::BackendUnavailable).

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use kb_engine_core::models::SearchFilter;
use kb_engine_core::store::{DistanceMetric, ScoredChunk, VectorMetadata, VectorRecord, VectorStore};
use kb_engine_core::{EngineError, Result};

use crate::config::QdrantConfig;

pub struct QdrantStore {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    prefix: String,
    metric: DistanceMetric,
    /// Vector size per collection, filled lazily.
    dims: DashMap<String, usize>,
}

impl QdrantStore {
    pub fn new(config: &QdrantConfig, metric: DistanceMetric, timeout: Duration) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                EngineError::invalid(format!("{} environment variable not set", var))
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            prefix: config.collection_prefix.clone(),
            metric,
            dims: DashMap::new(),
        })
    }

    fn collection(&self, kb_id: &str) -> String {
        format!("{}{}", self.prefix, kb_id)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.url, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("qdrant: {}", e)))
    }

    /// Vector size of the collection, or `None` if it does not exist.
    async fn collection_dims(&self, collection: &str) -> Result<Option<usize>> {
        if let Some(d) = self.dims.get(collection) {
            return Ok(Some(*d));
        }
        let resp = self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{}", collection)))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check(resp).await?;
        let size = body
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::storage("qdrant: collection info without vector size"))?
            as usize;
        self.dims.insert(collection.to_string(), size);
        Ok(Some(size))
    }

    async fn ensure_collection(&self, collection: &str, size: usize) -> Result<()> {
        match self.collection_dims(collection).await? {
            Some(existing) if existing != size => Err(EngineError::DimensionMismatch {
                expected: existing,
                actual: size,
            }),
            Some(_) => Ok(()),
            None => {
                let distance = match self.metric {
                    DistanceMetric::Cosine => "Cosine",
                    DistanceMetric::Euclidean => "Euclid",
                };
                let resp = self
                    .send(
                        self.request(reqwest::Method::PUT, &format!("/collections/{}", collection))
                            .json(&json!({ "vectors": { "size": size, "distance": distance } })),
                    )
                    .await?;
                check(resp).await?;
                tracing::info!(collection, size, "created qdrant collection");
                self.dims.insert(collection.to_string(), size);
                Ok(())
            }
        }
    }

    async fn delete_points(&self, kb_id: &str, selector: Value) -> Result<()> {
        let collection = self.collection(kb_id);
        let resp = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/delete?wait=true", collection),
                )
                .json(&selector),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }
}

/// Qdrant point id for a chunk id.
pub fn point_id(chunk_id: &str) -> String {
    match Uuid::parse_str(chunk_id) {
        Ok(id) => id.to_string(),
        Err(_) => {
            let digest = Sha256::digest(chunk_id.as_bytes());
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            Uuid::from_bytes(bytes).to_string()
        }
    }
}

async fn check(resp: Response) -> Result<Value> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<Value>()
            .await
            .map_err(|e| EngineError::storage(format!("qdrant: invalid response: {}", e)));
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(EngineError::BackendUnavailable(format!(
            "qdrant {}: {}",
            status, body
        )))
    } else {
        Err(EngineError::storage(format!("qdrant {}: {}", status, body)))
    }
}

fn document_filter(filter: &SearchFilter) -> Option<Value> {
    filter.document_ids.as_ref().map(|ids| {
        json!({ "must": [ { "key": "document_id", "match": { "any": ids } } ] })
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend_name(&self) -> &str {
        "qdrant"
    }

    async fn upsert(
        &self,
        kb_id: &str,
        chunk_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<()> {
        let record = VectorRecord {
            chunk_id: chunk_id.to_string(),
            vector: vector.to_vec(),
            metadata: metadata.clone(),
        };
        self.upsert_batch(kb_id, std::slice::from_ref(&record)).await
    }

    async fn upsert_batch(&self, kb_id: &str, records: &[VectorRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let collection = self.collection(kb_id);
        self.ensure_collection(&collection, first.vector.len()).await?;

        let points: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "id": point_id(&r.chunk_id),
                    "vector": r.vector,
                    "payload": {
                        "chunk_id": r.chunk_id,
                        "document_id": r.metadata.document_id,
                        "ordinal": r.metadata.ordinal,
                        "content_hash": r.metadata.content_hash,
                    }
                })
            })
            .collect();

        let resp = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/points?wait=true", collection),
                )
                .json(&json!({ "points": points })),
            )
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &str,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let collection = self.collection(kb_id);
        let Some(dims) = self.collection_dims(&collection).await? else {
            return Ok(Vec::new());
        };
        if dims != query.len() {
            return Err(EngineError::DimensionMismatch {
                expected: dims,
                actual: query.len(),
            });
        }

        let mut body = json!({
            "vector": query,
            "limit": k,
            "with_payload": true,
        });
        if let Some(f) = document_filter(filter) {
            body["filter"] = f;
        }

        let resp = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/search", collection),
                )
                .json(&body),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.dims.remove(&collection);
            return Ok(Vec::new());
        }
        let json = check(resp).await?;
        let results = json
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::storage("qdrant: search response without result"))?;

        let mut hits = Vec::with_capacity(results.len());
        for point in results {
            let payload = point.get("payload");
            let field = |name: &str| {
                payload
                    .and_then(|p| p.get(name))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let (Some(chunk_id), Some(document_id)) = (field("chunk_id"), field("document_id"))
            else {
                tracing::debug!(?point, "qdrant point without chunk payload, skipping");
                continue;
            };
            let raw = point.get("score").and_then(Value::as_f64).unwrap_or(0.0);
            hits.push(ScoredChunk {
                chunk_id,
                document_id,
                score: self.metric.normalize(raw),
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits)
    }

    async fn delete(&self, kb_id: &str, chunk_id: &str) -> Result<()> {
        self.delete_points(kb_id, json!({ "points": [point_id(chunk_id)] }))
            .await
    }

    async fn delete_document(&self, kb_id: &str, document_id: &str) -> Result<()> {
        self.delete_points(
            kb_id,
            json!({
                "filter": { "must": [ { "key": "document_id", "match": { "value": document_id } } ] }
            }),
        )
        .await
    }

    async fn delete_all(&self, kb_id: &str) -> Result<()> {
        let collection = self.collection(kb_id);
        let resp = self
            .send(self.request(reqwest::Method::DELETE, &format!("/collections/{}", collection)))
            .await?;
        self.dims.remove(&collection);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_chunk_ids_are_kept() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(point_id(&id), id);
    }

    #[test]
    fn other_chunk_ids_map_deterministically() {
        let a = point_id("chunk-1");
        assert_eq!(a, point_id("chunk-1"));
        assert_ne!(a, point_id("chunk-2"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn filter_only_when_documents_given() {
        assert!(document_filter(&SearchFilter::default()).is_none());
        let f = document_filter(&SearchFilter {
            document_ids: Some(vec!["d1".into()]),
        })
        .unwrap();
        assert_eq!(f["must"][0]["match"]["any"][0], "d1");
    }
}
