//! SQLite-backed storage.
//!
//! [`SqliteStore`] wraps one [`SqlitePool`] and implements every storage
//! trait of the core crate against the schema created by
//! [`migrate`](crate::migrate):
//!
//! | Trait | Tables |
//! |-------|--------|
//! | [`MetadataStore`] | `knowledge_bases`, `documents`, `chunks` |
//! | [`VectorStore`] | `chunk_vectors` (brute-force scoring) |
//! | [`KeywordIndex`] | `chunks_fts` (FTS5, BM25) |
//! | [`CacheStore`] | `cache_entries` |

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use kb_engine_core::cache::CacheStore;
use kb_engine_core::embedding::{blob_to_vec, cosine_similarity, euclidean_distance, vec_to_blob};
use kb_engine_core::models::{
    now_ts, Chunk, Document, DocumentStatus, KnowledgeBaseConfig, SearchFilter,
};
use kb_engine_core::store::{
    DistanceMetric, KeywordIndex, MetadataStore, ScoredChunk, VectorMetadata, VectorRecord,
    VectorStore,
};
use kb_engine_core::text::tokenize;
use kb_engine_core::{EngineError, Result};

/// Pool exhaustion and I/O failures mean the database is unreachable;
/// everything else is a storage error.
fn db_err(e: sqlx::Error) -> EngineError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            EngineError::BackendUnavailable(format!("sqlite: {}", e))
        }
        other => EngineError::storage(other.to_string()),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct SqliteStore {
    pool: SqlitePool,
    metric: DistanceMetric,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_metric(pool, DistanceMetric::Cosine)
    }

    pub fn with_metric(pool: SqlitePool, metric: DistanceMetric) -> Self {
        Self { pool, metric }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete expired cache rows. Returns the number removed.
    pub async fn purge_expired_cache(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    let deleted: i64 = row.get("deleted");
    Ok(Document {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        name: row.get("name"),
        source_type: source_type.parse()?,
        content_ref: row.get("content_ref"),
        content_hash: row.get("content_hash"),
        status: status.parse()?,
        failure_reason: row.get("failure_reason"),
        deleted: deleted != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let ordinal: i64 = row.get("ordinal");
    let page_number: Option<i64> = row.get("page_number");
    Chunk {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        document_id: row.get("document_id"),
        ordinal: ordinal as u32,
        text: row.get("text"),
        content_hash: row.get("content_hash"),
        section_title: row.get("section_title"),
        page_number: page_number.map(|p| p as u32),
    }
}

fn row_to_config(row: &SqliteRow) -> Result<KnowledgeBaseConfig> {
    let config_json: String = row.get("config_json");
    let dims: Option<i64> = row.get("embedding_dims");
    let mut config: KnowledgeBaseConfig = serde_json::from_str(&config_json)
        .map_err(|e| EngineError::storage(format!("corrupt knowledge base config: {}", e)))?;
    // the column is authoritative
    config.embedding_dims = dims.map(|d| d as usize);
    Ok(config)
}

const DOCUMENT_COLUMNS: &str = "id, kb_id, name, source_type, content_ref, content_hash, status, \
     failure_reason, deleted, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "id, kb_id, document_id, ordinal, text, content_hash, section_title, page_number";

// ============ Metadata ============

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn save_knowledge_base(&self, config: &KnowledgeBaseConfig) -> Result<()> {
        let config_json = serde_json::to_string(config)
            .map_err(|e| EngineError::storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO knowledge_bases (id, name, config_json, embedding_dims, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                config_json = excluded.config_json,
                embedding_dims = excluded.embedding_dims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config_json)
        .bind(config.embedding_dims.map(|d| d as i64))
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_knowledge_base_config(&self, kb_id: &str) -> Result<Option<KnowledgeBaseConfig>> {
        let row = sqlx::query("SELECT config_json, embedding_dims FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_config).transpose()
    }

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBaseConfig>> {
        let rows = sqlx::query(
            "SELECT config_json, embedding_dims FROM knowledge_bases ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_config).collect()
    }

    async fn claim_embedding_dims(&self, kb_id: &str, dims: usize) -> Result<usize> {
        sqlx::query(
            "UPDATE knowledge_bases SET embedding_dims = ? WHERE id = ? AND embedding_dims IS NULL",
        )
        .bind(dims as i64)
        .bind(kb_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let stored: Option<Option<i64>> =
            sqlx::query_scalar("SELECT embedding_dims FROM knowledge_bases WHERE id = ?")
                .bind(kb_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        match stored {
            Some(Some(d)) => Ok(d as usize),
            _ => Err(EngineError::not_found(format!("knowledge base {}", kb_id))),
        }
    }

    async fn add_document(&self, doc: &Document, raw: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, kb_id, name, source_type, content_ref, raw_content,
                                   content_hash, status, failure_reason, deleted,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.kb_id)
        .bind(&doc.name)
        .bind(doc.source_type.as_str())
        .bind(&doc.content_ref)
        .bind(raw)
        .bind(&doc.content_hash)
        .bind(doc.status.as_str())
        .bind(&doc.failure_reason)
        .bind(i64::from(doc.deleted))
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE kb_id = ? AND deleted = 0 \
             ORDER BY created_at ASC, rowid ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn load_raw_content(&self, doc_id: &str) -> Result<Vec<u8>> {
        let raw: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT raw_content FROM documents WHERE id = ?")
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        raw.ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))
    }

    async fn save_document_state(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let done = sqlx::query(
            "UPDATE documents SET status = ?, failure_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now_ts())
        .bind(doc_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("document {}", doc_id)));
        }
        Ok(())
    }

    async fn save_extracted_text(&self, doc_id: &str, text: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET extracted_text = ? WHERE id = ?")
            .bind(text)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn soft_delete_document(&self, doc_id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET deleted = 1, updated_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn save_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, kb_id, document_id, ordinal, text, content_hash,
                                    section_title, page_number)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.kb_id)
            .bind(doc_id)
            .bind(i64::from(chunk.ordinal))
            .bind(&chunk.text)
            .bind(&chunk.content_hash)
            .bind(&chunk.section_title)
            .bind(chunk.page_number.map(i64::from))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_chunks(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY ordinal ASC",
            CHUNK_COLUMNS
        ))
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn load_chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM chunks WHERE id IN (", CHUNK_COLUMNS));
        let mut sep = qb.separated(", ");
        for id in chunk_ids {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(")");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn count_chunks(&self, kb_id: &str) -> Result<Vec<(String, usize)>> {
        let rows = sqlx::query(
            "SELECT document_id, COUNT(*) AS n FROM chunks WHERE kb_id = ? GROUP BY document_id",
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                let n: i64 = row.get("n");
                (row.get("document_id"), n as usize)
            })
            .collect())
    }
}

// ============ Vectors ============

#[async_trait]
impl VectorStore for SqliteStore {
    fn backend_name(&self) -> &str {
        "sqlite"
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, kb_id, document_id, ordinal, content_hash, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    kb_id = excluded.kb_id,
                    document_id = excluded.document_id,
                    ordinal = excluded.ordinal,
                    content_hash = excluded.content_hash,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&r.chunk_id)
            .bind(kb_id)
            .bind(&r.metadata.document_id)
            .bind(i64::from(r.metadata.ordinal))
            .bind(&r.metadata.content_hash)
            .bind(r.vector.len() as i64)
            .bind(vec_to_blob(&r.vector))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &str,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, dims, embedding FROM chunk_vectors WHERE kb_id = ?",
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let document_id: String = row.get("document_id");
            if !filter.allows(&document_id) {
                continue;
            }
            let dims: i64 = row.get("dims");
            if dims as usize != query.len() {
                return Err(EngineError::DimensionMismatch {
                    expected: dims as usize,
                    actual: query.len(),
                });
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let raw = match self.metric {
                DistanceMetric::Cosine => cosine_similarity(query, &vector),
                DistanceMetric::Euclidean => euclidean_distance(query, &vector),
            };
            hits.push(ScoredChunk {
                chunk_id: row.get("chunk_id"),
                document_id,
                score: self.metric.normalize(f64::from(raw)),
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, kb_id: &str, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE kb_id = ? AND chunk_id = ?")
            .bind(kb_id)
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_document(&self, kb_id: &str, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE kb_id = ? AND document_id = ?")
            .bind(kb_id)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_all(&self, kb_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ============ Keyword index ============

/// Turn free text into an FTS5 query that ORs quoted terms, so user input
/// can never be parsed as FTS5 syntax.
fn fts_query(query: &str) -> Option<String> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl KeywordIndex for SqliteStore {
    async fn index_chunks(&self, kb_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in chunks {
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&chunk.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, kb_id, document_id, text) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(kb_id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn remove_document(&self, kb_id: &str, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE kb_id = ? AND document_id = ?")
            .bind(kb_id)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self, kb_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &str,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, rank FROM chunks_fts WHERE chunks_fts MATCH ",
        );
        qb.push_bind(match_expr);
        qb.push(" AND kb_id = ");
        qb.push_bind(kb_id);
        if let Some(ids) = &filter.document_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND document_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
        }
        qb.push(" ORDER BY rank, chunk_id LIMIT ");
        qb.push_bind(k as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    // negate so higher = better
                    score: -rank,
                }
            })
            .collect())
    }
}

// ============ Cache ============

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: Option<i64> = row.get("expires_at");
        if matches!(expires_at, Some(t) if t <= now_ms()) {
            CacheStore::delete(self, key).await?;
            return Ok(None);
        }
        Ok(Some(row.get("value")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| now_ms() + d.as_millis() as i64);
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_engine_core::models::{ChunkingPolicy, RetrievalDefaults, SourceType};
    use kb_engine_core::text::content_hash;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("kb.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn kb() -> KnowledgeBaseConfig {
        KnowledgeBaseConfig::new(
            "docs",
            ChunkingPolicy::default(),
            "hashing:bow-8",
            "sqlite",
            RetrievalDefaults::default(),
        )
    }

    fn chunk(kb_id: &str, doc_id: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc_id, ordinal),
            kb_id: kb_id.to_string(),
            document_id: doc_id.to_string(),
            ordinal,
            text: text.to_string(),
            content_hash: content_hash(text),
            section_title: Some("Intro".to_string()),
            page_number: Some(2),
        }
    }

    #[tokio::test]
    async fn knowledge_base_roundtrip_and_dims_claim() {
        let (_dir, store) = store().await;
        let config = kb();
        store.save_knowledge_base(&config).await.unwrap();

        let loaded = store
            .load_knowledge_base_config(&config.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, config);

        assert_eq!(store.claim_embedding_dims(&config.id, 8).await.unwrap(), 8);
        assert_eq!(store.claim_embedding_dims(&config.id, 16).await.unwrap(), 8);
        let reloaded = store
            .load_knowledge_base_config(&config.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.embedding_dims, Some(8));
        assert!(matches!(
            store.claim_embedding_dims("missing", 8).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn documents_track_state_and_soft_delete() {
        let (_dir, store) = store().await;
        let config = kb();
        store.save_knowledge_base(&config).await.unwrap();
        let doc = Document::new(&config.id, "a.txt", SourceType::PlainText, None, b"hello");
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
        assert!(store.list_documents(&config.id).await.unwrap().is_empty());
        assert!(store.load_document(&doc.id).await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn save_chunks_replaces_previous_set() {
        let (_dir, store) = store().await;
        let config = kb();
        store.save_knowledge_base(&config).await.unwrap();
        let doc = Document::new(&config.id, "a.txt", SourceType::PlainText, None, b"x");
        store.add_document(&doc, b"x").await.unwrap();

        let first: Vec<Chunk> = (0..3)
            .map(|i| chunk(&config.id, &doc.id, i, "old text"))
            .collect();
        store.save_chunks(&doc.id, &first).await.unwrap();
        let second = vec![Chunk {
            id: "fresh".to_string(),
            ..chunk(&config.id, &doc.id, 0, "new text")
        }];
        store.save_chunks(&doc.id, &second).await.unwrap();

        let loaded = store.load_chunks(&doc.id).await.unwrap();
        assert_eq!(loaded, second);
        assert_eq!(
            store.count_chunks(&config.id).await.unwrap(),
            vec![(doc.id.clone(), 1)]
        );
        let by_id = store
            .load_chunks_by_ids(&["fresh".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_normalizes_and_filters() {
        let (_dir, store) = store().await;
        let meta = |doc: &str| VectorMetadata {
            document_id: doc.to_string(),
            ordinal: 0,
            content_hash: "h".to_string(),
        };
        store.upsert("kb", "a", &[1.0, 0.0], &meta("d1")).await.unwrap();
        store.upsert("kb", "b", &[0.0, 1.0], &meta("d2")).await.unwrap();
        store.upsert("other", "c", &[1.0, 0.0], &meta("d3")).await.unwrap();

        let hits = VectorStore::search(&store, "kb", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.5).abs() < 1e-6);

        let filtered = VectorStore::search(
                &store,
                "kb",
                &[1.0, 0.0],
                10,
                &SearchFilter {
                    document_ids: Some(vec!["d2".to_string()]),
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chunk_id, "b");

        let err = VectorStore::search(&store, "kb", &[1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));

        store.delete_document("kb", "d1").await.unwrap();
        let hits = VectorStore::search(&store, "kb", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        store.delete_all("kb").await.unwrap();
        assert!(
            VectorStore::search(&store, "kb", &[1.0, 0.0], 10, &SearchFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn fts_search_ranks_and_scopes_by_kb() {
        let (_dir, store) = store().await;
        store
            .index_chunks(
                "kb",
                &[
                    chunk("kb", "d1", 0, "tokio runtime scheduler"),
                    chunk("kb", "d1", 1, "sourdough bread recipe"),
                ],
            )
            .await
            .unwrap();
        store
            .index_chunks("other", &[chunk("other", "d9", 0, "tokio everywhere")])
            .await
            .unwrap();

        let hits = KeywordIndex::search(&store, "kb", "Tokio? (runtime)", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "d1-0");
        assert!(hits[0].score > 0.0);

        store.remove_document("kb", "d1").await.unwrap();
        let hits = KeywordIndex::search(&store, "kb", "tokio", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert!(fts_query("  ?!  ").is_none());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let (_dir, store) = store().await;
        store
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        store.set("forever", "v", None).await.unwrap();
        assert_eq!(CacheStore::get(&store, "k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(CacheStore::get(&store, "k").await.unwrap(), None);
        assert_eq!(
            CacheStore::get(&store, "forever").await.unwrap().as_deref(),
            Some("v")
        );
    }
}
