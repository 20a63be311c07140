//! Core data models for ingestion and retrieval.
//!
//! Documents move through the [`DocumentStatus`] state machine while the
//! orchestrator turns them into [`Chunk`]s. Queries are described by
//! [`RetrievalParams`] and answered with [`QueryResponse`]s carrying
//! [`Citation`]s back to the source documents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_TEXT: &str = "text/plain";

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Documents ============

/// Per-document processing state.
///
/// ```text
/// pending → extracting → chunked → vectorizing → ready
///      \________\___________\___________\_____→ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Chunked,
    Vectorizing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Vectorizing => "vectorizing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    /// True for `ready` and `failed`: the run is done with this document.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Ready | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "extracting" => Ok(DocumentStatus::Extracting),
            "chunked" => Ok(DocumentStatus::Chunked),
            "vectorizing" => Ok(DocumentStatus::Vectorizing),
            "ready" => Ok(DocumentStatus::Ready),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(EngineError::storage(format!(
                "unknown document status '{}'",
                other
            ))),
        }
    }
}

/// Declared format of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Docx,
    Xlsx,
    Markdown,
    Html,
    #[serde(rename = "plaintext")]
    PlainText,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Xlsx => "xlsx",
            SourceType::Markdown => "markdown",
            SourceType::Html => "html",
            SourceType::PlainText => "plaintext",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            SourceType::Pdf => MIME_PDF,
            SourceType::Docx => MIME_DOCX,
            SourceType::Xlsx => MIME_XLSX,
            SourceType::Markdown => MIME_MARKDOWN,
            SourceType::Html => MIME_HTML,
            SourceType::PlainText => MIME_TEXT,
        }
    }

    /// Parse a declared type: short name, common alias or MIME type.
    ///
    /// Fails with [`EngineError::UnsupportedFormat`] when no handler exists.
    pub fn from_declared(declared: &str) -> Result<Self> {
        let normalized = declared.trim().to_ascii_lowercase();
        let base = normalized.split(';').next().unwrap_or("").trim();
        match base {
            "pdf" | MIME_PDF => Ok(SourceType::Pdf),
            "docx" | MIME_DOCX => Ok(SourceType::Docx),
            "xlsx" | MIME_XLSX => Ok(SourceType::Xlsx),
            "markdown" | "md" | MIME_MARKDOWN => Ok(SourceType::Markdown),
            "html" | "htm" | MIME_HTML => Ok(SourceType::Html),
            "plaintext" | "txt" | "text" | MIME_TEXT => Ok(SourceType::PlainText),
            _ => Err(EngineError::UnsupportedFormat(declared.to_string())),
        }
    }

    /// Infer the type from a file extension, if one is handled.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(SourceType::Pdf),
            "docx" => Some(SourceType::Docx),
            "xlsx" => Some(SourceType::Xlsx),
            "md" | "markdown" => Some(SourceType::Markdown),
            "html" | "htm" => Some(SourceType::Html),
            "txt" | "text" => Some(SourceType::PlainText),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        SourceType::from_declared(s)
    }
}

/// A source document registered with a knowledge base.
///
/// The raw bytes live in the metadata store and are loaded on demand.
/// Documents are soft-deleted: `deleted` hides them from training and
/// status while their rows remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub name: String,
    pub source_type: SourceType,
    /// Where the bytes came from (file path, URL), if known.
    pub content_ref: Option<String>,
    /// SHA-256 of the raw bytes.
    pub content_hash: String,
    pub status: DocumentStatus,
    pub failure_reason: Option<String>,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn new(
        kb_id: &str,
        name: &str,
        source_type: SourceType,
        content_ref: Option<String>,
        raw: &[u8],
    ) -> Self {
        let now = now_ts();
        Self {
            id: Uuid::new_v4().to_string(),
            kb_id: kb_id.to_string(),
            name: name.to_string(),
            source_type,
            content_ref,
            content_hash: format!("{:x}", Sha256::digest(raw)),
            status: DocumentStatus::Pending,
            failure_reason: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A passage of a document, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub kb_id: String,
    pub document_id: String,
    /// Position within the document. Ordinals form `0..n` with no gaps.
    pub ordinal: u32,
    pub text: String,
    /// SHA-256 of `text`, keys the vector cache.
    pub content_hash: String,
    pub section_title: Option<String>,
    pub page_number: Option<u32>,
}

// ============ Structural hints ============

/// A heading found during extraction, positioned by byte offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub offset: usize,
    pub level: u8,
    pub title: String,
}

/// A byte range `[start, end)` of the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn contains(&self, offset: usize) -> bool {
        offset > self.start && offset < self.end
    }
}

/// Structure recovered by the extractor alongside the plain text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralHints {
    pub headings: Vec<Heading>,
    pub tables: Vec<TextSpan>,
    /// Byte offsets where a new page starts (paged formats only).
    pub page_breaks: Vec<usize>,
}

impl StructuralHints {
    /// Title of the nearest heading at or before `offset`.
    pub fn section_at(&self, offset: usize) -> Option<&str> {
        self.headings
            .iter()
            .take_while(|h| h.offset <= offset)
            .last()
            .map(|h| h.title.as_str())
    }

    /// 1-based page for `offset`, `None` for unpaged sources.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        if self.page_breaks.is_empty() {
            return None;
        }
        let passed = self.page_breaks.iter().filter(|b| **b <= offset).count();
        Some(passed as u32 + 1)
    }
}

// ============ Knowledge base configuration ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[serde(alias = "fixed-length", alias = "fixed_length")]
    Fixed,
    #[serde(alias = "recursive-character", alias = "recursive_character")]
    Recursive,
    Semantic,
}

impl FromStr for ChunkStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" | "fixed-length" | "fixed_length" => Ok(ChunkStrategy::Fixed),
            "recursive" | "recursive-character" | "recursive_character" => {
                Ok(ChunkStrategy::Recursive)
            }
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => Err(EngineError::invalid(format!(
                "unknown chunking strategy '{}'",
                other
            ))),
        }
    }
}

/// How a knowledge base splits text. Sizes are in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Minimum cosine similarity between neighbouring sentences for the
    /// semantic strategy to keep them in one chunk.
    pub semantic_threshold: f32,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Recursive,
            chunk_size: 1000,
            chunk_overlap: 200,
            semantic_threshold: 0.75,
        }
    }
}

impl ChunkingPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EngineError::invalid("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(EngineError::invalid(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.semantic_threshold) {
            return Err(EngineError::invalid("semantic_threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(EngineError::invalid(format!(
                "unknown search mode '{}', use semantic, keyword or hybrid",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RerankStrategy {
    #[serde(rename = "none")]
    PassThrough,
    #[serde(rename = "rrf")]
    ReciprocalRankFusion,
    #[serde(rename = "lexical")]
    LexicalOverlap,
    #[serde(rename = "cross-encoder")]
    CrossEncoder,
}

impl FromStr for RerankStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "off" => Ok(RerankStrategy::PassThrough),
            "rrf" => Ok(RerankStrategy::ReciprocalRankFusion),
            "lexical" => Ok(RerankStrategy::LexicalOverlap),
            "cross-encoder" => Ok(RerankStrategy::CrossEncoder),
            other => Err(EngineError::invalid(format!(
                "unknown rerank strategy '{}'",
                other
            ))),
        }
    }
}

/// Query-time defaults stored with a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDefaults {
    pub top_k: i64,
    pub mode: SearchMode,
    /// Semantic share of the hybrid score; keyword gets `1 - hybrid_weight`.
    pub hybrid_weight: f64,
    pub candidate_k: usize,
    pub rerank: RerankStrategy,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            top_k: 5,
            mode: SearchMode::Hybrid,
            hybrid_weight: 0.5,
            candidate_k: 50,
            rerank: RerankStrategy::PassThrough,
        }
    }
}

/// Per-knowledge-base configuration. Immutable for the length of a run;
/// changes go through a re-training instead of mutating stored vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    pub id: String,
    pub name: String,
    pub chunking: ChunkingPolicy,
    /// Identifier of the embedding provider and model (`provider:model`).
    pub embedding_model: String,
    /// Name of the vector backend holding this knowledge base's vectors.
    pub vector_backend: String,
    pub retrieval: RetrievalDefaults,
    /// Fixed by the first vectorization, immutable afterwards.
    pub embedding_dims: Option<usize>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KnowledgeBaseConfig {
    pub fn new(
        name: &str,
        chunking: ChunkingPolicy,
        embedding_model: &str,
        vector_backend: &str,
        retrieval: RetrievalDefaults,
    ) -> Self {
        let now = now_ts();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            chunking,
            embedding_model: embedding_model.to_string(),
            vector_backend: vector_backend.to_string(),
            retrieval,
            embedding_dims: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============ Query ============

/// Restricts search hits to a subset of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn allows(&self, document_id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|id| id == document_id),
            None => true,
        }
    }
}

/// Fully resolved parameters for one retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub top_k: i64,
    pub mode: SearchMode,
    pub hybrid_weight: f64,
    /// Candidates fetched per channel before merging.
    pub candidate_k: usize,
    pub rerank: RerankStrategy,
    #[serde(default)]
    pub filter: SearchFilter,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        RetrievalParams::from(&RetrievalDefaults::default())
    }
}

impl From<&RetrievalDefaults> for RetrievalParams {
    fn from(defaults: &RetrievalDefaults) -> Self {
        Self {
            top_k: defaults.top_k,
            mode: defaults.mode,
            hybrid_weight: defaults.hybrid_weight,
            candidate_k: defaults.candidate_k,
            rerank: defaults.rerank,
            filter: SearchFilter::default(),
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k <= 0 {
            return Err(EngineError::invalid(format!(
                "top_k must be >= 1, got {}",
                self.top_k
            )));
        }
        if !(0.0..=1.0).contains(&self.hybrid_weight) {
            return Err(EngineError::invalid("hybrid_weight must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Caller overrides on top of a knowledge base's [`RetrievalDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub top_k: Option<i64>,
    pub mode: Option<SearchMode>,
    pub hybrid_weight: Option<f64>,
    pub candidate_k: Option<usize>,
    pub rerank: Option<RerankStrategy>,
    pub document_ids: Option<Vec<String>>,
}

impl QueryOptions {
    pub fn resolve(&self, defaults: &RetrievalDefaults) -> RetrievalParams {
        let mut params = RetrievalParams::from(defaults);
        if let Some(top_k) = self.top_k {
            params.top_k = top_k;
        }
        if let Some(mode) = self.mode {
            params.mode = mode;
        }
        if let Some(w) = self.hybrid_weight {
            params.hybrid_weight = w;
        }
        if let Some(k) = self.candidate_k {
            params.candidate_k = k;
        }
        if let Some(rerank) = self.rerank {
            params.rerank = rerank;
        }
        params.filter.document_ids = self.document_ids.clone();
        params
    }
}

/// A retrieval candidate with its per-channel scoring breakdown.
///
/// `retrieval_score` is fixed by the retriever; rerankers only rewrite
/// `score` and the list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub section_title: Option<String>,
    pub page_number: Option<u32>,
    pub retrieval_score: f64,
    pub score: f64,
    pub semantic_score: Option<f64>,
    pub keyword_score: Option<f64>,
    /// 1-based rank in the semantic channel.
    pub semantic_rank: Option<usize>,
    /// 1-based rank in the keyword channel.
    pub keyword_rank: Option<usize>,
}

/// Where a result came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub document_name: String,
    pub chunk_id: String,
    pub ordinal: u32,
    pub section_title: Option<String>,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub rank: usize,
    pub score: f64,
    pub text: String,
    pub semantic_score: Option<f64>,
    pub keyword_score: Option<f64>,
    pub citation: Citation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub kb_id: String,
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<QueryHit>,
    /// True when served from the query cache.
    pub cached: bool,
}

// ============ Training ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingOptions {
    /// Re-process documents that are already `ready`.
    #[serde(default)]
    pub force: bool,
    /// Restrict the run to these documents.
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
}

/// Outcome of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub kb_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    /// Documents picked up by a worker.
    pub processed: usize,
    pub ready: usize,
    pub failed: usize,
    /// Already `ready` and not forced, or locked by another worker.
    pub skipped: usize,
    pub cancelled: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub document_id: String,
    pub name: String,
    pub source_type: SourceType,
    pub status: DocumentStatus,
    pub failure_reason: Option<String>,
    pub chunk_count: usize,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub ready: usize,
    pub failed: usize,
}

/// Aggregated training state of a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub kb_id: String,
    pub running: bool,
    /// At least one document is `ready`.
    pub ready_for_query: bool,
    pub counts: StatusCounts,
    pub documents: Vec<DocumentProgress>,
    pub last_run: Option<TrainingReport>,
}

impl TrainingStatus {
    pub fn from_documents(
        kb_id: &str,
        running: bool,
        documents: Vec<DocumentProgress>,
        last_run: Option<TrainingReport>,
    ) -> Self {
        let mut counts = StatusCounts::default();
        for doc in &documents {
            match doc.status {
                DocumentStatus::Pending => counts.pending += 1,
                DocumentStatus::Ready => counts.ready += 1,
                DocumentStatus::Failed => counts.failed += 1,
                _ => counts.in_progress += 1,
            }
        }
        Self {
            kb_id: kb_id.to_string(),
            running,
            ready_for_query: counts.ready > 0,
            counts,
            documents,
            last_run,
        }
    }
}
