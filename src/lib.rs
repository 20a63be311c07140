//! # kb-engine
//!
//! Knowledge-base ingestion and retrieval for retrieval-augmented generation.
//!
//! Documents (PDF, DOCX, XLSX, Markdown, HTML, plain text) are registered
//! with a knowledge base, then a training run extracts their text, splits it
//! into chunks, embeds the chunks and commits them to a vector store and a
//! keyword index. Queries run semantic, keyword or hybrid retrieval, an
//! optional reranking pass, and return ranked chunks with citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────────────────────────────┐   ┌──────────────┐
//! │ Documents │──▶│ Orchestrator                       │──▶│ Vector store │
//! │ add/import│   │ extract ▸ chunk ▸ vectorize ▸ commit│   │ sqlite/qdrant│
//! └───────────┘   └────────────────────────────────────┘   │ /memory      │
//!                                                          ├──────────────┤
//!                    ┌─────────────────────────────────────│ Keyword index│
//!                    ▼                                     └──────────────┘
//!             ┌──────────────┐   ┌──────────┐   ┌─────────────┐
//!             │  Retriever   │──▶│ Reranker │──▶│ Query cache │
//!             └──────────────┘   └──────────┘   └─────────────┘
//! ```
//!
//! Algorithms and storage traits live in the `kb-engine-core` crate; this
//! crate wires them to SQLite, Qdrant, HTTP embedding providers, the CLI and
//! the HTTP server.
//!
//! ## Quick Start
//!
//! ```bash
//! kbe init
//! kbe kb create handbook
//! kbe add handbook ./docs
//! kbe train handbook
//! kbe query handbook "deployment checklist" --mode hybrid
//! kbe serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite metadata store, vector store, keyword index and cache |
//! | [`qdrant`] | Qdrant vector store over HTTP |
//! | [`embedding`] | Embedding providers |
//! | [`vectorizer`] | Batched, cached, retrying embedding |
//! | [`extract`] | Format-specific text extraction |
//! | [`orchestrator`] | Training runs |
//! | [`progress`] | Training progress reporting |
//! | [`engine`] | The engine facade used by the CLI and server |
//! | [`import`] | Folder import |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod import;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod qdrant;
pub mod server;
pub mod sqlite_store;
pub mod vectorizer;

pub use engine::{EngineParts, KnowledgeEngine};
