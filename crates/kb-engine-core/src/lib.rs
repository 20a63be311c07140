//! # kb-engine core
//!
//! Runtime-agnostic logic for the knowledge-base engine: data model, error
//! taxonomy, chunking strategies, embedding trait, storage traits with
//! in-memory backends, query and vector caches, retrieval and reranking.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O. Concrete
//! providers, SQLite and Qdrant backends, extraction and the training
//! orchestrator live in the `kb-engine` application crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Error taxonomy shared by every component |
//! | [`models`] | Documents, chunks, configuration, query types |
//! | [`text`] | Tokenizer, sentence splitting, content hashing |
//! | [`chunk`] | Fixed-length, recursive-character and semantic chunking |
//! | [`embedding`] | Provider trait, hashing embedder, vector helpers |
//! | [`store`] | Vector store, keyword index and metadata store traits |
//! | [`cache`] | Cache store trait, query cache, vector cache |
//! | [`retrieve`] | Semantic, keyword and hybrid retrieval |
//! | [`rerank`] | Swappable rerank strategies |

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod rerank;
pub mod retrieve;
pub mod store;
pub mod text;

pub use error::{EngineError, Result};
