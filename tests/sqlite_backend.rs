//! The engine on its SQLite backends: state survives reopening the database.

use kb_engine::config::Config;
use kb_engine::engine::{KnowledgeEngine, NewKnowledgeBase};
use kb_engine_core::models::{
    ChunkStrategy, ChunkingPolicy, DocumentStatus, QueryOptions, RerankStrategy, SearchMode,
    TrainingOptions,
};

const RUNBOOK: &str = "# Runbook

## Restarts

Drain the node before restarting the scheduler. Wait until every pod has been rescheduled elsewhere, then restart and uncordon the node again.

## Backups

Snapshots run nightly at two. Each snapshot is copied to cold storage and kept for thirty days before the lifecycle policy prunes it.
";

fn config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::with_db_path(dir.path().join("data/kbe.sqlite"));
    config.training.workers = 2;
    config
}

fn keyword(top_k: i64) -> QueryOptions {
    QueryOptions {
        top_k: Some(top_k),
        mode: Some(SearchMode::Keyword),
        rerank: Some(RerankStrategy::PassThrough),
        ..Default::default()
    }
}

#[tokio::test]
async fn trained_state_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let engine = KnowledgeEngine::open(config(&dir)).await.unwrap();
    assert_eq!(engine.vector_backend(), "sqlite");
    let kb = engine
        .create_knowledge_base(NewKnowledgeBase {
            name: "ops".to_string(),
            chunking: Some(ChunkingPolicy {
                strategy: ChunkStrategy::Recursive,
                chunk_size: 200,
                chunk_overlap: 20,
                semantic_threshold: 0.75,
            }),
            retrieval: None,
        })
        .await
        .unwrap();
    let doc = engine
        .add_document(
            &kb.id,
            "runbook.md",
            "markdown",
            RUNBOOK.as_bytes(),
            Some("file:///srv/runbook.md".to_string()),
        )
        .await
        .unwrap();
    let report = engine
        .train_quiet(&kb.id, TrainingOptions::default())
        .await
        .unwrap();
    assert_eq!(report.ready, 1);
    let before = engine
        .query(&kb.id, "snapshots nightly", &keyword(3))
        .await
        .unwrap();
    assert!(!before.results.is_empty());
    engine.shutdown().await;

    let engine = KnowledgeEngine::open(config(&dir)).await.unwrap();
    let reopened = engine.knowledge_base("ops").await.unwrap();
    assert_eq!(reopened.id, kb.id);
    assert_eq!(reopened.chunking.chunk_size, 200);
    assert_eq!(reopened.embedding_dims, Some(256));

    let docs = engine.list_documents(&kb.id).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, doc.id);
    assert_eq!(docs[0].status, DocumentStatus::Ready);
    assert_eq!(docs[0].content_ref.as_deref(), Some("file:///srv/runbook.md"));

    let after = engine
        .query(&kb.id, "snapshots nightly", &keyword(3))
        .await
        .unwrap();
    let top = &after.results[0];
    assert_eq!(top.citation.chunk_id, before.results[0].citation.chunk_id);
    assert_eq!(top.citation.section_title.as_deref(), Some("Backups"));
    assert!(top.text.contains("Snapshots run nightly"));

    let semantic = engine
        .query(
            &kb.id,
            "drain the node before restarting",
            &QueryOptions {
                mode: Some(SearchMode::Semantic),
                top_k: Some(1),
                rerank: Some(RerankStrategy::PassThrough),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(semantic.results[0].text.contains("Drain the node"));
    engine.shutdown().await;
}

#[tokio::test]
async fn removed_documents_stay_removed_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let engine = KnowledgeEngine::open(config(&dir)).await.unwrap();
    let kb = engine
        .create_knowledge_base(NewKnowledgeBase {
            name: "notes".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let doc = engine
        .add_document(&kb.id, "todo.txt", "txt", b"Renew the TLS certificate.", None)
        .await
        .unwrap();
    engine
        .train_quiet(&kb.id, TrainingOptions::default())
        .await
        .unwrap();
    engine.remove_document(&kb.id, &doc.id).await.unwrap();
    engine.shutdown().await;

    let engine = KnowledgeEngine::open(config(&dir)).await.unwrap();
    assert!(engine.list_documents(&kb.id).await.unwrap().is_empty());
    let response = engine
        .query(&kb.id, "TLS certificate", &keyword(5))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    let status = engine.training_status(&kb.id).await.unwrap();
    assert!(!status.ready_for_query);
    engine.shutdown().await;
}
