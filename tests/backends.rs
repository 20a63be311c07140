//! HTTP backends against mock servers: the OpenAI and Ollama embedding
//! providers, the vectorizer's retry path, and the Qdrant vector store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kb_engine::config::{EmbeddingConfig, QdrantConfig};
use kb_engine::embedding::{OllamaProvider, OpenAIProvider};
use kb_engine::qdrant::{point_id, QdrantStore};
use kb_engine::vectorizer::{RetryPolicy, Vectorizer};
use kb_engine_core::embedding::EmbeddingProvider;
use kb_engine_core::models::SearchFilter;
use kb_engine_core::store::{DistanceMetric, VectorMetadata, VectorRecord, VectorStore};
use kb_engine_core::EngineError;

fn ollama_config(url: &str) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        dims: Some(3),
        url: Some(url.to_string()),
        timeout_secs: 5,
        ..Default::default()
    }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn ollama_returns_one_vector_per_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "nomic-embed-text" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(&ollama_config(&server.uri())).unwrap();
    assert_eq!(provider.model_name(), "ollama:nomic-embed-text");
    let vectors = provider.embed(&texts(&["a", "b"])).await;
    assert_eq!(
        vectors,
        vec![Ok(vec![1.0, 0.0, 0.0]), Ok(vec![0.0, 1.0, 0.0])]
    );
}

#[tokio::test]
async fn ollama_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "input": ["busy"] })))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "input": ["bad"] })))
        .respond_with(ResponseTemplate::new(400).set_body_string("model not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "input": ["short"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [] })))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(&ollama_config(&server.uri())).unwrap();
    assert!(matches!(
        provider.embed(&texts(&["busy"])).await.as_slice(),
        [Err(EngineError::ProviderTransient(_))]
    ));
    assert!(matches!(
        provider.embed(&texts(&["bad"])).await.as_slice(),
        [Err(EngineError::ProviderFatal(_))]
    ));
    assert!(matches!(
        provider.embed(&texts(&["short"])).await.as_slice(),
        [Err(EngineError::ProviderFatal(_))]
    ));
}

#[tokio::test]
async fn openai_compatible_server_is_called_with_bearer_key() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "text-embedding-3-small", "input": ["a", "b"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: Some(2),
        url: Some(format!("{}/v1/", server.uri())),
        timeout_secs: 5,
        ..Default::default()
    };
    let provider = OpenAIProvider::new(&config).unwrap();
    assert_eq!(provider.model_name(), "openai:text-embedding-3-small");
    let vectors = provider.embed(&texts(&["a", "b"])).await;
    assert_eq!(vectors, vec![Ok(vec![1.0, 0.0]), Ok(vec![0.0, 1.0])]);
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn vectorizer_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.0, 0.0, 1.0]]
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let provider = Arc::new(OllamaProvider::new(&ollama_config(&server.uri())).unwrap());
    let vectorizer = Vectorizer::new(provider, None, 16, fast_retry(3));
    let out = vectorizer.vectorize(&texts(&["hello"])).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_ref().unwrap(), &vec![0.0, 0.0, 1.0]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn vectorizer_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let provider = Arc::new(OllamaProvider::new(&ollama_config(&server.uri())).unwrap());
    let vectorizer = Vectorizer::new(provider, None, 16, fast_retry(2));
    let out = vectorizer.vectorize(&texts(&["a", "b"])).await;
    assert_eq!(out.len(), 2);
    assert!(out
        .iter()
        .all(|r| matches!(r, Err(EngineError::ProviderTransient(_)))));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

fn qdrant(url: &str) -> QdrantStore {
    let config = QdrantConfig {
        url: url.to_string(),
        api_key_env: None,
        collection_prefix: "kb_".to_string(),
    };
    QdrantStore::new(&config, DistanceMetric::Cosine, Duration::from_secs(5)).unwrap()
}

fn record(chunk_id: &str, vector: Vec<f32>) -> VectorRecord {
    VectorRecord {
        chunk_id: chunk_id.to_string(),
        vector,
        metadata: VectorMetadata {
            document_id: "doc-1".to_string(),
            ordinal: 0,
            content_hash: "h".to_string(),
        },
    }
}

#[tokio::test]
async fn qdrant_creates_collection_on_first_upsert() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_k1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/collections/kb_k1"))
        .and(body_partial_json(json!({ "vectors": { "size": 3, "distance": "Cosine" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true, "status": "ok" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/collections/kb_k1/points"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "operation_id": 1, "status": "completed" },
            "status": "ok"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let store = qdrant(&server.uri());
    assert_eq!(store.backend_name(), "qdrant");
    store
        .upsert_batch("k1", &[record("c1", vec![1.0, 0.0, 0.0])])
        .await
        .unwrap();
    // size is remembered; the second upsert goes straight to the points
    store
        .upsert_batch("k1", &[record("c2", vec![0.0, 1.0, 0.0])])
        .await
        .unwrap();
}

#[tokio::test]
async fn qdrant_search_normalizes_scores_and_reads_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_k1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "config": { "params": { "vectors": { "size": 3, "distance": "Cosine" } } } },
            "status": "ok"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .and(body_partial_json(json!({
            "limit": 5,
            "filter": { "must": [ { "key": "document_id", "match": { "any": ["doc-1"] } } ] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [
                { "id": point_id("c2"), "score": 0.0, "payload": { "chunk_id": "c2", "document_id": "doc-1" } },
                { "id": point_id("c1"), "score": 1.0, "payload": { "chunk_id": "c1", "document_id": "doc-1" } },
                { "id": point_id("x"), "score": 0.9 }
            ],
            "status": "ok"
        })))
        .mount(&server)
        .await;

    let store = qdrant(&server.uri());
    let filter = SearchFilter {
        document_ids: Some(vec!["doc-1".to_string()]),
    };
    let hits = store.search("k1", &[1.0, 0.0, 0.0], 5, &filter).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk_id, "c1");
    assert!((hits[0].score - 1.0).abs() < 1e-9);
    assert_eq!(hits[1].chunk_id, "c2");
    assert!((hits[1].score - 0.5).abs() < 1e-9);

    let err = store
        .search("k1", &[1.0, 0.0], 5, &SearchFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DimensionMismatch {
            expected: 3,
            actual: 2
        }
    ));
}

#[tokio::test]
async fn qdrant_missing_collections_are_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_none"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/collections/kb_none"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_none/points/delete"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = qdrant(&server.uri());
    let hits = store
        .search("none", &[1.0, 0.0, 0.0], 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
    store.delete_document("none", "doc-1").await.unwrap();
    store.delete_all("none").await.unwrap();
}

#[tokio::test]
async fn qdrant_outages_are_backend_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_k1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
        .mount(&server)
        .await;
    let store = qdrant(&server.uri());
    let err = store
        .upsert_batch("k1", &[record("c1", vec![1.0, 0.0, 0.0])])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BackendUnavailable(_)));

    let unreachable = qdrant("http://127.0.0.1:1");
    let err = unreachable
        .search("k1", &[1.0], 1, &SearchFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BackendUnavailable(_)));
}
