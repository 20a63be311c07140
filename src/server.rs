//! HTTP API over the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET` | `/kb` | List knowledge bases |
//! | `POST` | `/kb` | Create a knowledge base |
//! | `GET` | `/kb/{id}` | Knowledge base configuration |
//! | `PATCH` | `/kb/{id}` | Update name, chunking, retrieval defaults or re-embed |
//! | `GET` | `/kb/{id}/documents` | List documents |
//! | `POST` | `/kb/{id}/documents` | Add a document (base64 content) |
//! | `DELETE` | `/kb/{id}/documents/{doc}` | Remove a document |
//! | `POST` | `/kb/{id}/train` | Start a training run |
//! | `POST` | `/kb/{id}/train/cancel` | Cancel the active run |
//! | `GET` | `/kb/{id}/status` | Per-document training status |
//! | `POST` | `/kb/{id}/query` | Ranked results with citations |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_parameter", "message": "top_k must be >= 1, got 0" } }
//! ```
//!
//! Codes come from [`EngineError::code`]; client errors map to 4xx, backend
//! and provider outages to 502/503.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use kb_engine_core::models::{
    Document, KnowledgeBaseConfig, QueryOptions, QueryResponse, TrainingOptions, TrainingStatus,
};
use kb_engine_core::EngineError;

use crate::engine::{KnowledgeBaseUpdate, KnowledgeEngine, NewKnowledgeBase};
use crate::progress::NoProgress;

type AppState = Arc<KnowledgeEngine>;

/// Build the router. Exposed separately from [`run_server`] for tests.
pub fn router(engine: Arc<KnowledgeEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/kb", get(handle_list_kbs).post(handle_create_kb))
        .route("/kb/{id}", get(handle_get_kb).patch(handle_update_kb))
        .route(
            "/kb/{id}/documents",
            get(handle_list_documents).post(handle_add_document),
        )
        .route("/kb/{id}/documents/{doc}", delete(handle_remove_document))
        .route("/kb/{id}/train", post(handle_train))
        .route("/kb/{id}/train/cancel", post(handle_cancel))
        .route("/kb/{id}/status", get(handle_status))
        .route("/kb/{id}/query", post(handle_query))
        .layer(cors)
        .with_state(engine)
}

/// Serve the API on `bind` until Ctrl-C, then shut the engine down.
pub async fn run_server(engine: Arc<KnowledgeEngine>, bind: &str) -> anyhow::Result<()> {
    let app = router(engine.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    println!("kbe server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    engine.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidParameter(_)
            | EngineError::UnsupportedFormat(_)
            | EngineError::CorruptSource(_)
            | EngineError::EmptyContent
            | EngineError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::ProviderFatal(_) => StatusCode::BAD_GATEWAY,
            EngineError::ProviderTransient(_) | EngineError::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(code = e.code(), error = %e, "request failed");
        }
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_parameter".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Knowledge bases ============

async fn handle_list_kbs(
    State(engine): State<AppState>,
) -> Result<Json<Vec<KnowledgeBaseConfig>>, AppError> {
    Ok(Json(engine.list_knowledge_bases().await?))
}

async fn handle_create_kb(
    State(engine): State<AppState>,
    Json(request): Json<NewKnowledgeBase>,
) -> Result<(StatusCode, Json<KnowledgeBaseConfig>), AppError> {
    let kb = engine.create_knowledge_base(request).await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn handle_get_kb(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeBaseConfig>, AppError> {
    Ok(Json(engine.knowledge_base(&id).await?))
}

async fn handle_update_kb(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<KnowledgeBaseUpdate>,
) -> Result<Json<KnowledgeBaseConfig>, AppError> {
    Ok(Json(engine.update_knowledge_base_config(&id, update).await?))
}

// ============ Documents ============

#[derive(Deserialize)]
struct AddDocumentRequest {
    name: String,
    /// Declared type: `pdf`, `docx`, `xlsx`, `markdown`, `html`, `plaintext` or a MIME type.
    #[serde(rename = "type")]
    declared_type: String,
    /// Raw bytes, base64 encoded.
    #[serde(default)]
    content_base64: Option<String>,
    /// UTF-8 content for text formats, instead of `content_base64`.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_ref: Option<String>,
}

async fn handle_list_documents(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Document>>, AppError> {
    Ok(Json(engine.list_documents(&id).await?))
}

async fn handle_add_document(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let bytes = match (&request.content_base64, &request.content) {
        (Some(encoded), None) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?,
        (None, Some(text)) => text.as_bytes().to_vec(),
        _ => {
            return Err(bad_request(
                "exactly one of content_base64 or content must be given",
            ))
        }
    };
    let doc = engine
        .add_document(
            &id,
            &request.name,
            &request.declared_type,
            &bytes,
            request.content_ref,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_remove_document(
    State(engine): State<AppState>,
    Path((id, doc)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    engine.remove_document(&id, &doc).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Training ============

#[derive(Serialize)]
struct TrainResponse {
    /// False when a run was already active.
    started: bool,
}

async fn handle_train(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<TrainingOptions>,
) -> Result<(StatusCode, Json<TrainResponse>), AppError> {
    let started = engine
        .start_training(&id, options, Arc::new(NoProgress))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TrainResponse { started })))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn handle_cancel(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let kb = engine.knowledge_base(&id).await?;
    Ok(Json(CancelResponse {
        cancelled: engine.cancel_training(&kb.id),
    }))
}

async fn handle_status(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TrainingStatus>, AppError> {
    Ok(Json(engine.training_status(&id).await?))
}

// ============ Query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(flatten)]
    options: QueryOptions,
}

async fn handle_query(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    Ok(Json(
        engine.query(&id, &request.query, &request.options).await?,
    ))
}
