//! HTTP API for session-scoped document Q&A.
//!
//! Exposes the [`QueryOrchestrator`] operations as a JSON API. Every route
//! below `/sessions/{id}` works on exactly one session; requests for
//! different sessions never share state.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/models` | Model catalog |
//! | `POST` | `/sessions` | Create a session |
//! | `GET`  | `/sessions/{id}` | Session status |
//! | `POST` | `/sessions/{id}/documents` | Upload and ingest documents |
//! | `POST` | `/sessions/{id}/query` | Ask a question |
//! | `POST` | `/sessions/{id}/reset` | Drop all documents and vectors |
//! | `DELETE` | `/sessions/{id}` | Delete the session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "session_not_ready", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unknown_model` (400), `not_found` (404),
//! `session_not_ready` (409), `empty_index` (409), `cancelled` (409),
//! `no_usable_documents` (422), `rate_limited` (429), `internal` (500),
//! `upstream` (502), `upstream_auth` (502), `timeout` (504).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{EmbedError, GenerationError, IngestError, QueryError, RetrievalError, SessionError};
use crate::generation::ModelId;
use crate::models::{SessionId, SessionState, SessionStatus};
use crate::orchestrator::QueryOrchestrator;

/// Upload bodies carry base64 documents; allow up to 64 MiB per request.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<QueryOrchestrator>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let orchestrator = Arc::new(QueryOrchestrator::from_config(config.clone())?);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Session RAG server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, root = %config.storage.root.display(), "server started");

    axum::serve(listener, router(orchestrator)).await?;
    Ok(())
}

/// Build the router around an existing orchestrator.
pub fn router(orchestrator: Arc<QueryOrchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/models", get(handle_models))
        .route("/sessions", post(handle_create_session))
        .route(
            "/sessions/{id}",
            get(handle_session_status).delete(handle_destroy),
        )
        .route("/sessions/{id}/documents", post(handle_ingest))
        .route("/sessions/{id}/query", post(handle_query))
        .route("/sessions/{id}/reset", post(handle_reset))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(AppState { orchestrator })
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
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::InvalidId(_) | SessionError::InvalidFileName(_) => {
                bad_request(err.to_string())
            }
            SessionError::NotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            SessionError::Cleanup { .. } | SessionError::State { .. } | SessionError::Io(_) => {
                internal(err.to_string())
            }
        }
    }
}

impl From<EmbedError> for AppError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::ProviderUnavailable(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream", err.to_string())
            }
            EmbedError::DimensionMismatch { .. } => internal(err.to_string()),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        let (status, code) = match err {
            GenerationError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            GenerationError::AuthFailure(_) => (StatusCode::BAD_GATEWAY, "upstream_auth"),
            GenerationError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            GenerationError::UnknownModel(_) => (StatusCode::BAD_REQUEST, "unknown_model"),
            GenerationError::NetworkError(_) | GenerationError::InvalidResponse(_) => {
                (StatusCode::BAD_GATEWAY, "upstream")
            }
        };
        AppError::new(status, code, err.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::NoUsableDocuments => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "no_usable_documents",
                err.to_string(),
            ),
            IngestError::Cancelled => {
                AppError::new(StatusCode::CONFLICT, "cancelled", err.to_string())
            }
            IngestError::Session(e) => e.into(),
            IngestError::Embedding(e) => e.into(),
            other => internal(other.to_string()),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::EmptyQuery => bad_request(err.to_string()),
            QueryError::Retrieval(RetrievalError::SessionNotReady { .. }) => {
                AppError::new(StatusCode::CONFLICT, "session_not_ready", err.to_string())
            }
            QueryError::Retrieval(RetrievalError::EmptyIndex) => {
                AppError::new(StatusCode::CONFLICT, "empty_index", err.to_string())
            }
            QueryError::Retrieval(RetrievalError::Embedding(e)) => e.into(),
            QueryError::Retrieval(RetrievalError::Store(msg)) => internal(msg),
            QueryError::Generation(e) => e.into(),
            QueryError::Session(e) => e.into(),
        }
    }
}

fn parse_id(raw: &str) -> Result<SessionId, AppError> {
    raw.parse::<SessionId>().map_err(AppError::from)
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

// ============ GET /models ============

#[derive(Serialize)]
struct ModelInfo {
    id: &'static str,
    label: &'static str,
    default: bool,
}

#[derive(Serialize)]
struct ModelListResponse {
    models: Vec<ModelInfo>,
}

async fn handle_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let default = &state.orchestrator.config().generation.default_model;
    let models = ModelId::all()
        .iter()
        .map(|m| ModelInfo {
            id: m.as_str(),
            label: m.label(),
            default: m.as_str() == default,
        })
        .collect();
    Json(ModelListResponse { models })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionResponse {
    id: SessionId,
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl From<SessionStatus> for SessionResponse {
    fn from(status: SessionStatus) -> Self {
        Self {
            id: status.id,
            state: status.state,
            last_error: status.last_error,
        }
    }
}

async fn handle_create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let status = state.orchestrator.create_session()?;
    Ok((StatusCode::CREATED, Json(status.into())))
}

async fn handle_session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.session_status(&id)?.into()))
}

async fn handle_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.reset(&id).await?.into()))
}

async fn handle_destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    state.orchestrator.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /sessions/{id}/documents ============

#[derive(Deserialize)]
struct UploadFile {
    name: String,
    content_base64: String,
}

#[derive(Deserialize)]
struct IngestRequest {
    files: Vec<UploadFile>,
}

#[derive(Serialize)]
struct IngestResponse {
    session_id: SessionId,
    state: SessionState,
    documents: usize,
    chunks: usize,
    new_chunks: usize,
    collection_size: usize,
    warnings: Vec<String>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let id = parse_id(&id)?;
    if req.files.is_empty() {
        return Err(bad_request("files must not be empty"));
    }

    let mut files = Vec::with_capacity(req.files.len());
    for f in req.files {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(f.content_base64.trim())
            .map_err(|e| bad_request(format!("{}: invalid base64: {}", f.name, e)))?;
        files.push((f.name, bytes));
    }

    let summary = state.orchestrator.ingest_uploads(&id, files).await?;
    Ok(Json(IngestResponse {
        session_id: summary.session_id,
        state: SessionState::Ready,
        documents: summary.documents,
        chunks: summary.chunks,
        new_chunks: summary.new_chunks,
        collection_size: summary.collection_size,
        warnings: summary.warnings.iter().map(|w| w.to_string()).collect(),
    }))
}

// ============ POST /sessions/{id}/query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    with_sources: bool,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let model = req
        .model
        .as_deref()
        .map(str::parse::<ModelId>)
        .transpose()?;
    if req.top_k == Some(0) {
        return Err(bad_request("top_k must be >= 1"));
    }

    if req.with_sources {
        let answer = state
            .orchestrator
            .query_with_sources(&id, &req.query, model, req.top_k)
            .await?;
        Ok(Json(answer).into_response())
    } else {
        let answer = state.orchestrator.query(&id, &req.query, model).await?;
        Ok(Json(answer).into_response())
    }
}
