//! HTTP surface for the question-answering core.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `GET`    | `/health` | Health check (version and active models) |
//! | `POST`   | `/notes/{note}/sources` | Ingest `{label, text}` into a note |
//! | `POST`   | `/notes/{note}/documents?label=..&format=..` | Ingest a raw document body (txt, md, pdf, docx) |
//! | `GET`    | `/notes/{note}/sources` | List the note's ingested sources |
//! | `POST`   | `/notes/{note}/chat` | Ask `{question}`; streams NDJSON [`StreamEvent`](crate::answer::StreamEvent)s |
//! | `POST`   | `/notes/{note}/materials` | Generate a [`StudyMaterial`] from `{text}` |
//! | `DELETE` | `/notes/{note}` | Drop the note's index |
//!
//! # Error Contract
//!
//! Non-streaming failures use one JSON shape:
//!
//! ```json
//! { "error": { "code": "extraction_failed", "message": "text extraction failed: PDF: ..." } }
//! ```
//!
//! Codes: `bad_request` / `empty_input` / `extraction_failed` (400),
//! `configuration_missing` / `embedding_unavailable` / `timeout` (503),
//! `generation_failed` / `storage` (500). Once a chat stream has started,
//! failures arrive as a terminal `error` event instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::RagError;
use crate::ingest::IngestOutcome;
use crate::materials::StudyMaterial;
use crate::models::{NoteId, SourceRecord};
use crate::rag::Rag;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    rag: Arc<Rag>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let rag = Arc::new(Rag::from_config(config).await?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("nbrag server listening on http://{}", bind_addr);
    tracing::info!(
        bind = %bind_addr,
        embedding = rag.embedder().model_name(),
        generation = rag.generator().model_name(),
        "server started"
    );

    axum::serve(listener, router(rag)).await?;
    Ok(())
}

/// Build the application router around an assembled [`Rag`].
pub fn router(rag: Arc<Rag>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/notes/{note}/sources",
            post(handle_ingest).get(handle_list_sources),
        )
        .route("/notes/{note}/documents", post(handle_ingest_document))
        .route("/notes/{note}/chat", post(handle_chat))
        .route("/notes/{note}/materials", post(handle_materials))
        .route("/notes/{note}", delete(handle_delete_note))
        .layer(cors)
        .with_state(AppState { rag })
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match err {
            RagError::EmptyInput | RagError::ExtractionFailed(_) => StatusCode::BAD_REQUEST,
            ref e if e.is_degraded() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(error = %err, "request degraded");
        } else if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    embedding: String,
    generation: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        embedding: state.rag.embedder().model_name().to_string(),
        generation: state.rag.generator().model_name().to_string(),
    })
}

// ============ Ingestion ============

#[derive(Deserialize)]
struct IngestRequest {
    label: String,
    text: String,
}

#[derive(Deserialize)]
struct DocumentParams {
    label: String,
    format: Option<String>,
}

#[derive(Serialize)]
struct IngestResponse {
    /// `ingested`, `empty`, or `degraded`.
    status: &'static str,
    passages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        let status = outcome.status();
        let passages = outcome.passages();
        let reason = match outcome {
            IngestOutcome::Degraded { reason } => Some(reason),
            _ => None,
        };
        IngestResponse {
            status,
            passages,
            reason,
        }
    }
}

/// Handler for `POST /notes/{note}/sources`.
async fn handle_ingest(
    State(state): State<AppState>,
    Path(note): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if req.label.trim().is_empty() {
        return Err(bad_request("label must not be empty"));
    }
    let outcome = state
        .rag
        .ingest(&NoteId::from(note), req.label.trim(), &req.text)
        .await?;
    Ok(Json(outcome.into()))
}

/// Handler for `POST /notes/{note}/documents`.
///
/// The format comes from `?format=`, falling back to the request's
/// `Content-Type` header.
async fn handle_ingest_document(
    State(state): State<AppState>,
    Path(note): Path<String>,
    Query(params): Query<DocumentParams>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    if params.label.trim().is_empty() {
        return Err(bad_request("label must not be empty"));
    }
    let format = params
        .format
        .or_else(|| {
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| bad_request("format query parameter or Content-Type header required"))?;

    let outcome = state
        .rag
        .ingest_document(
            &NoteId::from(note),
            params.label.trim(),
            body.to_vec(),
            &format,
        )
        .await?;
    Ok(Json(outcome.into()))
}

// ============ GET /notes/{note}/sources ============

#[derive(Serialize)]
struct SourcesResponse {
    note: NoteId,
    sources: Vec<SourceRecord>,
}

async fn handle_list_sources(
    State(state): State<AppState>,
    Path(note): Path<String>,
) -> Result<Json<SourcesResponse>, AppError> {
    let note = NoteId::from(note);
    let sources = state.rag.sources(&note).await?;
    Ok(Json(SourcesResponse { note, sources }))
}

// ============ POST /notes/{note}/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
}

/// Handler for `POST /notes/{note}/chat`.
///
/// Responds `200` with an `application/x-ndjson` body as soon as the answer
/// stream exists. When the client disconnects, axum drops the body, which
/// drops the [`AnswerStream`](crate::answer::AnswerStream) and cancels
/// generation.
async fn handle_chat(
    State(state): State<AppState>,
    Path(note): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let stream = state.rag.ask(&NoteId::from(note), &req.question).await;
    let body = Body::from_stream(stream.map(|event| event.to_ndjson_line()));

    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

// ============ POST /notes/{note}/materials ============

#[derive(Deserialize)]
struct MaterialsRequest {
    text: String,
}

/// Handler for `POST /notes/{note}/materials`.
///
/// Responds `503 configuration_missing` when no generation provider is set.
async fn handle_materials(
    State(state): State<AppState>,
    Path(note): Path<String>,
    Json(req): Json<MaterialsRequest>,
) -> Result<Json<StudyMaterial>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let material = state
        .rag
        .generate_materials(&NoteId::from(note), &req.text)
        .await?;
    Ok(Json(material))
}

// ============ DELETE /notes/{note} ============

#[derive(Serialize)]
struct DeleteResponse {
    note: NoteId,
    deleted: bool,
}

async fn handle_delete_note(
    State(state): State<AppState>,
    Path(note): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let note = NoteId::from(note);
    let deleted = state.rag.delete_note(&note).await?;
    Ok(Json(DeleteResponse { note, deleted }))
}
