//! HTTP API.
//!
//! Exposes sessions, uploads, questions and charts as a JSON API for the
//! browser front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner with the endpoint list |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`/`POST` | `/api/session` | Create a session |
//! | `GET`  | `/api/session/{id}` | Session record, merged schema and history |
//! | `POST` | `/api/upload` | Multipart upload: repeated `file` fields, optional `session_id` |
//! | `POST` | `/api/query` | `{ "session_id"?, "question" }` |
//! | `POST` | `/api/visualize` | `{ "session_id"?, "request" }` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_data_uploaded", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `no_data_uploaded` (400),
//! `upload_failed` (400), `session_not_found` (404),
//! `code_generation_failed` (500), `execution_failed` (500), `internal` (500).
//! Messages of 500 responses are generic; generated code and raw execution
//! errors only go to the log.
//!
//! # CORS
//!
//! Origins come from `[server].cors_origins`; `"*"` permits any origin.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::Config;
use crate::error::Error;
use crate::ingest::{ingest_files, IncomingFile, UploadReport};
use crate::models::ConversationTurn;
use crate::oracle::build_oracle;
use crate::pipeline::{oracle_context, Assistant, ChartAnswer, QueryAnswer};
use crate::session::SessionManager;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    assistant: Arc<Assistant>,
}

/// Starts the HTTP server.
///
/// Opens the database (running migrations), builds the configured oracle and
/// binds to `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let manager = Arc::new(SessionManager::open(config.clone()).await?);
    let oracle = build_oracle(&config.oracle)?;
    let assistant = Arc::new(Assistant::new(manager, oracle));

    let app = router(assistant);

    tracing::info!(bind = %bind_addr, oracle = %config.oracle.provider, "Server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router around an assistant.
pub fn router(assistant: Arc<Assistant>) -> Router {
    let config = assistant.manager().config();
    let cors = cors_layer(&config.server.cors_origins);
    let body_limit = config.storage.max_request_bytes;

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/session", get(handle_create_session).post(handle_create_session))
        .route("/api/session/{id}", get(handle_get_session))
        .route("/api/upload", post(handle_upload))
        .route("/api/query", post(handle_query))
        .route("/api/visualize", post(handle_visualize))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(AppState { assistant })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
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

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, message) = match &err {
            Error::NoDataUploaded
            | Error::UnsupportedFileFormat { .. }
            | Error::FileTooLarge { .. }
            | Error::ParseFailure { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
            Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
            Error::CodeGeneration(_) => {
                tracing::error!(error = %err, "Code generation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "The assistant could not produce an answer right now. Please try again.".to_string(),
                )
            }
            Error::Execution(_) => {
                tracing::error!(error = %err, "Generated code failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error processing request: the generated analysis could not be run.".to_string(),
                )
            }
            _ => {
                tracing::error!(error = %err, "Request failed");
                return AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal".to_string(),
                    message: "Internal server error".to_string(),
                };
            }
        };
        AppError {
            status,
            code: err.kind().to_string(),
            message,
        }
    }
}

// ============ GET / and /health ============

async fn handle_root() -> Json<Value> {
    Json(json!({
        "message": "Sheet Harness API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "session": "/api/session",
            "upload": "/api/upload",
            "query": "/api/query",
            "visualize": "/api/visualize",
        }
    }))
}

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionCreated {
    session_id: String,
}

async fn handle_create_session(State(state): State<AppState>) -> Result<Json<SessionCreated>, AppError> {
    let view = state.assistant.manager().create_session().await?;
    Ok(Json(SessionCreated {
        session_id: view.record.session_id,
    }))
}

#[derive(Serialize)]
struct FileSummary {
    id: String,
    filename: String,
    file_size: u64,
    uploaded_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SessionDetail {
    session_id: String,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    files: Vec<FileSummary>,
    tables: Vec<String>,
    schema: Value,
    history: Vec<ConversationTurn>,
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, AppError> {
    let manager = state.assistant.manager();
    let view = manager.get_session(&id).await?;
    let history = manager.history(&id).await?;

    Ok(Json(SessionDetail {
        tables: view.namespace.keys().map(str::to_string).collect(),
        schema: oracle_context(&view.namespace),
        files: view
            .record
            .uploaded_files
            .iter()
            .map(|f| FileSummary {
                id: f.id.clone(),
                filename: f.filename.clone(),
                file_size: f.file_size,
                uploaded_at: f.uploaded_at,
            })
            .collect(),
        session_id: view.record.session_id,
        created_at: view.record.created_at,
        last_accessed: view.record.last_accessed,
        history,
    }))
}

// ============ POST /api/upload ============

/// Accepts repeated `file` (or `files`) parts and an optional `session_id`
/// text part. Responds 400 only when no file was ingested.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReport>, AppError> {
    let mut session_id: Option<String> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "session_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("invalid session_id field: {}", e)))?;
                session_id = Some(text);
            }
            "file" | "files" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
                files.push(IncomingFile {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            other => tracing::debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    let report = ingest_files(state.assistant.manager(), session_id.as_deref(), files).await?;
    if report.all_failed() {
        return Err(AppError {
            status: StatusCode::BAD_REQUEST,
            code: "upload_failed".to_string(),
            message: report.message,
        });
    }
    Ok(Json(report))
}

// ============ POST /api/query and /api/visualize ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    session_id: Option<String>,
    question: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryAnswer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer = state
        .assistant
        .ask(req.session_id.as_deref(), req.question.trim())
        .await?;
    Ok(Json(answer))
}

#[derive(Deserialize)]
struct VisualizeRequest {
    #[serde(default)]
    session_id: Option<String>,
    request: String,
}

async fn handle_visualize(
    State(state): State<AppState>,
    Json(req): Json<VisualizeRequest>,
) -> Result<Json<ChartAnswer>, AppError> {
    if req.request.trim().is_empty() {
        return Err(bad_request("request must not be empty"));
    }
    let chart = state
        .assistant
        .visualize(req.session_id.as_deref(), req.request.trim())
        .await?;
    Ok(Json(chart))
}
