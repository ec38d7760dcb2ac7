//! HTTP API.
//!
//! A thin JSON layer over the library, meant for a browser front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/process-url` | Crawl and index a site, wait for completion |
//! | `POST`   | `/load-url` | Same, in the background (202 + session id) |
//! | `POST`   | `/ask` | Ask a question in a ready session |
//! | `GET`    | `/sessions` | Recent sessions, newest first |
//! | `GET`    | `/session/{id}` | Session details with conversation |
//! | `GET`    | `/session/{id}/status` | Processing status only |
//! | `DELETE` | `/session/{id}` | Delete a session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Session not found." },
//!   "detail": "Session not found." }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a front end served
//! from anywhere can call the API.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::ingest::{self, IngestError, ProcessOptions};
use crate::llm;
use crate::migrate;
use crate::models::{SessionStatus, SessionSummary};
use crate::progress::NoProgress;
use crate::rag::{self, AskError};
use crate::session::{self, SessionDetails, SessionError};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
}

/// Build the router with all routes and CORS.
pub fn app(config: Arc<Config>, pool: SqlitePool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/process-url", post(handle_process_url))
        .route("/load-url", post(handle_load_url))
        .route("/ask", post(handle_ask))
        .route("/sessions", get(handle_sessions))
        .route(
            "/session/{id}",
            get(handle_session).delete(handle_delete_session),
        )
        .route("/session/{id}/status", get(handle_status))
        .layer(cors)
        .with_state(AppState { config, pool })
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    if config.llm.is_enabled() {
        let provider = llm::create_chat_provider(&config.llm)?;
        info!(provider = provider.name(), model = provider.model(), "chat model");
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let bind_addr = config.server.bind.clone();
    let router = app(Arc::new(config.clone()), pool);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    /// Same text as `error.message`, for clients that read a flat `detail`.
    detail: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message.clone(),
            },
            detail: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

/// Map library errors onto HTTP statuses by their type.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<SessionError>() {
            return match e {
                SessionError::NotFound(_) => not_found(e.to_string()),
                SessionError::NotReady { .. } => AppError {
                    status: StatusCode::CONFLICT,
                    code: "not_ready",
                    message: e.to_string(),
                },
            };
        }
        if let Some(e) = err.downcast_ref::<AskError>() {
            return bad_request(e.to_string());
        }
        if let Some(e) = err.downcast_ref::<IngestError>() {
            return bad_request(e.to_string());
        }

        error!(error = %err, "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

/// `Json` extractor whose rejections use the JSON error body.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(bad_request(rejection.body_text())),
        }
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

// ============ POST /process-url, /load-url ============

#[derive(Deserialize)]
struct ProcessRequest {
    url: String,
    #[serde(default)]
    refresh: bool,
}

#[derive(Serialize)]
struct ProcessResponse {
    message: String,
    session_id: String,
    title: String,
}

async fn handle_process_url(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ProcessRequest>,
) -> Result<Json<ProcessResponse>, AppError> {
    let outcome = ingest::process_url(
        &state.config,
        &state.pool,
        &req.url,
        ProcessOptions {
            refresh: req.refresh,
        },
        &NoProgress,
    )
    .await?;

    Ok(Json(ProcessResponse {
        message: "Site crawled successfully.".to_string(),
        session_id: outcome.session_id,
        title: outcome.title,
    }))
}

#[derive(Serialize)]
struct LoadResponse {
    session_id: String,
    status: SessionStatus,
}

async fn handle_load_url(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ProcessRequest>,
) -> Result<(StatusCode, Json<LoadResponse>), AppError> {
    let session_id = ingest::spawn_process_url(
        state.config.clone(),
        state.pool.clone(),
        &req.url,
        ProcessOptions {
            refresh: req.refresh,
        },
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(LoadResponse {
            session_id,
            status: SessionStatus::Crawling,
        }),
    ))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    session_id: String,
    question: String,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
    sources: Vec<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let answer =
        rag::answer_question(&state.config, &state.pool, &req.session_id, &req.question).await?;

    Ok(Json(AskResponse {
        answer: answer.answer,
        sources: answer.sources,
    }))
}

// ============ Sessions ============

async fn handle_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    Ok(Json(
        session::list_sessions(&state.pool, session::LIST_LIMIT).await?,
    ))
}

async fn handle_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetails>, AppError> {
    Ok(Json(session::session_details(&state.pool, &id).await?))
}

#[derive(Serialize)]
struct StatusResponse {
    session_id: String,
    status: SessionStatus,
    error: Option<String>,
    page_count: i64,
    chunk_count: i64,
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let s = session::require_session(&state.pool, &id).await?;
    Ok(Json(StatusResponse {
        session_id: s.session_id,
        status: s.status,
        error: s.error,
        page_count: s.page_count,
        chunk_count: s.chunk_count,
    }))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if session::delete_session(&state.pool, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(SessionError::NotFound(id).to_string()))
    }
}
