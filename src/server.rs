//! HTTP API over the ingestion pipeline and the answerer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/projects/{id}/poll` | Ingest new commits, returns the poll report |
//! | `GET`  | `/projects/{id}/commits` | Commit log, newest first (`?limit=N`) |
//! | `POST` | `/projects/{id}/ask` | Answer a question as Server-Sent Events |
//! | `GET`  | `/projects/{id}/usage` | Questions asked in the last `?days=N` days |
//!
//! `/ask` emits one `references` event (JSON array), then `delta` events with
//! answer text, then either `done` or `error`. Closing the connection cancels
//! generation.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "precondition_failed", "message": "project p has no repository URL" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `precondition_failed` (412),
//! `auth_expired` (502), `upstream_error` (502), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{AnswerEvent, Answerer};
use crate::config::Config;
use crate::db;
use crate::error::{LoreError, UpstreamError};
use crate::ingest::{CommitPipeline, PollReport};
use crate::models::Commit;
use crate::project::{recent_usage, USAGE_WINDOW_DAYS};
use crate::store::{CommitLedger, ProjectStore, SqliteStore, UsageMeter};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<dyn ProjectStore>,
    pub ledger: Arc<dyn CommitLedger>,
    pub usage: Arc<dyn UsageMeter>,
    pub pipeline: Arc<CommitPipeline>,
    pub answerer: Arc<Answerer>,
}

impl AppState {
    pub fn from_config(config: &Config, store: Arc<SqliteStore>) -> anyhow::Result<Self> {
        Ok(Self {
            projects: store.clone(),
            ledger: store.clone(),
            usage: store.clone(),
            pipeline: Arc::new(CommitPipeline::from_config(config, store.clone())?),
            answerer: Arc::new(Answerer::from_config(config, store)?),
        })
    }
}

/// Builds the router with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/projects/{id}/poll", post(handle_poll))
        .route("/projects/{id}/commits", get(handle_commits))
        .route("/projects/{id}/ask", post(handle_ask))
        .route("/projects/{id}/usage", get(handle_usage))
        .layer(cors)
        .with_state(state)
}

/// Binds `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let app = router(AppState::from_config(config, store)?);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
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
        code: "bad_request",
        message: message.into(),
    }
}

impl From<LoreError> for AppError {
    fn from(err: LoreError) -> Self {
        let (status, code) = match &err {
            LoreError::ProjectNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            LoreError::MissingRepository(_) => {
                (StatusCode::PRECONDITION_FAILED, "precondition_failed")
            }
            LoreError::InvalidRepositoryUrl(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            LoreError::CommitListing(UpstreamError::AuthExpired { .. })
            | LoreError::Embedding(UpstreamError::AuthExpired { .. }) => {
                (StatusCode::BAD_GATEWAY, "auth_expired")
            }
            LoreError::CommitListing(_) | LoreError::Embedding(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            LoreError::DimensionMismatch { .. } | LoreError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /projects/{id}/poll ============

async fn handle_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollReport>, AppError> {
    let report = state.pipeline.poll_commits(&id).await?;
    Ok(Json(report))
}

// ============ GET /projects/{id}/commits ============

#[derive(Deserialize)]
struct CommitsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct CommitsResponse {
    project_id: String,
    commits: Vec<Commit>,
}

async fn handle_commits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CommitsQuery>,
) -> Result<Json<CommitsResponse>, AppError> {
    if state.projects.get_project(&id).await?.is_none() {
        return Err(LoreError::ProjectNotFound(id).into());
    }
    let commits = state.ledger.list_commits(&id, query.limit).await?;
    Ok(Json(CommitsResponse {
        project_id: id,
        commits,
    }))
}

// ============ POST /projects/{id}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let answer = state.answerer.ask_question(question, &id).await?;

    let references = Event::default()
        .event("references")
        .json_data(&answer.references)
        .map_err(|e| AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: e.to_string(),
        })?;

    let events = stream::once(async move { references })
        .chain(answer.output.map(sse_event))
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: AnswerEvent) -> Event {
    // SSE cannot carry bare carriage returns.
    match event {
        AnswerEvent::Delta(text) => Event::default().event("delta").data(text.replace('\r', "")),
        AnswerEvent::Done => Event::default().event("done").data(""),
        AnswerEvent::Failed(message) => Event::default()
            .event("error")
            .data(message.replace('\r', "")),
    }
}

// ============ GET /projects/{id}/usage ============

#[derive(Deserialize)]
struct UsageQuery {
    days: Option<i64>,
}

#[derive(Serialize)]
struct UsageResponse {
    project_id: String,
    days: i64,
    api_requests: i64,
}

async fn handle_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageResponse>, AppError> {
    let days = query.days.unwrap_or(USAGE_WINDOW_DAYS);
    if days <= 0 {
        return Err(bad_request("days must be > 0"));
    }
    let api_requests = recent_usage(state.usage.as_ref(), &id, days).await?;
    Ok(Json(UsageResponse {
        project_id: id,
        days,
        api_requests,
    }))
}
