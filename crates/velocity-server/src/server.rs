//! Router, handlers, and serving loop.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use velocity_core::model::JobState;
use velocity_core::{
    AnalyzeWorker, Decision, JobStore, ParseWorker, ProcessingStage, TickOutcome,
};

use crate::config::ServerConfig;

const HEALTHZ_PATH: &str = "/v1/healthz";
const PARSE_TICK_PATH: &str = "/v1/pipeline/parse";
const ANALYZE_TICK_PATH: &str = "/v1/pipeline/analyze";
const JOBS_PATH: &str = "/v1/jobs";
const JOBS_LIMIT_MAX: usize = 200;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Shared handler state: the two workers plus the job store for queries.
#[derive(Clone)]
pub struct AppState {
    pub parse: Arc<ParseWorker>,
    pub analyze: Arc<AnalyzeWorker>,
    pub jobs: Arc<dyn JobStore>,
    pub bearer_token: Option<String>,
}

/// Tick response contract consumed by the external scheduler.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TickResponse {
    processed: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<TickOutcome> for TickResponse {
    fn from(outcome: TickOutcome) -> Self {
        Self {
            processed: outcome.processed(),
            job_id: outcome.job_id().map(str::to_string),
            error: outcome.error().map(str::to_string),
        }
    }
}

/// Read-only job summary for the dashboard's tracking view. The extracted
/// text and full artifacts stay out of the listing payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary {
    id: String,
    stage: ProcessingStage,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    stage: ProcessingStage,
    #[serde(default = "default_jobs_limit")]
    limit: usize,
}

fn default_jobs_limit() -> usize {
    50
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(PARSE_TICK_PATH, post(tick_parse))
        .route(ANALYZE_TICK_PATH, post(tick_analyze))
        .route(JOBS_PATH, get(list_jobs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<(), ServerError> {
    let app = build_router(state);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
    tracing::info!(addr = %config.bind_addr, "Velocity server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown requested");
    }
}

async fn healthz() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn tick_parse(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.parse.process_one().await {
        Ok(outcome) => Json(TickResponse::from(outcome)).into_response(),
        Err(e) => infrastructure_error("parse tick failed", &e),
    }
}

async fn tick_analyze(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.analyze.process_one().await {
        Ok(outcome) => Json(TickResponse::from(outcome)).into_response(),
        Err(e) => infrastructure_error("analyze tick failed", &e),
    }
}

async fn list_jobs(State(state): State<AppState>, Query(query): Query<JobsQuery>) -> Response {
    let limit = query.limit.min(JOBS_LIMIT_MAX);
    match state.jobs.list_stage(query.stage, limit).await {
        Ok(jobs) => {
            let summaries: Vec<JobSummary> = jobs.iter().map(summarize).collect();
            Json(summaries).into_response()
        }
        Err(e) => infrastructure_error("job listing failed", &e),
    }
}

fn summarize(job: &velocity_core::JobRecord) -> JobSummary {
    let (decision, error) = match &job.state {
        JobState::AiCompleted {
            decision, error, ..
        } => (Some(*decision), error.clone()),
        JobState::ParsingFailed { error, .. } => (None, Some(error.clone())),
        _ => (None, None),
    };
    JobSummary {
        id: job.id.clone(),
        stage: job.stage(),
        updated_at: job.updated_at,
        decision,
        error,
    }
}

/// `None` when the request may proceed, otherwise the 401 response.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(expected) = &state.bearer_token else {
        return None;
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        return None;
    }
    Some(
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response(),
    )
}

fn infrastructure_error(context: &str, error: &dyn std::error::Error) -> Response {
    tracing::error!(error = %error, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{context}: {error}") })),
    )
        .into_response()
}
