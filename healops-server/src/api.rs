//! HTTP API: ingestion, human actions, queries, and service endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::ingest::{IngestError, IngestRequest};
use crate::model::{Attempt, Run, RunEvent, RunId, RunStatus};
use crate::orchestrator::{ActionError, HumanAction};
use crate::repository::{RepositoryError, RunFilter};
use crate::stream::stream_handler;
use crate::AppState;

/// Signature header for webhook ingestion.
pub const SIGNATURE_HEADER: &str = "x-healops-signature";

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
const EVENT_FETCH_LIMIT: usize = 500;

// =============================================================================
// Errors
// =============================================================================

/// Structured error responses for the HTTP surface.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Unavailable(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Disabled => Self::Unavailable(e.to_string()),
            IngestError::InvalidSignature => Self::Unauthorized(e.to_string()),
            IngestError::Repository(_) | IngestError::Queue(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::UnknownRun(_) => Self::NotFound(e.to_string()),
            ActionError::GitHub(_) => Self::Upstream(e.to_string()),
            ActionError::Repository(_) => Self::Internal(e.to_string()),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/help", get(help_handler))
        .route("/webhooks/ci", post(ingest_handler))
        .route("/runs", get(list_runs_handler))
        .route("/runs/{id}", get(run_detail_handler))
        .route("/runs/{id}/insights", get(insights_handler))
        .route("/runs/{id}/actions/{action}", post(action_handler))
        .route("/metrics/summary", get(summary_handler))
        .route("/metrics/repositories", get(repo_metrics_handler))
        .route("/stream", get(stream_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// =============================================================================
// Service endpoints
// =============================================================================

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "healops",
    }))
}

async fn help_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "healops",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Automated recovery from CI pipeline failures",
        "endpoints": [
            { "path": "/health", "method": "GET", "description": "Health check" },
            { "path": "/help", "method": "GET", "description": "API documentation" },
            { "path": "/webhooks/ci", "method": "POST",
              "description": "CI failure webhook ingestion",
              "authentication": "x-healops-signature header when a secret is configured" },
            { "path": "/runs", "method": "GET",
              "description": "List runs (status/repository filters, paginated)" },
            { "path": "/runs/{id}", "method": "GET",
              "description": "Run detail with attempts and events" },
            { "path": "/runs/{id}/insights", "method": "GET",
              "description": "Per-attempt engine and similar-fix insights" },
            { "path": "/runs/{id}/actions/{action}", "method": "POST",
              "description": "Human action: approve, deny, abort, human-fix" },
            { "path": "/metrics/summary", "method": "GET",
              "description": "Aggregate run counts and process counters" },
            { "path": "/metrics/repositories", "method": "GET",
              "description": "Per-repository metrics" },
            { "path": "/stream", "method": "GET",
              "description": "Live event stream (SSE), optional runId filter" },
        ],
        "features": {
            "enabled": state.config.enabled,
            "maxAttempts": state.config.max_attempts,
            "safeMode": state.config.safe_mode,
            "workflowEngine": state.config.workflow_engine,
            "githubIntegration": state.config.github_enabled && state.config.github_token.is_some(),
            "containerValidation": state.config.validation_command.is_some(),
            "aiProvider": state.config.ai_provider.as_str(),
        },
        "configuration": {
            "required_env_vars": [],
            "optional_env_vars": [
                "HEALOPS_ENABLED", "HEALOPS_MAX_ATTEMPTS", "HEALOPS_SAFE_MODE",
                "HEALOPS_WORKFLOW_ENGINE", "HEALOPS_WEBHOOK_SECRET",
                "HEALOPS_CHAT_WEBHOOK_URL", "HEALOPS_AI_PROVIDER", "HEALOPS_AI_MODEL",
                "ANTHROPIC_API_KEY", "OPENAI_API_KEY", "HEALOPS_GITHUB_ENABLED",
                "GITHUB_TOKEN", "HEALOPS_BASE_BRANCH", "HEALOPS_VALIDATION_REQUIRED",
                "HEALOPS_VALIDATION_COMMAND", "HEALOPS_VALIDATION_TIMEOUT_SECS",
                "HEALOPS_VALIDATION_WORKDIR", "PORT", "STATE_DIR",
            ],
        },
    }))
}

// =============================================================================
// Ingestion
// =============================================================================

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: IngestRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook body: {e}")))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let response = state.ingestor.ingest(request, signature).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

// =============================================================================
// Human actions
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ActionRequest {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionResponse {
    run: Run,
    message: String,
}

async fn action_handler(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ApiError> {
    let action = HumanAction::parse(&action)
        .ok_or_else(|| ApiError::BadRequest(format!("unsupported action '{action}'")))?;

    // The note body is optional; an empty body means no note.
    let request: ActionRequest = if body.is_empty() {
        ActionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid action body: {e}")))?
    };

    let run = state
        .orchestrator
        .handle_action(&RunId::from(id.as_str()), action, request.note)
        .await?;

    Ok(Json(ActionResponse {
        message: format!("run {} applied", action.as_str()),
        run,
    }))
}

// =============================================================================
// Queries
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    status: Option<String>,
    repository: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunListResponse {
    runs: Vec<Run>,
    total: usize,
    page: usize,
    per_page: usize,
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<RunListResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            RunStatus::parse(s).ok_or_else(|| ApiError::BadRequest(format!("unknown status '{s}'")))
        })
        .transpose()?;

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params
        .per_page
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let result = state
        .repository
        .list_runs(&RunFilter {
            status,
            repository: params.repository,
            offset: (page - 1) * per_page,
            limit: per_page,
        })
        .await?;

    Ok(Json(RunListResponse {
        runs: result.runs,
        total: result.total,
        page,
        per_page,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunDetailResponse {
    run: Run,
    attempts: Vec<Attempt>,
    events: Vec<RunEvent>,
}

async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let run_id = RunId::from(id.as_str());
    let run = state
        .repository
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown run {id}")))?;

    let attempts = state.repository.attempts_for_run(&run_id).await?;
    let events = state
        .repository
        .events_for_run(&run_id, EVENT_FETCH_LIMIT)
        .await?;

    Ok(Json(RunDetailResponse {
        run,
        attempts,
        events,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttemptInsight {
    attempt_no: u32,
    status: String,
    engine: Option<String>,
    similar_fixes: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsightsResponse {
    run_id: RunId,
    attempts: Vec<AttemptInsight>,
}

/// Per-attempt memory insights: which engine ran the attempt, and the
/// similarity matches recorded in its reasoning-trace event.
async fn insights_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let run_id = RunId::from(id.as_str());
    if state.repository.get_run(&run_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown run {id}")));
    }

    let attempts = state.repository.attempts_for_run(&run_id).await?;
    let events = state
        .repository
        .events_for_run(&run_id, EVENT_FETCH_LIMIT)
        .await?;

    let insights = attempts
        .into_iter()
        .map(|attempt| {
            let similar_fixes = events
                .iter()
                .find(|event| {
                    event.event_type == "attempt.thinking"
                        && event.payload.get("attempt").and_then(|v| v.as_u64())
                            == Some(u64::from(attempt.attempt_no))
                })
                .and_then(|event| event.payload.get("similarFixes").cloned())
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));

            AttemptInsight {
                attempt_no: attempt.attempt_no,
                status: attempt.status.as_str().to_string(),
                engine: attempt.engine,
                similar_fixes,
            }
        })
        .collect();

    Ok(Json(InsightsResponse {
        run_id,
        attempts: insights,
    }))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state.repository.summary_counts().await?;
    Ok(Json(json!({
        "counts": counts,
        "counters": state.metrics.snapshot(),
    })))
}

async fn repo_metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repositories = state.repository.repository_metrics().await?;
    Ok(Json(json!({ "repositories": repositories })))
}
