//! Run inspection and cancellation handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use jobflow_types::run::{StepLog, WorkflowRun};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Query parameters for listing runs.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Only runs of this workflow.
    pub workflow: Option<String>,
    /// Maximum number of runs to return (default 20).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

/// Upper bound on `limit` for one page.
const MAX_RUN_LIMIT: u32 = 500;

fn parse_run_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("'{raw}' is not a valid run id")))
}

/// GET /api/v1/runs - Recent runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let timer = RequestTimer::start();
    let runs = state
        .orchestrator
        .list_runs(query.workflow.as_deref(), query.limit.min(MAX_RUN_LIMIT))
        .await?;
    Ok(Json(timer.success(runs).with_link("self", "/api/v1/runs")))
}

/// GET /api/v1/runs/{id} - One run snapshot.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let timer = RequestTimer::start();
    let run_id = parse_run_id(&id)?;
    let run = state
        .orchestrator
        .get_run(run_id)
        .await?
        .ok_or(AppError::RunNotFound(id))?;

    Ok(Json(
        timer
            .success(run)
            .with_link("self", &format!("/api/v1/runs/{run_id}"))
            .with_link("logs", &format!("/api/v1/runs/{run_id}/logs")),
    ))
}

/// GET /api/v1/runs/{id}/logs - Step log of a run, in order.
pub async fn get_run_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<StepLog>>>, AppError> {
    let timer = RequestTimer::start();
    let run_id = parse_run_id(&id)?;
    if state.orchestrator.get_run(run_id).await?.is_none() {
        return Err(AppError::RunNotFound(id));
    }
    let logs = state.orchestrator.step_logs(run_id).await?;
    Ok(Json(
        timer
            .success(logs)
            .with_link("run", &format!("/api/v1/runs/{run_id}")),
    ))
}

/// POST /api/v1/runs/{id}/cancel - Request cancellation.
///
/// Takes effect at the run's next step boundary.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let timer = RequestTimer::start();
    let run_id = parse_run_id(&id)?;
    let requested = state.orchestrator.cancel(run_id).await?;
    if !requested && state.orchestrator.get_run(run_id).await?.is_none() {
        return Err(AppError::RunNotFound(id));
    }

    Ok(Json(timer.success(serde_json::json!({
        "run_id": run_id,
        "cancel_requested": requested,
    }))))
}
