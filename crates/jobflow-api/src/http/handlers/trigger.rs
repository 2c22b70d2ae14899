//! The trigger boundary: `POST /api/v1/triggers` starts a run.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use jobflow_types::trigger::TriggerEvent;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TriggerAccepted {
    pub run_id: Uuid,
    pub workflow_name: String,
}

/// POST /api/v1/triggers - Start a run of the named workflow.
///
/// Answers `202 Accepted` once the run is persisted; the run itself
/// proceeds in the background.
pub async fn trigger(
    State(state): State<AppState>,
    body: Result<Json<TriggerEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<TriggerAccepted>>), AppError> {
    let timer = RequestTimer::start();
    let Json(event) = body.map_err(|e| AppError::Validation(e.body_text()))?;

    let workflow_name = event.workflow_name.clone();
    let run_id = state.orchestrator.submit(event).await?;
    tracing::info!(%run_id, workflow = %workflow_name, "trigger accepted");

    let resp = timer
        .success(TriggerAccepted {
            run_id,
            workflow_name,
        })
        .with_link("run", &format!("/api/v1/runs/{run_id}"))
        .with_link("logs", &format!("/api/v1/runs/{run_id}/logs"));

    Ok((StatusCode::ACCEPTED, Json(resp)))
}
