//! Loaded workflow definitions.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use jobflow_core::workflow::orchestrator::OrchestratorError;
use jobflow_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_at: String,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            start_at: def.start_at.clone(),
            steps: def.steps.len(),
            concurrency: def.concurrency,
        }
    }
}

/// GET /api/v1/workflows - Summaries of every loaded workflow.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<WorkflowSummary>>> {
    let timer = RequestTimer::start();
    let summaries = state
        .registry
        .list()
        .iter()
        .map(|def| WorkflowSummary::from(def.as_ref()))
        .collect();
    Json(timer.success(summaries).with_link("self", "/api/v1/workflows"))
}

/// GET /api/v1/workflows/{name} - A full definition.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state
        .registry
        .get(&name)
        .ok_or_else(|| OrchestratorError::UnknownWorkflow(name.clone()))?;
    Ok(Json(
        timer
            .success(def.as_ref().clone())
            .with_link("runs", &format!("/api/v1/runs?workflow={name}")),
    ))
}
