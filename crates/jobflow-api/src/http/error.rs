//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use jobflow_core::workflow::engine::EngineError;
use jobflow_core::workflow::orchestrator::OrchestratorError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Orchestrator(OrchestratorError),
    /// No run with this id.
    RunNotFound(String),
    /// Malformed request.
    Validation(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Orchestrator(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Orchestrator(OrchestratorError::UnknownWorkflow(name)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow '{name}' is not loaded"),
            ),
            AppError::Orchestrator(e @ OrchestratorError::ConcurrencyLimitReached(_)) => {
                (StatusCode::TOO_MANY_REQUESTS, "CONCURRENCY_LIMIT", e.to_string())
            }
            AppError::Orchestrator(OrchestratorError::Engine(EngineError::InvalidRunData(msg))) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Orchestrator(OrchestratorError::Engine(e)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_DEFINITION", e.to_string())
            }
            AppError::Orchestrator(e @ OrchestratorError::Checkpoint(_)) => {
                tracing::error!(error = %e, "run storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string())
            }
            AppError::RunNotFound(id) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("Run {id} not found"),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}
