//! Durable checkpoint manager for workflow runs.
//!
//! Wraps `RunRepository` to record one snapshot plus one step log entry per
//! `advance`. A run is always persisted before the orchestrator sleeps or
//! moves on, so a restarted process resumes from the last recorded step.

use std::sync::Arc;

use chrono::Utc;
use jobflow_types::run::{StepLog, StepLogStatus, WorkflowRun};
use uuid::Uuid;

use crate::repository::run::RunRepository;

use super::engine::StepOutcome;

// ---------------------------------------------------------------------------
// StepAttempt
// ---------------------------------------------------------------------------

/// Where a run stood before an `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepAttempt {
    pub step: String,
    pub sequence: u64,
    pub attempt: u32,
}

impl StepAttempt {
    pub fn of(run: &WorkflowRun) -> Self {
        Self {
            step: run.current_step.clone(),
            sequence: run.step_counter,
            attempt: run.attempt,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run snapshots and the step log.
///
/// Generic over `R: RunRepository` so it works with any storage backend
/// (SQLite, in-memory).
pub struct CheckpointManager<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> Clone for CheckpointManager<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Store a freshly created run.
    pub async fn create(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.repo
            .create_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.id, "checkpointed new run");
        Ok(())
    }

    /// Overwrite the stored snapshot.
    pub async fn persist(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.repo
            .save_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Record the outcome of one `advance` call and persist the run.
    pub async fn record(
        &self,
        run: &WorkflowRun,
        before: StepAttempt,
        outcome: &StepOutcome,
    ) -> Result<(), CheckpointError> {
        let (status, detail) = describe(outcome);
        let log = StepLog {
            id: Uuid::now_v7(),
            run_id: run.id,
            step: before.step,
            sequence: before.sequence,
            attempt: before.attempt,
            status,
            detail: Some(detail),
            recorded_at: Utc::now(),
        };

        self.repo
            .append_step_log(&log)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        self.persist(run).await?;

        tracing::debug!(
            run_id = %run.id,
            step = %log.step,
            status = status.as_str(),
            "checkpointed step"
        );
        Ok(())
    }

    /// Load a stored run.
    pub async fn restore(&self, run_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Runs that were in progress when the process last stopped.
    pub async fn active_runs(&self) -> Result<Vec<WorkflowRun>, CheckpointError> {
        self.repo
            .list_active_runs()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

fn describe(outcome: &StepOutcome) -> (StepLogStatus, String) {
    match outcome {
        StepOutcome::Advanced { to, caught: false, .. } => {
            (StepLogStatus::Advanced, format!("advanced to {to}"))
        }
        StepOutcome::Advanced { to, caught: true, .. } => {
            (StepLogStatus::Caught, format!("failure caught, routed to {to}"))
        }
        StepOutcome::Waiting { resume_after, .. } => (
            StepLogStatus::Waiting,
            format!("retry in {}ms", resume_after.as_millis()),
        ),
        StepOutcome::Succeeded => (StepLogStatus::Succeeded, "run succeeded".to_string()),
        StepOutcome::Failed { kind, reason } => (StepLogStatus::Failed, format!("{kind}: {reason}")),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
