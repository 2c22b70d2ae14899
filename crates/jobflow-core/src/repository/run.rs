//! Run repository trait definition.
//!
//! Defines the storage interface for workflow runs and their step logs.
//! The infrastructure layer (jobflow-infra) implements this trait with
//! SQLite persistence; [`super::InMemoryRunRepository`] backs tests and
//! one-shot CLI runs.

use jobflow_types::error::RepositoryError;
use jobflow_types::run::{StepLog, WorkflowRun};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Runs are stored as whole snapshots; the engine is the only writer of a
/// given run, so last-write-wins is sufficient.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record. Fails with `Conflict` if the id exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the stored snapshot of an existing run.
    fn save_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// List every run that has not reached a terminal status.
    fn list_active_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Append one step attempt record.
    fn append_step_log(
        &self,
        log: &StepLog,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Step logs for a run, in recording order.
    fn list_step_logs(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepLog>, RepositoryError>> + Send;
}
