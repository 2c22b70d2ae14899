//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `jobflow-core` using sqlx with split
//! read/write pools. Each run is stored as a JSON snapshot alongside a few
//! denormalized columns for listing and recovery. Step logs are append-only.

use chrono::{DateTime, Utc};
use jobflow_core::repository::run::RunRepository;
use jobflow_types::error::RepositoryError;
use jobflow_types::run::{RunStatus, StepLog, StepLogStatus, WorkflowRun};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    snapshot: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        serde_json::from_str(&self.snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid run snapshot JSON: {e}")))
    }
}

struct StepLogRow {
    id: String,
    run_id: String,
    step: String,
    sequence: i64,
    attempt: i64,
    status: String,
    detail: Option<String>,
    recorded_at: String,
}

impl StepLogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step: row.try_get("step")?,
            sequence: row.try_get("sequence")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            detail: row.try_get("detail")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_step_log(self) -> Result<StepLog, RepositoryError> {
        let status: StepLogStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(StepLog {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step: self.step,
            sequence: self.sequence as u64,
            attempt: self.attempt as u32,
            status,
            detail: self.detail,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn snapshot_json(run: &WorkflowRun) -> Result<String, RepositoryError> {
    serde_json::to_string(run).map_err(|e| RepositoryError::Query(format!("serialize run: {e}")))
}

fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!(error = %e, "sqlite connection error");
            RepositoryError::Connection
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn rows_to_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRun>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        runs.push(r.into_run()?);
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let snapshot = snapshot_json(run)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_name, workflow_version, status, current_step, callback_token,
                snapshot, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(run.status.as_str())
        .bind(&run.current_step)
        .bind(run.callback_token.as_ref().map(|t| t.as_str()))
        .bind(&snapshot)
        .bind(format_datetime(&run.started_at))
        .bind(&now)
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let snapshot = snapshot_json(run)?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, current_step = ?, snapshot = ?, updated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(run.status.as_str())
        .bind(&run.current_step)
        .bind(&snapshot)
        .bind(&now)
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT snapshot FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        // UUIDv7 ids sort by creation time.
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT snapshot FROM workflow_runs WHERE workflow_name = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(name)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT snapshot FROM workflow_runs ORDER BY id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(map_sqlx)?;

        rows_to_runs(&rows)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT snapshot FROM workflow_runs WHERE status IN (?, ?) ORDER BY id ASC",
        )
        .bind(RunStatus::Pending.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows_to_runs(&rows)
    }

    async fn append_step_log(&self, log: &StepLog) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_step_logs
               (id, run_id, step, sequence, attempt, status, detail, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(log.id.to_string())
        .bind(log.run_id.to_string())
        .bind(&log.step)
        .bind(log.sequence as i64)
        .bind(i64::from(log.attempt))
        .bind(log.status.as_str())
        .bind(&log.detail)
        .bind(format_datetime(&log.recorded_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn list_step_logs(&self, run_id: &Uuid) -> Result<Vec<StepLog>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, step, sequence, attempt, status, detail, recorded_at
               FROM workflow_step_logs WHERE run_id = ? ORDER BY id ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepLogRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            logs.push(r.into_step_log()?);
        }
        Ok(logs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
