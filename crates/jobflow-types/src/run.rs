//! Workflow run state.
//!
//! A `WorkflowRun` captures one execution's mutable progress: where it is,
//! what it has accumulated, and how it ended. It is mutated only by the
//! engine and persisted as a snapshot after every step.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run_data::RunData;

// ---------------------------------------------------------------------------
// Status and failure taxonomy
// ---------------------------------------------------------------------------

/// Observable lifecycle of a run.
///
/// `Pending -> Running -> {Succeeded, Failed}`. Waiting between polls is an
/// internal sub-state of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Why a run (or a step) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidDefinition,
    MissingField,
    ClientError,
    JobFailure,
    ExhaustedRetries,
    Cancelled,
    /// Reached a `fail` step.
    FailStep,
    /// The run could not be checkpointed.
    StorageError,
}

impl FailureKind {
    /// Whether a step-level `catch` may intercept this failure.
    pub fn catchable(&self) -> bool {
        matches!(
            self,
            FailureKind::MissingField
                | FailureKind::ClientError
                | FailureKind::JobFailure
                | FailureKind::ExhaustedRetries
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidDefinition => "invalid_definition",
            FailureKind::MissingField => "missing_field",
            FailureKind::ClientError => "client_error",
            FailureKind::JobFailure => "job_failure",
            FailureKind::ExhaustedRetries => "exhausted_retries",
            FailureKind::Cancelled => "cancelled",
            FailureKind::FailStep => "fail_step",
            FailureKind::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure details recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Human-readable reason delivered to the callback.
    pub reason: String,
    /// Step at which the failure occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Opaque continuation identifier for routing a terminal result back to
/// whatever started the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(pub String);

impl CallbackToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: RunStatus,
    /// Step the run is positioned at (the last step reached once terminal).
    pub current_step: String,
    /// Number of step transitions taken. Never decreases.
    pub step_counter: u64,
    /// Retries taken at the current step.
    #[serde(default)]
    pub attempt: u32,
    /// Consecutive client errors at the current step.
    #[serde(default)]
    pub client_errors: u32,
    /// When the run entered the current step.
    pub step_entered_at: DateTime<Utc>,
    /// Times each step has been entered.
    #[serde(default)]
    pub visits: HashMap<String, u32>,
    pub data: RunData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<CallbackToken>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set just before a job start is dispatched and cleared once it returns.
    #[serde(default)]
    pub start_in_flight: bool,
    /// Earliest time the current step may be re-invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Outputs delivered on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
    /// Whether the terminal callback has been handled.
    #[serde(default)]
    pub notified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A fresh `Pending` run positioned at `entry_step`.
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        entry_step: impl Into<String>,
        data: RunData,
        callback_token: Option<CallbackToken>,
    ) -> Self {
        let entry_step = entry_step.into();
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            status: RunStatus::Pending,
            visits: HashMap::from([(entry_step.clone(), 1)]),
            current_step: entry_step,
            step_counter: 0,
            attempt: 0,
            client_errors: 0,
            step_entered_at: now,
            data,
            callback_token,
            cancel_requested: false,
            start_in_flight: false,
            resume_at: None,
            failure: None,
            outputs: None,
            notified: false,
            callback_error: None,
            started_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the run for cancellation. Takes effect at the next step boundary.
    pub fn request_cancel(&mut self) {
        if !self.is_terminal() {
            self.cancel_requested = true;
        }
    }

    /// Move to `next`, resetting per-step counters.
    pub fn enter_step(&mut self, next: &str, now: DateTime<Utc>) {
        self.current_step = next.to_string();
        self.step_counter += 1;
        self.attempt = 0;
        self.client_errors = 0;
        self.resume_at = None;
        self.step_entered_at = now;
        *self.visits.entry(next.to_string()).or_insert(0) += 1;
    }

    pub fn visits_of(&self, step: &str) -> u32 {
        self.visits.get(step).copied().unwrap_or(0)
    }

    /// Time left before the current step may run again, if any.
    pub fn remaining_wait(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.resume_at
            .and_then(|at| (at - now).to_std().ok())
            .filter(|left| !left.is_zero())
    }

    /// Release a pending delay once the driver has slept through it.
    pub fn wake(&mut self) {
        self.resume_at = None;
    }
}

// ---------------------------------------------------------------------------
// Step logs
// ---------------------------------------------------------------------------

/// Outcome recorded for one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepLogStatus {
    Advanced,
    Waiting,
    Caught,
    Succeeded,
    Failed,
}

impl StepLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepLogStatus::Advanced => "advanced",
            StepLogStatus::Waiting => "waiting",
            StepLogStatus::Caught => "caught",
            StepLogStatus::Succeeded => "succeeded",
            StepLogStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepLogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advanced" => Ok(StepLogStatus::Advanced),
            "waiting" => Ok(StepLogStatus::Waiting),
            "caught" => Ok(StepLogStatus::Caught),
            "succeeded" => Ok(StepLogStatus::Succeeded),
            "failed" => Ok(StepLogStatus::Failed),
            other => Err(format!("unknown step log status: {other}")),
        }
    }
}

/// Audit row for one step attempt within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step: String,
    /// The run's step counter when the attempt happened.
    pub sequence: u64,
    pub attempt: u32,
    pub status: StepLogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
