//! Event types for the jobflow event bus.
//!
//! `WorkflowEvent` is broadcast as runs progress. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::FailureKind;

/// Events emitted during workflow run execution.
///
/// Consumed by the SSE endpoint, the CLI, and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run left `Pending` and began executing its entry step.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        entry_step: String,
    },

    /// A step is about to be invoked.
    StepStarted {
        run_id: Uuid,
        step: String,
        kind: String,
        attempt: u32,
    },

    /// The run moved from one step to its successor.
    StepAdvanced {
        run_id: Uuid,
        from: String,
        to: String,
        /// True when the move was a catch redirect.
        caught: bool,
    },

    /// A step asked to be re-invoked later.
    StepWaiting {
        run_id: Uuid,
        step: String,
        resume_at: DateTime<Utc>,
    },

    RunSucceeded {
        run_id: Uuid,
        workflow_name: String,
        steps_taken: u64,
    },

    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        kind: FailureKind,
        reason: String,
    },

    /// The terminal callback was handed to the callback channel.
    CallbackDelivered {
        run_id: Uuid,
        /// False when the token had already been consumed.
        first_delivery: bool,
    },

    /// Callback delivery failed after all attempts.
    CallbackFailed { run_id: Uuid, error: String },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepAdvanced { run_id, .. }
            | WorkflowEvent::StepWaiting { run_id, .. }
            | WorkflowEvent::RunSucceeded { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::CallbackDelivered { run_id, .. }
            | WorkflowEvent::CallbackFailed { run_id, .. } => *run_id,
        }
    }

    /// Whether this event marks the end of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunSucceeded { .. } | WorkflowEvent::RunFailed { .. }
        )
    }
}
