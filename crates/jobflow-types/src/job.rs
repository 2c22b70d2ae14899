//! External job references and status reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque reference to one execution of an external job.
///
/// Returned by `JobClient::start` and stored in run data so later poll steps
/// can query status without re-specifying job parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_name: String,
    pub run_id: String,
}

impl JobHandle {
    pub fn new(job_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_name, self.run_id)
    }
}

/// Lifecycle state of an external job as reported by the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One status report for an external job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl JobStatus {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            outputs: BTreeMap::new(),
            failure_reason: None,
        }
    }

    pub fn succeeded(outputs: BTreeMap<String, String>) -> Self {
        Self {
            state: JobState::Succeeded,
            outputs,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            outputs: BTreeMap::new(),
            failure_reason: Some(reason.into()),
        }
    }
}
