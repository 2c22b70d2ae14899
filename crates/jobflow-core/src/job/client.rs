//! JobClient trait definition.
//!
//! Uses RPITIT (return position impl trait in trait) for async methods.
//! For dynamic dispatch, see [`super::BoxJobClient`].

use std::collections::BTreeMap;

use jobflow_types::job::{JobHandle, JobStatus};

/// Errors from calling the external job service.
///
/// Every variant surfaces to the engine as a client error; whether it is
/// retried depends on the step (status polls back off, starts never retry).
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobClientError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("request failed: {0}")]
    Request(String),

    /// The service answered with a non-success status.
    #[error("job service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The service answered with something we could not decode.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The job or job run is unknown to the service.
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// Capability for starting, polling, and cancelling external jobs.
///
/// Implementations must be safe for concurrent use by many runs.
pub trait JobClient: Send + Sync {
    /// Start a named job with string parameters and return its handle.
    ///
    /// Starting is not idempotent: callers must invoke this at most once per
    /// logical start.
    fn start(
        &self,
        job_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<JobHandle, JobClientError>> + Send;

    /// Report the current status of a started job.
    fn status(
        &self,
        handle: &JobHandle,
    ) -> impl std::future::Future<Output = Result<JobStatus, JobClientError>> + Send;

    /// Ask the service to stop a job. Best-effort: a job may keep running.
    fn cancel(
        &self,
        handle: &JobHandle,
    ) -> impl std::future::Future<Output = Result<(), JobClientError>> + Send {
        let _ = handle;
        async { Ok(()) }
    }
}
