//! Step executor for the workflow step kinds.
//!
//! `StepExecutor` dispatches on `StepKind` and returns a `StepResult`. Each
//! handler reads what it needs from run data, performs at most one external
//! call, and describes the change without touching the run itself. Choosing
//! a branch target and delivering terminal callbacks belong to the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use jobflow_types::job::{JobHandle, JobState};
use jobflow_types::run::FailureKind;
use jobflow_types::run_data::{RunData, RunDataError, check_output_size, value_to_string};
use jobflow_types::workflow::{StepKind, StepSpec};
use serde_json::{Value, json};

use crate::job::BoxJobClient;

use super::engine::EngineConfig;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of executing one step.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// The step finished; continue with this run data.
    Advance(RunData),
    /// The step failed.
    Fail(StepError),
    /// Re-invoke the same step no sooner than `after`.
    ///
    /// `transient` marks a retry caused by a failed status call, which counts
    /// against the client-error budget instead of the poll budget.
    Retry { after: Duration, transient: bool },
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a step failed. Each variant maps to one `FailureKind`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("exhausted retries: {0}")]
    Exhausted(String),

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("{0}")]
    FailStep(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::MissingField(_) => FailureKind::MissingField,
            StepError::Client(_) => FailureKind::ClientError,
            StepError::JobFailed(_) => FailureKind::JobFailure,
            StepError::Exhausted(_) => FailureKind::ExhaustedRetries,
            StepError::Definition(_) => FailureKind::InvalidDefinition,
            StepError::FailStep(_) => FailureKind::FailStep,
            StepError::Storage(_) => FailureKind::StorageError,
            StepError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Reason string delivered to the callback.
    pub fn reason(&self) -> String {
        match self {
            StepError::FailStep(reason) => reason.clone(),
            StepError::Cancelled => "Cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RunDataError> for StepError {
    fn from(e: RunDataError) -> Self {
        match e {
            RunDataError::MissingField(path) => StepError::MissingField(path),
            RunDataError::TooLarge { .. } => StepError::JobFailed(e.to_string()),
            RunDataError::PathConflict(_) | RunDataError::NotAnObject => {
                StepError::Definition(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StepInput
// ---------------------------------------------------------------------------

/// What a step sees of its run.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub data: &'a RunData,
    /// Non-transient retries taken at this step so far.
    pub attempt: u32,
    /// Consecutive failed status calls at this step.
    pub client_errors: u32,
    /// Time spent at this step so far.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual workflow steps by dispatching on step kind.
pub struct StepExecutor {
    jobs: BoxJobClient,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(jobs: BoxJobClient, config: EngineConfig) -> Self {
        Self { jobs, config }
    }

    /// Run a step and return its result.
    ///
    /// `Succeed` and `Fail` steps are handled here only as far as run data
    /// goes; the engine owns the terminal transition and the callback.
    pub async fn execute(&self, step: &StepSpec, input: StepInput<'_>) -> StepResult {
        match &step.kind {
            StepKind::StartJob {
                job,
                parameters,
                inputs,
                result_path,
                ..
            } => {
                let target = result_path.as_deref().unwrap_or(&step.name);
                self.start_job(job, parameters, inputs, target, input).await
            }
            StepKind::PollJob {
                handle_path,
                poll_interval_secs,
                max_attempts,
                timeout_secs,
                result_path,
                ..
            } => {
                let interval = poll_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.default_poll_interval);
                let spec = PollSpec {
                    handle_path,
                    interval,
                    max_attempts: *max_attempts,
                    timeout: timeout_secs.map(Duration::from_secs),
                    result_path: result_path.as_deref(),
                };
                self.poll_job(&step.name, spec, input).await
            }
            StepKind::Branch { .. } => StepResult::Advance(input.data.clone()),
            StepKind::Wait { seconds, .. } => {
                if input.attempt == 0 {
                    StepResult::Retry {
                        after: Duration::from_secs(*seconds),
                        transient: false,
                    }
                } else {
                    StepResult::Advance(input.data.clone())
                }
            }
            StepKind::Succeed { outputs } => match collect_outputs(outputs, input.data) {
                Ok(_) => StepResult::Advance(input.data.clone()),
                Err(e) => StepResult::Fail(e),
            },
            StepKind::Fail { reason } => StepResult::Fail(StepError::FailStep(reason.clone())),
        }
    }

    // -----------------------------------------------------------------------
    // StartJob
    // -----------------------------------------------------------------------

    async fn start_job(
        &self,
        job: &str,
        parameters: &BTreeMap<String, String>,
        inputs: &BTreeMap<String, String>,
        target: &str,
        input: StepInput<'_>,
    ) -> StepResult {
        let params = match resolve_parameters(parameters, inputs, input.data) {
            Ok(p) => p,
            Err(e) => return StepResult::Fail(e),
        };

        tracing::debug!(job, params = params.len(), "starting external job");

        let handle = match self.jobs.start(job, &params).await {
            Ok(h) => h,
            // Starting is not idempotent, so a failed start is never retried.
            Err(e) => return StepResult::Fail(StepError::Client(e.to_string())),
        };

        let mut data = input.data.clone();
        if let Err(e) = data.set(target, json!(handle)) {
            return StepResult::Fail(e.into());
        }
        StepResult::Advance(data)
    }

    // -----------------------------------------------------------------------
    // PollJob
    // -----------------------------------------------------------------------

    async fn poll_job(&self, step: &str, spec: PollSpec<'_>, input: StepInput<'_>) -> StepResult {
        let handle = match read_handle(input.data, spec.handle_path) {
            Ok(h) => h,
            Err(e) => return StepResult::Fail(e),
        };

        if let Some(timeout) = spec.timeout {
            if input.elapsed >= timeout {
                return StepResult::Fail(StepError::Exhausted(format!(
                    "step '{step}' timed out after {}s polling {handle}",
                    timeout.as_secs()
                )));
            }
        }

        let status = match self.jobs.status(&handle).await {
            Ok(s) => s,
            Err(e) => {
                let failures = input.client_errors + 1;
                if RetryHandler::should_retry_client_error(&self.config, failures) {
                    let after = RetryHandler::backoff_delay(&self.config, failures);
                    tracing::warn!(
                        step,
                        job = %handle,
                        failures,
                        delay_ms = after.as_millis() as u64,
                        error = %e,
                        "status call failed, backing off"
                    );
                    return StepResult::Retry {
                        after,
                        transient: true,
                    };
                }
                return StepResult::Fail(StepError::Exhausted(format!(
                    "status call for {handle} failed {failures} times: {e}"
                )));
            }
        };

        match status.state {
            JobState::Running => {
                if RetryHandler::poll_exhausted(spec.max_attempts, input.attempt + 1) {
                    return StepResult::Fail(StepError::Exhausted(format!(
                        "{handle} still running after {} polls",
                        spec.max_attempts
                    )));
                }
                StepResult::Retry {
                    after: spec.interval,
                    transient: false,
                }
            }
            JobState::Succeeded => {
                let merged = check_output_size(&status.outputs).and_then(|()| {
                    let mut data = input.data.clone();
                    data.merge_strings(spec.result_path, &status.outputs)?;
                    data.set(
                        &format!("{}.status", spec.handle_path),
                        Value::String(JobState::Succeeded.to_string()),
                    )?;
                    data.check_size()?;
                    Ok(data)
                });
                match merged {
                    Ok(data) => StepResult::Advance(data),
                    Err(e) => StepResult::Fail(e.into()),
                }
            }
            JobState::Failed => {
                let reason = status
                    .failure_reason
                    .unwrap_or_else(|| format!("{handle} reported failure"));
                StepResult::Fail(StepError::JobFailed(reason))
            }
        }
    }
}

/// Borrowed poll step configuration with defaults applied.
struct PollSpec<'a> {
    handle_path: &'a str,
    interval: Duration,
    max_attempts: u32,
    timeout: Option<Duration>,
    result_path: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Run data helpers
// ---------------------------------------------------------------------------

/// Build job parameters from literals plus values read from run data.
///
/// Inputs override literals of the same name. A missing input path fails.
pub fn resolve_parameters(
    parameters: &BTreeMap<String, String>,
    inputs: &BTreeMap<String, String>,
    data: &RunData,
) -> Result<BTreeMap<String, String>, StepError> {
    let mut params = parameters.clone();
    for (name, path) in inputs {
        params.insert(name.clone(), data.get_string(path)?);
    }
    Ok(params)
}

/// Read the job handle stored at `path`.
pub fn read_handle(data: &RunData, path: &str) -> Result<JobHandle, StepError> {
    let value = data.get(path)?;
    serde_json::from_value(value.clone())
        .map_err(|_| StepError::MissingField(format!("{path} (not a job handle)")))
}

/// Select the outputs a `succeed` step delivers.
///
/// An empty selection delivers all run data, flattened to dotted keys.
pub fn collect_outputs(
    selection: &BTreeMap<String, String>,
    data: &RunData,
) -> Result<BTreeMap<String, String>, StepError> {
    if selection.is_empty() {
        return Ok(data.flatten());
    }
    selection
        .iter()
        .map(|(name, path)| -> Result<(String, String), StepError> {
            Ok((name.clone(), data.get(path).map(value_to_string)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedJobClient;
    use jobflow_types::job::JobStatus;
    use serde_json::json;

    fn step(yaml: &str) -> StepSpec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn input(data: &RunData) -> StepInput<'_> {
        StepInput {
            data,
            attempt: 0,
            client_errors: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn executor(client: ScriptedJobClient) -> StepExecutor {
        StepExecutor::new(BoxJobClient::new(client), EngineConfig::default())
    }

    fn handle_data() -> RunData {
        RunData::from_value(json!({ "etl": { "job_name": "etl", "run_id": "jr_1" } })).unwrap()
    }

    const POLL: &str = "{ name: wait-etl, type: poll_job, handle_path: etl, poll_interval_secs: 5, max_attempts: 3, next: done }";

    #[tokio::test]
    async fn start_job_resolves_inputs_and_stores_handle() {
        let client = ScriptedJobClient::new();
        let exec = StepExecutor::new(BoxJobClient::new(client.clone()), EngineConfig::default());
        let s = step(
            r#"
name: preprocess
type: start_job
job: etl
parameters: { mode: full }
inputs: { input_dir: input.dir }
next: poll
"#,
        );
        let data = RunData::from_value(json!({ "input": { "dir": "s3://raw" } })).unwrap();

        let StepResult::Advance(out) = exec.execute(&s, input(&data)).await else {
            panic!("expected advance");
        };
        assert_eq!(out.get("preprocess.job_name").unwrap(), "etl");
        let started = client.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1["input_dir"], "s3://raw");
        assert_eq!(started[0].1["mode"], "full");
    }

    #[tokio::test]
    async fn start_job_missing_input_fails_without_calling_client() {
        let client = ScriptedJobClient::new();
        let exec = StepExecutor::new(BoxJobClient::new(client.clone()), EngineConfig::default());
        let s = step("{ name: s, type: start_job, job: etl, inputs: { x: nope }, next: n }");

        let result = exec.execute(&s, input(&RunData::new())).await;
        assert!(matches!(result, StepResult::Fail(StepError::MissingField(p)) if p == "nope"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn start_job_client_error_is_not_retried() {
        let client = ScriptedJobClient::new().fail_starts("quota exceeded");
        let s = step("{ name: s, type: start_job, job: etl, next: n }");
        let result = executor(client).execute(&s, input(&RunData::new())).await;
        match result {
            StepResult::Fail(e) => assert_eq!(e.kind(), FailureKind::ClientError),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_running_retries_after_interval() {
        let client = ScriptedJobClient::new().with_statuses("etl", vec![Ok(JobStatus::running())]);
        let data = handle_data();
        let result = executor(client).execute(&step(POLL), input(&data)).await;
        assert!(matches!(
            result,
            StepResult::Retry { after, transient: false } if after == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn poll_running_at_cap_is_exhausted() {
        let client = ScriptedJobClient::new().with_statuses("etl", vec![Ok(JobStatus::running())]);
        let data = handle_data();
        let mut i = input(&data);
        i.attempt = 2;
        let result = executor(client).execute(&step(POLL), i).await;
        assert!(matches!(result, StepResult::Fail(StepError::Exhausted(_))));
    }

    #[tokio::test]
    async fn poll_succeeded_merges_outputs_and_marks_status() {
        let outputs = BTreeMap::from([("accuracy".to_string(), "0.95".to_string())]);
        let client = ScriptedJobClient::new()
            .with_statuses("etl", vec![Ok(JobStatus::succeeded(outputs))]);
        let data = handle_data();
        let StepResult::Advance(out) = executor(client).execute(&step(POLL), input(&data)).await
        else {
            panic!("expected advance");
        };
        assert_eq!(out.get("accuracy").unwrap(), "0.95");
        assert_eq!(out.get("etl.status").unwrap(), "Succeeded");
    }

    #[tokio::test]
    async fn poll_failed_carries_job_reason() {
        let client = ScriptedJobClient::new()
            .with_statuses("etl", vec![Ok(JobStatus::failed("OOM on executor 3"))]);
        let data = handle_data();
        let result = executor(client).execute(&step(POLL), input(&data)).await;
        assert!(matches!(result, StepResult::Fail(StepError::JobFailed(r)) if r == "OOM on executor 3"));
    }

    #[tokio::test]
    async fn poll_client_error_backs_off_then_exhausts() {
        let data = handle_data();
        let client = ScriptedJobClient::new().with_statuses("etl", vec![Err("connection reset".into())]);
        let exec = executor(client);

        let first = exec.execute(&step(POLL), input(&data)).await;
        assert!(matches!(first, StepResult::Retry { transient: true, .. }));

        let mut i = input(&data);
        i.client_errors = EngineConfig::default().client_error_retries;
        let last = exec.execute(&step(POLL), i).await;
        assert!(matches!(last, StepResult::Fail(StepError::Exhausted(_))));
    }

    #[tokio::test]
    async fn poll_without_handle_is_missing_field() {
        let result = executor(ScriptedJobClient::new())
            .execute(&step(POLL), input(&RunData::new()))
            .await;
        assert!(matches!(result, StepResult::Fail(StepError::MissingField(_))));
    }

    #[tokio::test]
    async fn wait_retries_once_then_advances() {
        let s = step("{ name: hold, type: wait, seconds: 15, next: poll }");
        let exec = executor(ScriptedJobClient::new());
        let data = RunData::new();
        assert!(matches!(
            exec.execute(&s, input(&data)).await,
            StepResult::Retry { after, .. } if after == Duration::from_secs(15)
        ));
        let mut i = input(&data);
        i.attempt = 1;
        assert!(matches!(exec.execute(&s, i).await, StepResult::Advance(_)));
    }

    #[test]
    fn collect_outputs_selects_or_flattens() {
        let data = RunData::from_value(json!({ "accuracy": 0.95, "model": { "uri": "s3://m" } })).unwrap();
        let picked = collect_outputs(
            &BTreeMap::from([("acc".to_string(), "accuracy".to_string())]),
            &data,
        )
        .unwrap();
        assert_eq!(picked["acc"], "0.95");

        let all = collect_outputs(&BTreeMap::new(), &data).unwrap();
        assert_eq!(all["model.uri"], "s3://m");

        let missing = collect_outputs(
            &BTreeMap::from([("x".to_string(), "nope".to_string())]),
            &data,
        );
        assert!(matches!(missing, Err(StepError::MissingField(_))));
    }
}
