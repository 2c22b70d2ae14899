//! Workflow engine: drives a run through its definition, one step at a time.
//!
//! The engine owns every mutation of a `WorkflowRun`. Each `advance` call
//! resolves the current step, runs it through the `StepExecutor`, and applies
//! the `StepResult`:
//!
//! - `Advance` moves the run to the resolved successor (branch predicates are
//!   evaluated here, first match wins, else the default).
//! - `Retry(after)` keeps the run at the same step and reports `Waiting`.
//!   Until `after` has passed, further `advance` calls report the remaining
//!   wait without executing anything. The driver (`run_to_completion` or the
//!   orchestrator) sleeps on the tokio timer; no thread is held while a run
//!   waits.
//! - `Fail` routes to the step's `catch` target when the failure is
//!   catchable, and otherwise finalizes the run.
//!
//! Every terminal transition goes through one finalize path that records the
//! result and delivers the callback exactly once per run.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobflow_types::config::EngineSettings;
use jobflow_types::event::WorkflowEvent;
use jobflow_types::run::{CallbackToken, FailureKind, RunFailure, RunStatus, WorkflowRun};
use jobflow_types::run_data::RunData;
use jobflow_types::workflow::{DEFAULT_ERROR_PATH, StepKind, StepSpec, WorkflowDefinition};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::callback::BoxCallbackChannel;
use crate::event::EventBus;
use crate::job::BoxJobClient;

use super::definition::{WorkflowError, validate_definition};
use super::expression::WorkflowEvaluator;
use super::notify::{Notifier, NotifyOutcome, Signal};
use super::predicate::resolve_branch;
use super::step_executor::{
    StepError, StepExecutor, StepInput, StepResult, collect_outputs, read_handle,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry, backoff, and delivery policy for an engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Poll interval for poll steps that do not set one.
    pub default_poll_interval: Duration,
    /// Consecutive status-call failures a poll step tolerates.
    pub client_error_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delivery attempts per terminal callback.
    pub callback_attempts: u32,
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            default_poll_interval: Duration::from_secs(settings.default_poll_interval_secs),
            client_error_retries: settings.client_error_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_secs(settings.backoff_max_secs),
            callback_attempts: settings.callback_attempts,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// What one `advance` call did to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The run moved to a new step. `caught` marks a catch redirect.
    Advanced {
        from: String,
        to: String,
        caught: bool,
    },
    /// The current step asked to be re-invoked after `resume_after`.
    Waiting { step: String, resume_after: Duration },
    Succeeded,
    Failed { kind: FailureKind, reason: String },
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepOutcome::Succeeded | StepOutcome::Failed { .. })
    }
}

/// Errors raised before a run exists.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] WorkflowError),

    #[error("invalid run data: {0}")]
    InvalidRunData(String),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The state machine that sequences step executors for any number of runs.
///
/// Holds no per-run state: the same engine can advance many runs
/// concurrently. Job and callback capabilities are injected.
pub struct WorkflowEngine {
    jobs: BoxJobClient,
    executor: StepExecutor,
    notifier: Notifier,
    events: Option<EventBus>,
}

impl WorkflowEngine {
    pub fn new(jobs: BoxJobClient, callbacks: BoxCallbackChannel, config: EngineConfig) -> Self {
        Self {
            executor: StepExecutor::new(jobs.clone(), config.clone()),
            notifier: Notifier::new(callbacks, config),
            jobs,
            events: None,
        }
    }

    /// Publish run lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create a `Pending` run positioned at the definition's entry step.
    ///
    /// Fails with `InvalidDefinition` for a structurally invalid graph
    /// (missing entry, unknown successor, unbounded cycle) and with
    /// `InvalidRunData` unless `initial_run_data` is a JSON object.
    pub fn start(
        &self,
        def: &WorkflowDefinition,
        initial_run_data: serde_json::Value,
        callback_token: Option<CallbackToken>,
    ) -> Result<WorkflowRun, EngineError> {
        validate_definition(def)?;
        let data = RunData::from_value(initial_run_data)
            .and_then(|d| d.check_size().map(|()| d))
            .map_err(|e| EngineError::InvalidRunData(e.to_string()))?;

        let run = WorkflowRun::new(&def.name, &def.version, &def.start_at, data, callback_token);
        tracing::info!(
            run_id = %run.id,
            workflow = %def.name,
            entry = %def.start_at,
            "created workflow run"
        );
        Ok(run)
    }

    /// Mark a pending job start as in flight.
    ///
    /// Returns `true` when the run changed and should be persisted before
    /// `advance` dispatches the start, so a crash mid-start is detectable.
    pub fn prepare_dispatch(&self, def: &WorkflowDefinition, run: &mut WorkflowRun) -> bool {
        if run.is_terminal() || run.cancel_requested || run.start_in_flight {
            return false;
        }
        let is_start = def
            .step(&run.current_step)
            .is_some_and(|s| matches!(s.kind, StepKind::StartJob { .. }));
        if is_start {
            run.start_in_flight = true;
        }
        is_start
    }

    /// Reconcile a run loaded from storage before advancing it again.
    ///
    /// A run persisted with a job start in flight may or may not have started
    /// the job. Starts are not idempotent, so the step fails with a client
    /// error (subject to `catch`) rather than dispatching a second time.
    pub async fn resume(&self, def: &WorkflowDefinition, run: &mut WorkflowRun) -> Option<StepOutcome> {
        if run.is_terminal() {
            if !run.notified {
                self.notify(run).await;
            }
            return None;
        }
        if !run.start_in_flight {
            return None;
        }
        run.start_in_flight = false;
        tracing::warn!(
            run_id = %run.id,
            step = %run.current_step,
            "recovered run with an interrupted job start"
        );
        let err = StepError::Client("start interrupted".to_string());
        let outcome = match def.step(&run.current_step) {
            Some(step) => self.fail_step(def, run, step, err).await,
            None => self.finalize_failure(run, err).await,
        };
        Some(outcome)
    }

    /// Fail a run that can no longer be advanced, e.g. because its
    /// definition was removed or its checkpoint could not be written.
    pub async fn abort(&self, run: &mut WorkflowRun, err: StepError) -> StepOutcome {
        if run.is_terminal() {
            return terminal_outcome(run);
        }
        self.finalize_failure(run, err).await
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Execute the current step once and apply its result.
    ///
    /// Calling this on a terminal run re-attempts an outstanding callback
    /// and returns the terminal outcome without executing anything.
    pub async fn advance(&self, def: &WorkflowDefinition, run: &mut WorkflowRun) -> StepOutcome {
        if run.is_terminal() {
            if !run.notified {
                self.notify(run).await;
            }
            return terminal_outcome(run);
        }

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            tracing::info!(run_id = %run.id, workflow = %run.workflow_name, "workflow run started");
            self.emit(WorkflowEvent::RunStarted {
                run_id: run.id,
                workflow_name: run.workflow_name.clone(),
                entry_step: run.current_step.clone(),
            });
        }

        if run.cancel_requested {
            self.cancel_outstanding_job(def, run).await;
            return self.finalize_failure(run, StepError::Cancelled).await;
        }

        let now = Utc::now();
        if let Some(limit) = def.timeout_secs {
            if elapsed_since(run.started_at, now) >= Duration::from_secs(limit) {
                let err = StepError::Exhausted(format!("workflow exceeded its {limit}s timeout"));
                return self.finalize_failure(run, err).await;
            }
        }

        // A step asked to be re-invoked no sooner than `resume_at`.
        if let Some(left) = run.remaining_wait(now) {
            return StepOutcome::Waiting {
                step: run.current_step.clone(),
                resume_after: left,
            };
        }

        let Some(step) = def.step(&run.current_step) else {
            let err = StepError::Definition(format!("unknown step '{}'", run.current_step));
            return self.finalize_failure(run, err).await;
        };

        tracing::debug!(
            run_id = %run.id,
            step = %step.name,
            kind = step.kind.label(),
            attempt = run.attempt,
            "executing step"
        );
        self.emit(WorkflowEvent::StepStarted {
            run_id: run.id,
            step: step.name.clone(),
            kind: step.kind.label().to_string(),
            attempt: run.attempt,
        });

        let is_start = matches!(step.kind, StepKind::StartJob { .. });
        if is_start {
            run.start_in_flight = true;
        }
        let input = StepInput {
            data: &run.data,
            attempt: run.attempt,
            client_errors: run.client_errors,
            elapsed: elapsed_since(run.step_entered_at, now),
        };
        let result = self.executor.execute(step, input).await;
        if is_start {
            run.start_in_flight = false;
        }

        match result {
            StepResult::Advance(data) => {
                run.data = data;
                if let StepKind::Succeed { outputs } = &step.kind {
                    return match collect_outputs(outputs, &run.data) {
                        Ok(outputs) => self.finalize_success(run, outputs).await,
                        Err(e) => self.finalize_failure(run, e).await,
                    };
                }
                match resolve_successor(step, &run.data) {
                    Ok(next) => self.transition(def, run, &step.name, &next, false).await,
                    Err(e) => self.fail_step(def, run, step, e).await,
                }
            }
            StepResult::Retry { after, transient } => {
                if transient {
                    run.client_errors += 1;
                } else {
                    run.attempt += 1;
                    run.client_errors = 0;
                }
                let resume_at = now + chrono::Duration::from_std(after).unwrap_or(chrono::Duration::zero());
                run.resume_at = Some(resume_at);
                tracing::debug!(
                    run_id = %run.id,
                    step = %step.name,
                    delay_ms = after.as_millis() as u64,
                    "step waiting"
                );
                self.emit(WorkflowEvent::StepWaiting {
                    run_id: run.id,
                    step: step.name.clone(),
                    resume_at,
                });
                StepOutcome::Waiting {
                    step: step.name.clone(),
                    resume_after: after,
                }
            }
            StepResult::Fail(e) => self.fail_step(def, run, step, e).await,
        }
    }

    /// Drive `run` until it reaches a terminal state.
    ///
    /// Sleeps on the tokio timer between `Waiting` outcomes and wakes early
    /// when `cancel` fires, which finalizes the run as `Cancelled`.
    pub async fn run_to_completion(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: CancellationToken,
    ) -> StepOutcome {
        if let Some(outcome) = self.resume(def, run).await {
            if outcome.is_terminal() {
                return outcome;
            }
        }
        loop {
            if cancel.is_cancelled() {
                run.request_cancel();
            }
            let outcome = self.advance(def, run).await;
            match &outcome {
                StepOutcome::Waiting { resume_after, .. } => {
                    tokio::select! {
                        _ = tokio::time::sleep(*resume_after) => run.wake(),
                        _ = cancel.cancelled() => run.request_cancel(),
                    }
                }
                o if o.is_terminal() => return outcome,
                _ => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn transition(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        from: &str,
        to: &str,
        caught: bool,
    ) -> StepOutcome {
        if let Some(max) = def.step(to).and_then(|s| s.max_visits) {
            if run.visits_of(to) >= max {
                let err = StepError::Exhausted(format!("step '{to}' exceeded max_visits of {max}"));
                return self.finalize_failure(run, err).await;
            }
        }

        run.enter_step(to, Utc::now());
        tracing::debug!(run_id = %run.id, from, to, caught, "step advanced");
        self.emit(WorkflowEvent::StepAdvanced {
            run_id: run.id,
            from: from.to_string(),
            to: to.to_string(),
            caught,
        });
        StepOutcome::Advanced {
            from: from.to_string(),
            to: to.to_string(),
            caught,
        }
    }

    /// Route a step failure to its catch target, or finalize the run.
    async fn fail_step(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        step: &StepSpec,
        err: StepError,
    ) -> StepOutcome {
        let kind = err.kind();
        if kind.catchable() {
            if let Some((target, error_path)) = catch_target(step) {
                let info = json!({
                    "kind": kind,
                    "reason": err.reason(),
                    "step": step.name,
                });
                if run.data.set(error_path, info).is_ok() {
                    tracing::warn!(
                        run_id = %run.id,
                        step = %step.name,
                        catch = target,
                        kind = %kind,
                        reason = %err.reason(),
                        "step failure caught"
                    );
                    return self.transition(def, run, &step.name, target, true).await;
                }
            }
        }
        self.finalize_failure(run, err).await
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize_success(
        &self,
        run: &mut WorkflowRun,
        outputs: BTreeMap<String, String>,
    ) -> StepOutcome {
        run.status = RunStatus::Succeeded;
        run.outputs = Some(outputs);
        close(run);
        tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow_name,
            steps = run.step_counter,
            "workflow run succeeded"
        );
        self.emit(WorkflowEvent::RunSucceeded {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            steps_taken: run.step_counter,
        });
        self.notify(run).await;
        StepOutcome::Succeeded
    }

    async fn finalize_failure(&self, run: &mut WorkflowRun, err: StepError) -> StepOutcome {
        let kind = err.kind();
        let reason = err.reason();
        run.status = RunStatus::Failed;
        run.failure = Some(RunFailure {
            kind,
            reason: reason.clone(),
            step: Some(run.current_step.clone()),
        });
        close(run);
        tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow_name,
            step = %run.current_step,
            kind = %kind,
            reason = %reason,
            "workflow run failed"
        );
        self.emit(WorkflowEvent::RunFailed {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            kind,
            reason: reason.clone(),
        });
        self.notify(run).await;
        StepOutcome::Failed { kind, reason }
    }

    /// Deliver the terminal signal once. Delivery errors are recorded on the
    /// run and never change its status.
    async fn notify(&self, run: &mut WorkflowRun) {
        let empty = BTreeMap::new();
        let signal = match (&run.status, &run.failure) {
            (RunStatus::Failed, Some(failure)) => Signal::Failure(&failure.reason),
            (RunStatus::Failed, None) => Signal::Failure("failed"),
            _ => Signal::Success(run.outputs.as_ref().unwrap_or(&empty)),
        };
        let outcome = self
            .notifier
            .deliver(run.callback_token.as_ref(), signal)
            .await;

        run.notified = true;
        match outcome {
            NotifyOutcome::Delivered | NotifyOutcome::AlreadyConsumed => {
                self.emit(WorkflowEvent::CallbackDelivered {
                    run_id: run.id,
                    first_delivery: outcome == NotifyOutcome::Delivered,
                });
            }
            NotifyOutcome::Failed(error) => {
                self.emit(WorkflowEvent::CallbackFailed {
                    run_id: run.id,
                    error: error.clone(),
                });
                run.callback_error = Some(error);
            }
            NotifyOutcome::NoToken => {}
        }
    }

    /// Best-effort stop of a job the run is currently polling.
    async fn cancel_outstanding_job(&self, def: &WorkflowDefinition, run: &WorkflowRun) {
        let Some(StepKind::PollJob { handle_path, .. }) = def.step(&run.current_step).map(|s| &s.kind)
        else {
            return;
        };
        let Ok(handle) = read_handle(&run.data, handle_path) else {
            return;
        };
        match self.jobs.cancel(&handle).await {
            Ok(()) => tracing::info!(run_id = %run.id, job = %handle, "requested job cancellation"),
            Err(e) => tracing::warn!(
                run_id = %run.id,
                job = %handle,
                error = %e,
                "job cancellation failed; the job may keep running"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the successor of a non-terminal step.
fn resolve_successor(step: &StepSpec, data: &RunData) -> Result<String, StepError> {
    match &step.kind {
        StepKind::StartJob { next, .. } | StepKind::PollJob { next, .. } | StepKind::Wait { next, .. } => {
            Ok(next.clone())
        }
        StepKind::Branch { choices, default } => {
            let evaluator = WorkflowEvaluator::new();
            match resolve_branch(choices, default.as_deref(), data, &evaluator) {
                Ok(Some(next)) => Ok(next.to_string()),
                Ok(None) => Err(StepError::Definition(format!(
                    "branch '{}' matched no choice and has no default",
                    step.name
                ))),
                Err(super::predicate::PredicateError::MissingField(e)) => Err(e.into()),
                Err(super::predicate::PredicateError::Expression(e)) => {
                    Err(StepError::Definition(e.to_string()))
                }
            }
        }
        StepKind::Succeed { .. } | StepKind::Fail { .. } => Err(StepError::Definition(format!(
            "terminal step '{}' has no successor",
            step.name
        ))),
    }
}

fn catch_target(step: &StepSpec) -> Option<(&str, &str)> {
    match &step.kind {
        StepKind::StartJob {
            catch: Some(target),
            error_path,
            ..
        }
        | StepKind::PollJob {
            catch: Some(target),
            error_path,
            ..
        } => Some((
            target.as_str(),
            error_path.as_deref().unwrap_or(DEFAULT_ERROR_PATH),
        )),
        _ => None,
    }
}

fn close(run: &mut WorkflowRun) {
    run.completed_at = Some(Utc::now());
    run.resume_at = None;
    run.start_in_flight = false;
    run.cancel_requested = false;
}

fn terminal_outcome(run: &WorkflowRun) -> StepOutcome {
    match (&run.status, &run.failure) {
        (RunStatus::Succeeded, _) => StepOutcome::Succeeded,
        (_, Some(f)) => StepOutcome::Failed {
            kind: f.kind,
            reason: f.reason.clone(),
        },
        _ => StepOutcome::Failed {
            kind: FailureKind::InvalidDefinition,
            reason: "failed".to_string(),
        },
    }
}

fn elapsed_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackRecord;
    use crate::event::Received;
    use crate::test_support::{CountingCallbacks, ScriptedJobClient};

    const PIPELINE_YAML: &str = r#"
name: ml-pipeline
start_at: preprocess
steps:
  - name: preprocess
    type: start_job
    job: etl
    inputs: { input_dir: input.dir }
    next: wait-etl
  - name: wait-etl
    type: poll_job
    handle_path: preprocess
    poll_interval_secs: 5
    next: etl-ok
  - name: etl-ok
    type: branch
    choices:
      - when: { op: string_equals, path: preprocess.status, value: Succeeded }
        next: train
    default: etl-failed
  - name: etl-failed
    type: fail
    reason: preprocessing failed
  - name: train
    type: start_job
    job: train
    next: wait-train
  - name: wait-train
    type: poll_job
    handle_path: train
    poll_interval_secs: 5
    next: check
  - name: check
    type: branch
    choices:
      - when: { op: numeric_greater_than_equals, path: accuracy, value: 0.9 }
        next: done
    default: reject
  - name: done
    type: succeed
    outputs: { accuracy: accuracy }
  - name: reject
    type: fail
    reason: low accuracy
"#;

    fn def(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn engine(client: &ScriptedJobClient, callbacks: &CountingCallbacks) -> WorkflowEngine {
        WorkflowEngine::new(
            BoxJobClient::new(client.clone()),
            BoxCallbackChannel::new(callbacks.clone()),
            EngineConfig::default(),
        )
    }

    fn input() -> serde_json::Value {
        json!({ "input": { "dir": "s3://raw" } })
    }

    fn token() -> Option<CallbackToken> {
        Some(CallbackToken::new("tok-1"))
    }

    fn pipeline_client(accuracy: &str) -> ScriptedJobClient {
        ScriptedJobClient::new()
            .succeed_after("etl", 2, &[("rows", "1200")])
            .succeed_after("train", 1, &[("accuracy", accuracy)])
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_with_high_accuracy_succeeds() {
        let client = pipeline_client("0.95");
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, input(), token()).unwrap();
        let outcome = engine
            .run_to_completion(&def, &mut run, CancellationToken::new())
            .await;

        assert_eq!(outcome, StepOutcome::Succeeded);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.notified);
        let expected = BTreeMap::from([("accuracy".to_string(), "0.95".to_string())]);
        assert_eq!(callbacks.record("tok-1"), Some(CallbackRecord::Success(expected)));
        assert_eq!(client.started().len(), 2);
        assert_eq!(client.started()[0].1["input_dir"], "s3://raw");
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_with_low_accuracy_fails_with_reason() {
        let client = pipeline_client("0.5");
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, input(), token()).unwrap();
        let outcome = engine
            .run_to_completion(&def, &mut run, CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            StepOutcome::Failed {
                kind: FailureKind::FailStep,
                reason: "low accuracy".into()
            }
        );
        assert_eq!(run.current_step, "reject");
        assert_eq!(
            callbacks.record("tok-1"),
            Some(CallbackRecord::Failure("low accuracy".into()))
        );
    }

    #[tokio::test]
    async fn poll_waits_while_job_is_running() {
        let client = pipeline_client("0.95");
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);
        let mut run = engine.start(&def, input(), None).unwrap();

        assert!(matches!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Advanced { ref to, .. } if to == "wait-etl"
        ));
        let polled = StepOutcome::Waiting {
            step: "wait-etl".into(),
            resume_after: Duration::from_secs(5),
        };
        assert_eq!(engine.advance(&def, &mut run).await, polled);

        // Re-advancing before the interval passes does not poll again.
        assert!(matches!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Waiting { ref step, resume_after } if step == "wait-etl" && resume_after <= Duration::from_secs(5)
        ));
        assert_eq!(client.call_count(), 2);
        assert_eq!(run.attempt, 1);

        run.wake();
        assert_eq!(engine.advance(&def, &mut run).await, polled);
        assert_eq!(run.attempt, 2);
        assert!(run.resume_at.is_some());

        run.wake();
        assert!(matches!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Advanced { ref to, caught: false, .. } if to == "etl-ok"
        ));
        assert_eq!(run.data.get("rows").unwrap(), "1200");
        assert_eq!(run.data.get("preprocess.status").unwrap(), "Succeeded");
        assert_eq!(run.attempt, 0);
        assert_eq!(run.step_counter, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_etl_job_stops_before_training() {
        let client = ScriptedJobClient::new().with_statuses(
            "etl",
            vec![Ok(jobflow_types::job::JobStatus::failed("schema mismatch"))],
        );
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, input(), token()).unwrap();
        let outcome = engine
            .run_to_completion(&def, &mut run, CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            StepOutcome::Failed {
                kind: FailureKind::JobFailure,
                reason: "job failed: schema mismatch".into()
            }
        );
        assert_eq!(run.current_step, "wait-etl");
        assert_eq!(client.started().len(), 1);
        assert_eq!(
            callbacks.record("tok-1"),
            Some(CallbackRecord::Failure("job failed: schema mismatch".into()))
        );
    }

    #[tokio::test]
    async fn wait_is_not_cut_short_by_early_advances() {
        let yaml = r#"
name: patient
start_at: hold
steps:
  - name: hold
    type: wait
    seconds: 3600
    next: done
  - name: done
    type: succeed
"#;
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({}), None).unwrap();

        assert_eq!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Waiting {
                step: "hold".into(),
                resume_after: Duration::from_secs(3600)
            }
        );
        for _ in 0..3 {
            assert!(matches!(
                engine.advance(&def, &mut run).await,
                StepOutcome::Waiting { ref step, resume_after }
                    if step == "hold" && resume_after > Duration::from_secs(3500)
            ));
        }
        assert_eq!(run.current_step, "hold");
        assert_eq!(run.attempt, 1);

        // Once the delay has elapsed the step completes.
        run.resume_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(matches!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Advanced { ref to, .. } if to == "done"
        ));
        assert_eq!(engine.advance(&def, &mut run).await, StepOutcome::Succeeded);
    }

    #[tokio::test]
    async fn cancel_before_first_step_makes_no_job_calls() {
        let client = pipeline_client("0.95");
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, input(), token()).unwrap();
        run.request_cancel();
        let outcome = engine.advance(&def, &mut run).await;

        assert_eq!(
            outcome,
            StepOutcome::Failed {
                kind: FailureKind::Cancelled,
                reason: "Cancelled".into()
            }
        );
        assert_eq!(client.call_count(), 0);
        assert_eq!(
            callbacks.record("tok-1"),
            Some(CallbackRecord::Failure("Cancelled".into()))
        );
    }

    #[tokio::test]
    async fn cancel_while_polling_stops_the_job() {
        let client = ScriptedJobClient::new().with_statuses("etl", vec![Ok(jobflow_types::job::JobStatus::running())]);
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);
        let mut run = engine.start(&def, input(), None).unwrap();

        engine.advance(&def, &mut run).await;
        assert!(matches!(engine.advance(&def, &mut run).await, StepOutcome::Waiting { .. }));
        run.request_cancel();
        let outcome = engine.advance(&def, &mut run).await;

        assert!(matches!(outcome, StepOutcome::Failed { kind: FailureKind::Cancelled, .. }));
        assert_eq!(client.cancelled().len(), 1);
        assert_eq!(client.cancelled()[0].job_name, "etl");
    }

    #[tokio::test]
    async fn terminal_callback_is_delivered_once() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, json!({}), token()).unwrap();
        let first = engine.advance(&def, &mut run).await;
        assert!(matches!(first, StepOutcome::Failed { kind: FailureKind::MissingField, .. }));
        assert_eq!(callbacks.calls(), 1);

        // Re-advancing a terminal run does not notify again.
        let again = engine.advance(&def, &mut run).await;
        assert_eq!(again, first);
        assert_eq!(callbacks.calls(), 1);

        // A second run sharing the token finds it consumed.
        let mut other = engine.start(&def, json!({}), token()).unwrap();
        engine.advance(&def, &mut other).await;
        assert_eq!(other.status, RunStatus::Failed);
        assert!(other.callback_error.is_none());
        assert!(matches!(
            callbacks.record("tok-1"),
            Some(CallbackRecord::Failure(reason)) if reason.contains("input.dir")
        ));
    }

    #[tokio::test]
    async fn missing_input_fails_before_any_job_call() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);

        let mut run = engine.start(&def, json!({ "input": {} }), None).unwrap();
        let outcome = engine.advance(&def, &mut run).await;

        assert!(matches!(outcome, StepOutcome::Failed { kind: FailureKind::MissingField, .. }));
        assert_eq!(client.call_count(), 0);
        assert_eq!(run.failure.as_ref().unwrap().step.as_deref(), Some("preprocess"));
    }

    #[tokio::test]
    async fn catch_routes_failure_and_records_error_info() {
        let yaml = r#"
name: guarded
start_at: submit
steps:
  - name: submit
    type: start_job
    job: etl
    next: done
    catch: cleanup
  - name: cleanup
    type: fail
    reason: submit failed
  - name: done
    type: succeed
"#;
        let client = ScriptedJobClient::new().fail_starts("quota exceeded");
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({}), None).unwrap();

        let outcome = engine.advance(&def, &mut run).await;
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                from: "submit".into(),
                to: "cleanup".into(),
                caught: true
            }
        );
        assert_eq!(run.data.get("error-info.kind").unwrap(), "client_error");
        assert_eq!(run.data.get("error-info.step").unwrap(), "submit");
        assert!(!run.start_in_flight);
    }

    #[tokio::test]
    async fn first_matching_choice_wins() {
        let yaml = r#"
name: chooser
start_at: pick
steps:
  - name: pick
    type: branch
    choices:
      - when: { op: is_present, path: flag }
        next: a
      - when: { op: is_present, path: flag }
        next: b
    default: c
  - name: a
    type: succeed
  - name: b
    type: succeed
  - name: c
    type: succeed
"#;
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({ "flag": true }), None).unwrap();

        assert!(matches!(
            engine.advance(&def, &mut run).await,
            StepOutcome::Advanced { ref to, .. } if to == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn loops_stop_at_max_visits() {
        let yaml = r#"
name: looper
start_at: hold
steps:
  - name: hold
    type: wait
    seconds: 1
    next: check
    max_visits: 3
  - name: check
    type: branch
    choices:
      - when: { op: is_present, path: ready }
        next: done
    default: hold
  - name: done
    type: succeed
"#;
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({}), None).unwrap();

        let outcome = engine
            .run_to_completion(&def, &mut run, CancellationToken::new())
            .await;

        assert!(matches!(outcome, StepOutcome::Failed { kind: FailureKind::ExhaustedRetries, .. }));
        assert_eq!(run.visits_of("hold"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_poll_branch_loop_is_bounded() {
        let yaml = r#"
name: watcher
start_at: submit
steps:
  - name: submit
    type: start_job
    job: etl
    next: hold
  - name: hold
    type: wait
    seconds: 5
    next: status
    max_visits: 3
  - name: status
    type: poll_job
    handle_path: submit
    next: check
  - name: check
    type: branch
    choices:
      - when: { op: is_present, path: ready }
        next: done
    default: hold
  - name: done
    type: succeed
"#;
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({}), None).unwrap();

        let outcome = engine
            .run_to_completion(&def, &mut run, CancellationToken::new())
            .await;

        assert!(matches!(outcome, StepOutcome::Failed { kind: FailureKind::ExhaustedRetries, .. }));
        assert_eq!(run.visits_of("status"), 3);
        assert_eq!(client.started().len(), 1);
        // One start plus one status call per loop iteration.
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn interrupted_start_is_failed_on_resume() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);
        let mut run = engine.start(&def, input(), None).unwrap();

        assert!(engine.prepare_dispatch(&def, &mut run));
        assert!(run.start_in_flight);

        let outcome = engine.resume(&def, &mut run).await;
        assert!(matches!(
            outcome,
            Some(StepOutcome::Failed { kind: FailureKind::ClientError, ref reason }) if reason.contains("start interrupted")
        ));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn resume_is_a_no_op_for_a_clean_run() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let def = def(PIPELINE_YAML);
        let mut run = engine.start(&def, input(), None).unwrap();

        assert!(engine.resume(&def, &mut run).await.is_none());
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_errors_are_retried_then_recorded() {
        let yaml = "{ name: quick, start_at: done, steps: [ { name: done, type: succeed } ] }";
        let client = ScriptedJobClient::new();
        let def = def(yaml);

        let flaky = CountingCallbacks::new().failing_first(1);
        let engine_a = engine(&client, &flaky);
        let mut run = engine_a.start(&def, json!({ "a": 1 }), token()).unwrap();
        assert_eq!(engine_a.advance(&def, &mut run).await, StepOutcome::Succeeded);
        assert_eq!(flaky.calls(), 2);
        assert!(run.callback_error.is_none());

        let down = CountingCallbacks::new().failing_first(100);
        let engine_b = engine(&client, &down);
        let mut run = engine_b.start(&def, json!({ "a": 1 }), token()).unwrap();
        assert_eq!(engine_b.advance(&def, &mut run).await, StepOutcome::Succeeded);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.notified);
        assert!(run.callback_error.is_some());
    }

    #[test]
    fn start_rejects_non_object_run_data() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let err = engine.start(&def(PIPELINE_YAML), json!([1, 2]), None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRunData(_)));
    }

    #[test]
    fn start_rejects_invalid_definition() {
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let engine = engine(&client, &callbacks);
        let broken = def(&PIPELINE_YAML.replace("default: reject", "default: nowhere"));
        assert!(matches!(
            engine.start(&broken, json!({}), None),
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_lifecycle_events() {
        let yaml = "{ name: quick, start_at: done, steps: [ { name: done, type: succeed } ] }";
        let client = ScriptedJobClient::new();
        let callbacks = CountingCallbacks::new();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let engine = engine(&client, &callbacks).with_event_bus(bus);
        let def = def(yaml);
        let mut run = engine.start(&def, json!({}), token()).unwrap();

        engine.advance(&def, &mut run).await;

        let mut seen = Vec::new();
        let last = rx.until_terminal(|e| seen.push(e.clone())).await;
        assert!(matches!(seen[0], WorkflowEvent::RunStarted { .. }));
        assert!(matches!(seen[1], WorkflowEvent::StepStarted { .. }));
        assert!(matches!(last, Some(WorkflowEvent::RunSucceeded { steps_taken: 0, .. })));
        assert!(matches!(
            rx.next().await,
            Some(Received::Event(WorkflowEvent::CallbackDelivered { first_delivery: true, .. }))
        ));
    }
}
