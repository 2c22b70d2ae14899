//! Orchestrator: turns trigger events into concurrently running workflow runs.
//!
//! Each submitted run gets its own tokio task that loops
//! `advance -> checkpoint -> sleep` until the run is terminal. Waiting runs
//! hold only a timer. Cancellation goes through a per-run
//! `CancellationToken`; a per-workflow semaphore caps concurrent runs when a
//! definition sets `concurrency`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use jobflow_types::run::{StepLog, WorkflowRun};
use jobflow_types::trigger::TriggerEvent;
use jobflow_types::workflow::WorkflowDefinition;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::run::RunRepository;

use super::checkpoint::{CheckpointError, CheckpointManager, StepAttempt};
use super::engine::{EngineError, StepOutcome, WorkflowEngine};
use super::registry::WorkflowRegistry;
use super::step_executor::StepError;

/// Attempts at storing the final snapshot of a run whose checkpoint failed.
const FINAL_PERSIST_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("concurrency limit reached for workflow '{0}'")]
    ConcurrencyLimitReached(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs workflows in the background. Cloning shares the same state.
pub struct Orchestrator<R: RunRepository> {
    inner: Arc<Inner<R>>,
}

impl<R: RunRepository> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<R: RunRepository> {
    engine: WorkflowEngine,
    checkpoint: CheckpointManager<R>,
    registry: Arc<WorkflowRegistry>,
    /// Per-workflow concurrency semaphores keyed by workflow name.
    semaphores: DashMap<String, Arc<Semaphore>>,
    /// Cancellation tokens of live runs, keyed by run id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    /// Flipped to `true` when a live run's task finishes.
    completions: DashMap<Uuid, watch::Receiver<bool>>,
}

impl<R: RunRepository + 'static> Orchestrator<R> {
    pub fn new(engine: WorkflowEngine, repo: Arc<R>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                checkpoint: CheckpointManager::new(repo),
                registry,
                semaphores: DashMap::new(),
                cancellation_tokens: DashMap::new(),
                completions: DashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    /// Start a run for `trigger` and return its id. The run proceeds in the
    /// background.
    pub async fn submit(&self, trigger: TriggerEvent) -> Result<Uuid, OrchestratorError> {
        let def = self
            .inner
            .registry
            .get(&trigger.workflow_name)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(trigger.workflow_name.clone()))?;

        let permit = self.inner.try_acquire(&def)?;
        let run = self
            .inner
            .engine
            .start(&def, trigger.initial_run_data, trigger.callback_token)?;
        self.inner.checkpoint.create(&run).await?;

        let run_id = run.id;
        self.spawn(def, run, permit);
        Ok(run_id)
    }

    /// Request cancellation. Returns `false` when the run is unknown or
    /// already terminal.
    ///
    /// A live run stops at its next step boundary (or immediately, if it is
    /// sleeping). A stored run that is not live is flagged and finalized on
    /// the next `recover`.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, OrchestratorError> {
        if let Some(token) = self.inner.cancellation_tokens.get(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(true);
        }

        let mut run = match self.inner.checkpoint.restore(run_id).await {
            Ok(run) => run,
            Err(CheckpointError::RunNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if run.is_terminal() {
            return Ok(false);
        }
        run.request_cancel();
        self.inner.checkpoint.persist(&run).await?;
        tracing::info!(run_id = %run_id, "flagged stored run for cancellation");
        Ok(true)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, OrchestratorError> {
        match self.inner.checkpoint.restore(run_id).await {
            Ok(run) => Ok(Some(run)),
            Err(CheckpointError::RunNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, OrchestratorError> {
        self.inner
            .checkpoint
            .repo()
            .list_runs(workflow_name, limit)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()).into())
    }

    pub async fn step_logs(&self, run_id: Uuid) -> Result<Vec<StepLog>, OrchestratorError> {
        self.inner
            .checkpoint
            .repo()
            .list_step_logs(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()).into())
    }

    /// Whether the run has a live task in this process.
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.inner.cancellation_tokens.contains_key(&run_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.cancellation_tokens.len()
    }

    /// Wait for a live run to finish and return its final snapshot.
    /// Returns the stored snapshot immediately if the run is not live.
    pub async fn wait(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, OrchestratorError> {
        let receiver = self.inner.completions.get(&run_id).map(|r| r.clone());
        if let Some(mut rx) = receiver {
            // A dropped sender means the task is gone; the snapshot is final.
            let _ = rx.wait_for(|done| *done).await;
        }
        self.get_run(run_id).await
    }

    /// Resume every non-terminal run found in storage. Returns how many
    /// were resumed.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let runs = self.inner.checkpoint.active_runs().await?;
        let mut resumed = 0;
        for mut run in runs {
            if self.is_active(run.id) {
                continue;
            }
            let Some(def) = self.inner.registry.get(&run.workflow_name) else {
                tracing::error!(
                    run_id = %run.id,
                    workflow = %run.workflow_name,
                    "workflow definition no longer loaded; failing run"
                );
                let before = StepAttempt::of(&run);
                let err = StepError::Definition(format!(
                    "workflow '{}' is not loaded",
                    run.workflow_name
                ));
                let outcome = self.inner.engine.abort(&mut run, err).await;
                self.inner.checkpoint.record(&run, before, &outcome).await?;
                continue;
            };
            if def.version != run.workflow_version {
                tracing::warn!(
                    run_id = %run.id,
                    stored = %run.workflow_version,
                    loaded = %def.version,
                    "resuming run against a different workflow version"
                );
            }

            // Recovered runs were admitted before the restart, so they are
            // resumed even when the limit is currently exhausted.
            let permit = self.inner.try_acquire(&def).unwrap_or_else(|_| {
                tracing::warn!(run_id = %run.id, "resuming run above the concurrency limit");
                None
            });
            tracing::info!(run_id = %run.id, step = %run.current_step, "resuming run");
            self.spawn(def, run, permit);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn spawn(
        &self,
        def: Arc<WorkflowDefinition>,
        run: WorkflowRun,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.cancellation_tokens.insert(run.id, cancel.clone());
        self.inner.completions.insert(run.id, done_rx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut run = run;
            let run_id = run.id;
            if let Err(e) = inner.drive(&def, &mut run, &cancel).await {
                tracing::error!(run_id = %run_id, error = %e, "run checkpoint failed");
                inner.fail_unrecorded(&mut run, &e).await;
            }
            inner.cancellation_tokens.remove(&run_id);
            drop(permit);
            let _ = done_tx.send(true);
            inner.completions.remove(&run_id);
        });
    }
}

impl<R: RunRepository> Inner<R> {
    fn try_acquire(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<Option<OwnedSemaphorePermit>, OrchestratorError> {
        let Some(max) = def.concurrency else {
            return Ok(None);
        };
        let semaphore = self
            .semaphores
            .entry(def.name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(max as usize)))
            .clone();
        semaphore
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| OrchestratorError::ConcurrencyLimitReached(def.name.clone()))
    }

    /// Advance `run` to a terminal state, checkpointing after every step.
    async fn drive(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        let before = StepAttempt::of(run);
        if let Some(outcome) = self.engine.resume(def, run).await {
            self.checkpoint.record(run, before, &outcome).await?;
        }
        if run.is_terminal() {
            return self.checkpoint.persist(run).await;
        }

        // A recovered run may still owe part of its wait.
        if let Some(remaining) = run.remaining_wait(Utc::now()) {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => run.wake(),
                _ = cancel.cancelled() => run.request_cancel(),
            }
        }

        loop {
            if cancel.is_cancelled() {
                run.request_cancel();
            }
            if self.engine.prepare_dispatch(def, run) {
                self.checkpoint.persist(run).await?;
            }

            let before = StepAttempt::of(run);
            let outcome = self.engine.advance(def, run).await;
            self.checkpoint.record(run, before, &outcome).await?;

            match outcome {
                StepOutcome::Waiting { resume_after, .. } => {
                    tokio::select! {
                        _ = tokio::time::sleep(resume_after) => run.wake(),
                        _ = cancel.cancelled() => run.request_cancel(),
                    }
                }
                StepOutcome::Succeeded | StepOutcome::Failed { .. } => return Ok(()),
                StepOutcome::Advanced { .. } => {}
            }
        }
    }

    /// Finalize a run whose checkpoint could not be written, so the caller
    /// still receives its terminal callback, then store the final snapshot
    /// if storage has recovered.
    async fn fail_unrecorded(&self, run: &mut WorkflowRun, err: &CheckpointError) {
        if !run.is_terminal() {
            let err = StepError::Storage(err.to_string());
            self.engine.abort(run, err).await;
        }

        for attempt in 1..=FINAL_PERSIST_ATTEMPTS {
            match self.checkpoint.persist(run).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        run_id = %run.id,
                        attempt,
                        error = %e,
                        "failed to store final run snapshot"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
            }
        }
        tracing::error!(
            run_id = %run.id,
            "final run snapshot not stored; it resumes from its last checkpoint on recovery"
        );
    }
}
