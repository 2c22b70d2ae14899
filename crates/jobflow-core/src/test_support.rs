//! Scripted test doubles for the job and callback capabilities.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jobflow_types::job::{JobHandle, JobStatus};
use jobflow_types::run::CallbackToken;

use crate::callback::{CallbackChannel, CallbackError, CallbackRecord, Delivery, RecordingCallbackChannel};
use crate::job::{JobClient, JobClientError};

type StatusScript = VecDeque<Result<JobStatus, String>>;

#[derive(Default)]
struct ScriptState {
    statuses: Mutex<HashMap<String, StatusScript>>,
    start_error: Mutex<Option<String>>,
    started: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    cancelled: Mutex<Vec<JobHandle>>,
    calls: AtomicUsize,
}

/// `JobClient` that answers from per-job scripts.
///
/// Each status call pops the next scripted answer for the job; the last
/// answer repeats once the script runs out. Jobs without a script report
/// `Succeeded` with no outputs. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedJobClient {
    state: Arc<ScriptState>,
}

impl ScriptedJobClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(self, job: &str, script: Vec<Result<JobStatus, String>>) -> Self {
        if let Ok(mut statuses) = self.state.statuses.lock() {
            statuses.insert(job.to_string(), script.into());
        }
        self
    }

    /// Script `Running` `running` times, then `Succeeded` with `outputs`.
    pub fn succeed_after(self, job: &str, running: usize, outputs: &[(&str, &str)]) -> Self {
        let mut script: Vec<Result<JobStatus, String>> =
            (0..running).map(|_| Ok(JobStatus::running())).collect();
        let outputs = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        script.push(Ok(JobStatus::succeeded(outputs)));
        self.with_statuses(job, script)
    }

    pub fn fail_starts(self, reason: &str) -> Self {
        if let Ok(mut err) = self.state.start_error.lock() {
            *err = Some(reason.to_string());
        }
        self
    }

    /// Every `start` call so far: job name and parameters.
    pub fn started(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.state.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Total calls of any kind.
    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

impl JobClient for ScriptedJobClient {
    async fn start(
        &self,
        job_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<JobHandle, JobClientError> {
        let n = self.state.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.state.start_error.lock().unwrap().clone() {
            return Err(JobClientError::Rejected {
                status: 500,
                body: reason,
            });
        }
        self.state
            .started
            .lock()
            .unwrap()
            .push((job_name.to_string(), parameters.clone()));
        Ok(JobHandle::new(job_name, format!("{job_name}-run-{n}")))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, JobClientError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.state.statuses.lock().unwrap();
        let answer = match statuses.get_mut(&handle.job_name) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        match answer {
            Some(Ok(status)) => Ok(status),
            Some(Err(e)) => Err(JobClientError::Request(e)),
            None => Ok(JobStatus::succeeded(BTreeMap::new())),
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobClientError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.cancelled.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

#[derive(Default)]
struct CountingState {
    recorded: RecordingCallbackChannel,
    calls: AtomicU32,
    fail_first: AtomicU32,
}

/// Callback channel that counts calls and can fail the first N of them.
/// Clones share state.
#[derive(Clone, Default)]
pub struct CountingCallbacks {
    state: Arc<CountingState>,
}

impl CountingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(self, n: u32) -> Self {
        self.state.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn record(&self, token: &str) -> Option<CallbackRecord> {
        self.state.recorded.get(token)
    }

    fn transport_fault(&self) -> Option<CallbackError> {
        let n = self.state.calls.fetch_add(1, Ordering::SeqCst);
        (n < self.state.fail_first.load(Ordering::SeqCst))
            .then(|| CallbackError::Transport("receiver unavailable".into()))
    }
}

impl CallbackChannel for CountingCallbacks {
    async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        if let Some(e) = self.transport_fault() {
            return Err(e);
        }
        self.state.recorded.success(token, outputs).await
    }

    async fn failure(&self, token: &CallbackToken, reason: &str) -> Result<Delivery, CallbackError> {
        if let Some(e) = self.transport_fault() {
            return Err(e);
        }
        self.state.recorded.failure(token, reason).await
    }
}
