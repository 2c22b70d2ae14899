//! BoxJobClient -- object-safe dynamic dispatch wrapper for JobClient.
//!
//! 1. Define an object-safe `JobClientDyn` trait with boxed futures
//! 2. Blanket-impl `JobClientDyn` for all `T: JobClient`
//! 3. `BoxJobClient` wraps `Arc<dyn JobClientDyn>` and delegates

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use jobflow_types::job::{JobHandle, JobStatus};

use super::client::{JobClient, JobClientError};

/// Object-safe version of [`JobClient`] with boxed futures.
pub trait JobClientDyn: Send + Sync {
    fn start_boxed<'a>(
        &'a self,
        job_name: &'a str,
        parameters: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<JobHandle, JobClientError>>;

    fn status_boxed<'a>(
        &'a self,
        handle: &'a JobHandle,
    ) -> BoxFuture<'a, Result<JobStatus, JobClientError>>;

    fn cancel_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<(), JobClientError>>;
}

impl<T: JobClient> JobClientDyn for T {
    fn start_boxed<'a>(
        &'a self,
        job_name: &'a str,
        parameters: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<JobHandle, JobClientError>> {
        Box::pin(self.start(job_name, parameters))
    }

    fn status_boxed<'a>(
        &'a self,
        handle: &'a JobHandle,
    ) -> BoxFuture<'a, Result<JobStatus, JobClientError>> {
        Box::pin(self.status(handle))
    }

    fn cancel_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<(), JobClientError>> {
        Box::pin(self.cancel(handle))
    }
}

/// Type-erased job client shared by the engine and its runs.
///
/// Cloning shares the underlying client.
#[derive(Clone)]
pub struct BoxJobClient {
    inner: Arc<dyn JobClientDyn>,
}

impl BoxJobClient {
    pub fn new<T: JobClient + 'static>(client: T) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    /// Wrap an already shared client, keeping the caller's handle usable.
    pub fn from_arc<T: JobClient + 'static>(client: Arc<T>) -> Self {
        Self { inner: client }
    }

    pub async fn start(
        &self,
        job_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<JobHandle, JobClientError> {
        self.inner.start_boxed(job_name, parameters).await
    }

    pub async fn status(&self, handle: &JobHandle) -> Result<JobStatus, JobClientError> {
        self.inner.status_boxed(handle).await
    }

    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), JobClientError> {
        self.inner.cancel_boxed(handle).await
    }
}

impl std::fmt::Debug for BoxJobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxJobClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    impl JobClient for EchoClient {
        async fn start(
            &self,
            job_name: &str,
            parameters: &BTreeMap<String, String>,
        ) -> Result<JobHandle, JobClientError> {
            Ok(JobHandle::new(job_name, format!("run-{}", parameters.len())))
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus, JobClientError> {
            Ok(JobStatus::running())
        }
    }

    #[tokio::test]
    async fn delegates_to_inner_client() {
        let client = BoxJobClient::new(EchoClient);
        let params = BTreeMap::from([("a".to_string(), "1".to_string())]);
        let handle = client.start("etl", &params).await.unwrap();
        assert_eq!(handle, JobHandle::new("etl", "run-1"));
        assert!(!client.status(&handle).await.unwrap().state.is_terminal());
    }

    #[tokio::test]
    async fn default_cancel_is_a_no_op() {
        let client = BoxJobClient::new(EchoClient);
        assert!(client.cancel(&JobHandle::new("etl", "x")).await.is_ok());
    }
}
