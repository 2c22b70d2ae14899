//! `JobClient` over the generic job-service REST contract.
//!
//! - `POST {endpoint}/jobs/{job}/runs` with `{"parameters": {..}}` returns `{"run_id": ".."}`
//! - `GET {endpoint}/jobs/{job}/runs/{run_id}` returns a `JobStatus`
//! - `POST {endpoint}/jobs/{job}/runs/{run_id}/cancel` is best-effort

use std::collections::BTreeMap;
use std::time::Duration;

use jobflow_core::job::{JobClient, JobClientError};
use jobflow_types::job::{JobHandle, JobStatus};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{endpoint_url, parse_endpoint};

#[derive(Serialize)]
struct StartRequest<'a> {
    parameters: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StartResponse {
    run_id: String,
}

/// HTTP job service client.
#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpJobClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, JobClientError> {
        let endpoint = parse_endpoint(endpoint).map_err(JobClientError::Request)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobClientError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    fn runs_url(&self, job_name: &str) -> Url {
        endpoint_url(&self.endpoint, &["jobs", job_name, "runs"])
    }

    fn run_url(&self, handle: &JobHandle, tail: &[&str]) -> Url {
        let mut segments = vec!["jobs", handle.job_name.as_str(), "runs", handle.run_id.as_str()];
        segments.extend_from_slice(tail);
        endpoint_url(&self.endpoint, &segments)
    }
}

/// Map a non-success response to the matching client error.
async fn reject(job: &str, response: reqwest::Response) -> JobClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    if status == 404 {
        JobClientError::UnknownJob(job.to_string())
    } else {
        JobClientError::Rejected { status, body }
    }
}

fn transport(e: reqwest::Error) -> JobClientError {
    JobClientError::Request(e.to_string())
}

impl JobClient for HttpJobClient {
    async fn start(
        &self,
        job_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<JobHandle, JobClientError> {
        let response = self
            .client
            .post(self.runs_url(job_name))
            .json(&StartRequest { parameters })
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(reject(job_name, response).await);
        }

        let body: StartResponse = response
            .json()
            .await
            .map_err(|e| JobClientError::InvalidResponse(e.to_string()))?;
        tracing::debug!(job = job_name, run_id = %body.run_id, "job started");
        Ok(JobHandle::new(job_name, body.run_id))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, JobClientError> {
        let response = self
            .client
            .get(self.run_url(handle, &[]))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(reject(&handle.to_string(), response).await);
        }

        response
            .json()
            .await
            .map_err(|e| JobClientError::InvalidResponse(e.to_string()))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobClientError> {
        let response = self
            .client
            .post(self.run_url(handle, &["cancel"]))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(reject(&handle.to_string(), response).await);
        }
        Ok(())
    }
}
