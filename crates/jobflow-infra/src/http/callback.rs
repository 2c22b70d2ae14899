//! `CallbackChannel` that posts terminal results to an HTTP receiver.
//!
//! - `POST {endpoint}/callbacks/{token}/success` with `{"outputs": {..}}`
//! - `POST {endpoint}/callbacks/{token}/failure` with `{"reason": ".."}`
//!
//! A 409 or 410 answer means the token was already consumed.

use std::collections::BTreeMap;
use std::time::Duration;

use jobflow_core::callback::{CallbackChannel, CallbackError, Delivery};
use jobflow_types::run::CallbackToken;
use reqwest::{StatusCode, Url};
use serde::Serialize;

use super::{endpoint_url, parse_endpoint};

#[derive(Serialize)]
struct SuccessBody<'a> {
    outputs: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct FailureBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpCallbackChannel {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpCallbackChannel {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CallbackError> {
        let endpoint = parse_endpoint(endpoint).map_err(CallbackError::Transport)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    async fn post<B: Serialize>(
        &self,
        token: &CallbackToken,
        outcome: &str,
        body: &B,
    ) -> Result<Delivery, CallbackError> {
        let url = endpoint_url(&self.endpoint, &["callbacks", token.as_str(), outcome]);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Delivery::Delivered);
        }
        if status == StatusCode::CONFLICT || status == StatusCode::GONE {
            return Ok(Delivery::AlreadyConsumed);
        }
        Err(CallbackError::Rejected {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

impl CallbackChannel for HttpCallbackChannel {
    async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        self.post(token, "success", &SuccessBody { outputs }).await
    }

    async fn failure(&self, token: &CallbackToken, reason: &str) -> Result<Delivery, CallbackError> {
        self.post(token, "failure", &FailureBody { reason }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn channel(server: &MockServer) -> HttpCallbackChannel {
        HttpCallbackChannel::new(&server.base_url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn success_posts_outputs() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/callbacks/tok-1/success")
                    .json_body(json!({ "outputs": { "accuracy": "0.95" } }));
                then.status(204);
            })
            .await;

        let outputs = BTreeMap::from([("accuracy".to_string(), "0.95".to_string())]);
        let delivery = channel(&server)
            .success(&CallbackToken::new("tok-1"), &outputs)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(delivery, Delivery::Delivered);
    }

    #[tokio::test]
    async fn failure_posts_reason() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/callbacks/tok-2/failure")
                    .json_body(json!({ "reason": "low accuracy" }));
                then.status(200);
            })
            .await;

        let delivery = channel(&server)
            .failure(&CallbackToken::new("tok-2"), "low accuracy")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(delivery, Delivery::Delivered);
    }

    #[tokio::test]
    async fn consumed_token_is_not_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/callbacks/used/failure");
                then.status(410);
            })
            .await;

        let delivery = channel(&server)
            .failure(&CallbackToken::new("used"), "x")
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::AlreadyConsumed);
    }

    #[tokio::test]
    async fn server_error_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/callbacks/tok/success");
                then.status(503).body("down");
            })
            .await;

        let err = channel(&server)
            .success(&CallbackToken::new("tok"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Rejected { status: 503, .. }));
    }
}
