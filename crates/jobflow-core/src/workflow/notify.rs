//! Terminal notification: delivering a run's result to its callback token.

use std::collections::BTreeMap;

use jobflow_types::run::CallbackToken;

use crate::callback::{BoxCallbackChannel, Delivery};

use super::engine::EngineConfig;
use super::retry::RetryHandler;

/// What to tell the callback.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Success(&'a BTreeMap<String, String>),
    Failure(&'a str),
}

/// Outcome of a notification attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    /// The token was consumed by this delivery.
    Delivered,
    /// The token had already been consumed. Not an error.
    AlreadyConsumed,
    /// The run has no token; nothing to deliver.
    NoToken,
    /// Every attempt failed; the last error.
    Failed(String),
}

/// Delivers terminal signals with bounded retries on transport errors.
pub struct Notifier {
    callbacks: BoxCallbackChannel,
    config: EngineConfig,
}

impl Notifier {
    pub fn new(callbacks: BoxCallbackChannel, config: EngineConfig) -> Self {
        Self { callbacks, config }
    }

    pub async fn deliver(&self, token: Option<&CallbackToken>, signal: Signal<'_>) -> NotifyOutcome {
        let Some(token) = token else {
            return NotifyOutcome::NoToken;
        };

        let attempts = self.config.callback_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let result = match signal {
                Signal::Success(outputs) => self.callbacks.success(token, outputs).await,
                Signal::Failure(reason) => self.callbacks.failure(token, reason).await,
            };
            match result {
                Ok(Delivery::Delivered) => return NotifyOutcome::Delivered,
                Ok(Delivery::AlreadyConsumed) => {
                    tracing::warn!(token = %token, "callback token already consumed, skipping");
                    return NotifyOutcome::AlreadyConsumed;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = RetryHandler::backoff_delay(&self.config, attempt);
                        tracing::warn!(
                            token = %token,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "callback delivery failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(token = %token, attempts, error = %last_error, "callback delivery failed");
        NotifyOutcome::Failed(last_error)
    }
}
