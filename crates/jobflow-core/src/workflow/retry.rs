//! Retry and backoff policy for step execution.
//!
//! Stateless: every decision is a function of the engine configuration and
//! the counters stored on the run, so a recovered run resumes with the same
//! policy it had before.

use std::time::Duration;

use super::engine::EngineConfig;

/// Stateless retry policy.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a poll step may retry after its `failures`-th consecutive
    /// status-call failure (1-based).
    pub fn should_retry_client_error(config: &EngineConfig, failures: u32) -> bool {
        failures <= config.client_error_retries
    }

    /// Delay before the next status call after `failures` consecutive
    /// failures: `base * 2^(failures - 1)`, capped at `backoff_max`.
    pub fn backoff_delay(config: &EngineConfig, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = config.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(config.backoff_max)
    }

    /// Whether a poll step has used up its status-poll budget. `attempt`
    /// counts `Running` answers seen so far at this step.
    pub fn poll_exhausted(max_attempts: u32, attempt: u32) -> bool {
        attempt >= max_attempts
    }
}
