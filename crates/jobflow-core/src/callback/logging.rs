//! Log-only callback channel.

use std::collections::BTreeMap;

use jobflow_types::run::CallbackToken;

use super::channel::{CallbackChannel, CallbackError, Delivery};

/// `CallbackChannel` that only writes terminal results to the log.
///
/// Used by the server when no callback endpoint is configured, so results
/// are visible without being held in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbackChannel;

impl CallbackChannel for LoggingCallbackChannel {
    async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        tracing::info!(token = %token, outputs = ?outputs, "run succeeded");
        Ok(Delivery::Delivered)
    }

    async fn failure(&self, token: &CallbackToken, reason: &str) -> Result<Delivery, CallbackError> {
        tracing::info!(token = %token, reason, "run failed");
        Ok(Delivery::Delivered)
    }
}
