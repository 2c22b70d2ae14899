//! CallbackChannel trait definition.

use std::collections::BTreeMap;

use jobflow_types::run::CallbackToken;

/// Result of handing a terminal signal to a callback channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was accepted and the token is now consumed.
    Delivered,
    /// The token had already been consumed. Nothing changed.
    AlreadyConsumed,
}

/// Transport failure while delivering a callback.
///
/// An already-consumed token is not an error; see [`Delivery::AlreadyConsumed`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    #[error("callback transport failed: {0}")]
    Transport(String),

    #[error("callback receiver returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Capability for delivering a run's terminal result to its initiator.
///
/// Implementations must tolerate a consumed token by returning
/// `Ok(Delivery::AlreadyConsumed)` without side effects.
pub trait CallbackChannel: Send + Sync {
    fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<Delivery, CallbackError>> + Send;

    fn failure(
        &self,
        token: &CallbackToken,
        reason: &str,
    ) -> impl std::future::Future<Output = Result<Delivery, CallbackError>> + Send;
}
