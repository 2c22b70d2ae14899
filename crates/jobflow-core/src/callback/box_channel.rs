//! BoxCallbackChannel -- object-safe dynamic dispatch wrapper for CallbackChannel.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use jobflow_types::run::CallbackToken;

use super::channel::{CallbackChannel, CallbackError, Delivery};

/// Object-safe version of [`CallbackChannel`] with boxed futures.
pub trait CallbackChannelDyn: Send + Sync {
    fn success_boxed<'a>(
        &'a self,
        token: &'a CallbackToken,
        outputs: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<Delivery, CallbackError>>;

    fn failure_boxed<'a>(
        &'a self,
        token: &'a CallbackToken,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<Delivery, CallbackError>>;
}

impl<T: CallbackChannel> CallbackChannelDyn for T {
    fn success_boxed<'a>(
        &'a self,
        token: &'a CallbackToken,
        outputs: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<Delivery, CallbackError>> {
        Box::pin(self.success(token, outputs))
    }

    fn failure_boxed<'a>(
        &'a self,
        token: &'a CallbackToken,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<Delivery, CallbackError>> {
        Box::pin(self.failure(token, reason))
    }
}

/// Type-erased callback channel. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct BoxCallbackChannel {
    inner: Arc<dyn CallbackChannelDyn>,
}

impl BoxCallbackChannel {
    pub fn new<T: CallbackChannel + 'static>(channel: T) -> Self {
        Self {
            inner: Arc::new(channel),
        }
    }

    /// Wrap an already shared channel, keeping the caller's handle usable.
    pub fn from_arc<T: CallbackChannel + 'static>(channel: Arc<T>) -> Self {
        Self { inner: channel }
    }

    pub async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        self.inner.success_boxed(token, outputs).await
    }

    pub async fn failure(
        &self,
        token: &CallbackToken,
        reason: &str,
    ) -> Result<Delivery, CallbackError> {
        self.inner.failure_boxed(token, reason).await
    }
}

impl std::fmt::Debug for BoxCallbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCallbackChannel").finish_non_exhaustive()
    }
}
