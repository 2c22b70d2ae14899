//! At-most-once callback delivery over any channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jobflow_types::run::CallbackToken;
use tokio::time::Instant;

use super::channel::{CallbackChannel, CallbackError, Delivery};

/// How long a consumed token is remembered by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Expired tokens are swept once every this many claims.
const PRUNE_EVERY: u64 = 256;

/// Wraps a [`CallbackChannel`] so each token reaches it at most once.
///
/// A token is claimed before the inner call and released again if the inner
/// call fails, so a transport error can be retried while concurrent or late
/// duplicates are absorbed as [`Delivery::AlreadyConsumed`]. Consumed tokens
/// are forgotten after the retention window.
#[derive(Debug)]
pub struct IdempotentCallbacks<C> {
    inner: C,
    consumed: DashMap<String, Instant>,
    retention: Duration,
    claims: AtomicU64,
}

impl<C: CallbackChannel> IdempotentCallbacks<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            consumed: DashMap::new(),
            retention: DEFAULT_RETENTION,
            claims: AtomicU64::new(0),
        }
    }

    /// Remember consumed tokens for `retention` instead of the default.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn is_consumed(&self, token: &CallbackToken) -> bool {
        self.consumed
            .get(token.as_str())
            .is_some_and(|at| at.elapsed() < self.retention)
    }

    /// Number of tokens currently remembered, expired ones included.
    pub fn tracked(&self) -> usize {
        self.consumed.len()
    }

    fn claim(&self, token: &CallbackToken) -> bool {
        let now = Instant::now();
        let claimed = match self.consumed.entry(token.as_str().to_string()) {
            Entry::Occupied(mut seen) if now.duration_since(*seen.get()) >= self.retention => {
                seen.insert(now);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if claimed {
            self.prune(now);
        } else {
            tracing::warn!(token = %token, "duplicate callback ignored: token already consumed");
        }
        claimed
    }

    fn prune(&self, now: Instant) {
        if self.claims.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY != PRUNE_EVERY - 1 {
            return;
        }
        let before = self.consumed.len();
        self.consumed
            .retain(|_, at| now.duration_since(*at) < self.retention);
        tracing::debug!(
            expired = before.saturating_sub(self.consumed.len()),
            "pruned consumed callback tokens"
        );
    }

    fn settle(
        &self,
        token: &CallbackToken,
        result: Result<Delivery, CallbackError>,
    ) -> Result<Delivery, CallbackError> {
        if result.is_err() {
            self.consumed.remove(token.as_str());
        }
        result
    }
}

impl<C: CallbackChannel> CallbackChannel for IdempotentCallbacks<C> {
    async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        if !self.claim(token) {
            return Ok(Delivery::AlreadyConsumed);
        }
        let result = self.inner.success(token, outputs).await;
        self.settle(token, result)
    }

    async fn failure(&self, token: &CallbackToken, reason: &str) -> Result<Delivery, CallbackError> {
        if !self.claim(token) {
            return Ok(Delivery::AlreadyConsumed);
        }
        let result = self.inner.failure(token, reason).await;
        self.settle(token, result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Counts calls and fails the first `fail_first` of them.
    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CallbackChannel for Counting {
        async fn success(
            &self,
            _token: &CallbackToken,
            _outputs: &BTreeMap<String, String>,
        ) -> Result<Delivery, CallbackError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(CallbackError::Transport("connection reset".into()));
            }
            Ok(Delivery::Delivered)
        }

        async fn failure(
            &self,
            token: &CallbackToken,
            _reason: &str,
        ) -> Result<Delivery, CallbackError> {
            self.success(token, &BTreeMap::new()).await
        }
    }

    #[tokio::test]
    async fn duplicate_success_reaches_inner_once() {
        let channel = IdempotentCallbacks::new(Counting::default());
        let token = CallbackToken::new("tok");
        let outputs = BTreeMap::new();

        assert_eq!(channel.success(&token, &outputs).await.unwrap(), Delivery::Delivered);
        assert_eq!(
            channel.success(&token, &outputs).await.unwrap(),
            Delivery::AlreadyConsumed
        );
        assert_eq!(channel.inner().calls.load(Ordering::SeqCst), 1);
        assert!(channel.is_consumed(&token));
    }

    #[tokio::test]
    async fn failed_delivery_releases_token() {
        let channel = IdempotentCallbacks::new(Counting {
            fail_first: 1,
            ..Default::default()
        });
        let token = CallbackToken::new("tok");

        assert!(channel.failure(&token, "boom").await.is_err());
        assert!(!channel.is_consumed(&token));
        assert_eq!(channel.failure(&token, "boom").await.unwrap(), Delivery::Delivered);
        assert_eq!(channel.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_are_forgotten_after_retention() {
        let channel = IdempotentCallbacks::new(Counting::default())
            .with_retention(Duration::from_secs(60));
        let token = CallbackToken::new("tok");
        let outputs = BTreeMap::new();

        channel.success(&token, &outputs).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(channel.is_consumed(&token));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!channel.is_consumed(&token));
        assert_eq!(channel.success(&token, &outputs).await.unwrap(), Delivery::Delivered);
        assert_eq!(channel.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_tokens_are_pruned() {
        let channel = IdempotentCallbacks::new(Counting::default())
            .with_retention(Duration::from_secs(60));
        let outputs = BTreeMap::new();

        channel.success(&CallbackToken::new("old"), &outputs).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        for i in 0..PRUNE_EVERY {
            let token = CallbackToken::new(format!("tok-{i}"));
            channel.success(&token, &outputs).await.unwrap();
        }

        assert_eq!(channel.tracked(), PRUNE_EVERY as usize);
        assert!(!channel.is_consumed(&CallbackToken::new("old")));
    }

    #[tokio::test]
    async fn distinct_tokens_are_independent() {
        let channel = IdempotentCallbacks::new(Counting::default());
        let outputs = BTreeMap::new();
        channel.success(&CallbackToken::new("a"), &outputs).await.unwrap();
        channel.success(&CallbackToken::new("b"), &outputs).await.unwrap();
        assert_eq!(channel.inner().calls.load(Ordering::SeqCst), 2);
    }
}
