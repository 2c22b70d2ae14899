//! In-memory callback channel.

use std::collections::BTreeMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jobflow_types::run::CallbackToken;

use super::channel::{CallbackChannel, CallbackError, Delivery};

/// A terminal result received for a token.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackRecord {
    Success(BTreeMap<String, String>),
    Failure(String),
}

/// `CallbackChannel` that stores the first result per token in memory.
///
/// Used by one-shot CLI runs and by embedders that read results directly.
#[derive(Debug, Default)]
pub struct RecordingCallbackChannel {
    records: DashMap<String, CallbackRecord>,
}

impl RecordingCallbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded result for `token`, if any.
    pub fn get(&self, token: &str) -> Option<CallbackRecord> {
        self.records.get(token).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record(&self, token: &CallbackToken, record: CallbackRecord) -> Delivery {
        match self.records.entry(token.as_str().to_string()) {
            Entry::Occupied(_) => Delivery::AlreadyConsumed,
            Entry::Vacant(slot) => {
                slot.insert(record);
                Delivery::Delivered
            }
        }
    }
}

impl CallbackChannel for RecordingCallbackChannel {
    async fn success(
        &self,
        token: &CallbackToken,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Delivery, CallbackError> {
        Ok(self.record(token, CallbackRecord::Success(outputs.clone())))
    }

    async fn failure(&self, token: &CallbackToken, reason: &str) -> Result<Delivery, CallbackError> {
        Ok(self.record(token, CallbackRecord::Failure(reason.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_result_wins() {
        let channel = RecordingCallbackChannel::new();
        let token = CallbackToken::new("t-1");
        let outputs = BTreeMap::from([("accuracy".to_string(), "0.95".to_string())]);

        assert_eq!(channel.success(&token, &outputs).await.unwrap(), Delivery::Delivered);
        assert_eq!(
            channel.failure(&token, "late failure").await.unwrap(),
            Delivery::AlreadyConsumed
        );
        assert_eq!(channel.get("t-1"), Some(CallbackRecord::Success(outputs)));
        assert_eq!(channel.len(), 1);
    }
}
