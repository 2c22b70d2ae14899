//! The inbound trigger boundary.

use serde::{Deserialize, Serialize};

use crate::run::CallbackToken;

/// An inbound request to start a workflow run.
///
/// Transport-agnostic: the HTTP endpoint, the CLI, and embedders all build
/// one of these. Field names are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub workflow_name: String,
    /// Seed for the run's data. Must be a JSON object.
    #[serde(default = "empty_object")]
    pub initial_run_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<CallbackToken>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TriggerEvent {
    pub fn new(workflow_name: impl Into<String>, initial_run_data: serde_json::Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            initial_run_data,
            callback_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.callback_token = Some(CallbackToken::new(token));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_wire_format() {
        let json = r#"{
            "workflowName": "glue-preprocess",
            "initialRunData": {"input": {"dir": "s3://raw"}},
            "callbackToken": "AAAA-token"
        }"#;
        let event: TriggerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.workflow_name, "glue-preprocess");
        assert_eq!(event.initial_run_data["input"]["dir"], "s3://raw");
        assert_eq!(event.callback_token.unwrap().as_str(), "AAAA-token");
    }

    #[test]
    fn run_data_and_token_are_optional() {
        let event: TriggerEvent = serde_json::from_str(r#"{"workflowName":"watch"}"#).unwrap();
        assert!(event.initial_run_data.as_object().unwrap().is_empty());
        assert!(event.callback_token.is_none());
    }
}
