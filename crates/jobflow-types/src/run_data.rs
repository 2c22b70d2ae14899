//! Run data: the mutable key-value state accumulated by a workflow run.
//!
//! Run data is a nested JSON object addressed with dot-separated paths
//! (`etl.outputs.accuracy`). A leading `$.` is accepted and ignored, so
//! paths written in the familiar JSONPath style resolve the same way.
//! Reading a missing path is always an error, never a silent default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum serialized size of a single merged step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum serialized size of a run's data (10 MB).
pub const MAX_RUN_DATA_SIZE: usize = 10_485_760;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunDataError {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("cannot write '{0}': an intermediate value is not an object")]
    PathConflict(String),

    #[error("run data must be a JSON object")]
    NotAnObject,

    #[error("size {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// The run's key-value store.
///
/// Always wraps a JSON object; construction from any other value fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunData(Value);

impl Default for RunData {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a path into segments, dropping a leading `$` root marker.
///
/// The empty path, `$`, and `$.` all address the root.
pub fn path_segments(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('$').unwrap_or(path);
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('.').collect()
}

/// Render a JSON value as a job parameter string.
///
/// Strings are passed verbatim; everything else is rendered as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl RunData {
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn from_value(value: Value) -> Result<Self, RunDataError> {
        match value {
            Value::Object(_) => Ok(Self(value)),
            _ => Err(RunDataError::NotAnObject),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Read the value at `path`.
    pub fn get(&self, path: &str) -> Result<&Value, RunDataError> {
        let mut current = &self.0;
        for segment in path_segments(path) {
            current = current
                .as_object()
                .and_then(|obj| obj.get(segment))
                .ok_or_else(|| RunDataError::MissingField(path.to_string()))?;
        }
        Ok(current)
    }

    /// Read the value at `path` rendered as a string (see [`value_to_string`]).
    pub fn get_string(&self, path: &str) -> Result<String, RunDataError> {
        self.get(path).map(value_to_string)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Write `value` at `path`, creating intermediate objects as needed.
    ///
    /// Writing the root replaces the whole store and requires an object.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), RunDataError> {
        let segments = path_segments(path);
        let Some((last, parents)) = segments.split_last() else {
            if !value.is_object() {
                return Err(RunDataError::NotAnObject);
            }
            self.0 = value;
            return Ok(());
        };
        let target = self.object_at_mut(parents, path)?;
        target.insert((*last).to_string(), value);
        Ok(())
    }

    /// Merge string entries into the object at `path` (root when `None`).
    ///
    /// Existing keys are overwritten; the target object is created if absent.
    pub fn merge_strings(
        &mut self,
        path: Option<&str>,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), RunDataError> {
        let segments = path.map(path_segments).unwrap_or_default();
        let target = self.object_at_mut(&segments, path.unwrap_or("$"))?;
        for (key, value) in entries {
            target.insert(key.clone(), Value::String(value.clone()));
        }
        Ok(())
    }

    /// Walk to (creating where absent) the object addressed by `segments`.
    fn object_at_mut(
        &mut self,
        segments: &[&str],
        path: &str,
    ) -> Result<&mut Map<String, Value>, RunDataError> {
        let mut current = &mut self.0;
        for segment in segments {
            let obj = current
                .as_object_mut()
                .ok_or_else(|| RunDataError::PathConflict(path.to_string()))?;
            current = obj
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        current
            .as_object_mut()
            .ok_or_else(|| RunDataError::PathConflict(path.to_string()))
    }

    /// Flatten leaves into dotted keys with stringified values.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        flatten_into(&self.0, String::new(), &mut out);
        out
    }

    /// Serialized size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }

    /// Fail when the serialized store exceeds [`MAX_RUN_DATA_SIZE`].
    pub fn check_size(&self) -> Result<(), RunDataError> {
        let size = self.size_bytes();
        if size > MAX_RUN_DATA_SIZE {
            return Err(RunDataError::TooLarge {
                size,
                limit: MAX_RUN_DATA_SIZE,
            });
        }
        Ok(())
    }
}

/// Fail when a single step output exceeds [`MAX_STEP_OUTPUT_SIZE`].
pub fn check_output_size(outputs: &BTreeMap<String, String>) -> Result<(), RunDataError> {
    let size: usize = outputs.iter().map(|(k, v)| k.len() + v.len()).sum();
    if size > MAX_STEP_OUTPUT_SIZE {
        return Err(RunDataError::TooLarge {
            size,
            limit: MAX_STEP_OUTPUT_SIZE,
        });
    }
    Ok(())
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let next = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, next, out);
            }
        }
        Value::Object(_) if prefix.is_empty() => {}
        leaf => {
            out.insert(prefix, value_to_string(leaf));
        }
    }
}

impl From<Map<String, Value>> for RunData {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RunData {
        RunData::from_value(json!({
            "input": { "dir": "s3://bucket/raw" },
            "etl": { "job_name": "etl", "run_id": "jr_1", "status": "Succeeded" },
            "accuracy": 0.95
        }))
        .unwrap()
    }

    #[test]
    fn reads_nested_paths_with_and_without_root_marker() {
        let data = sample();
        assert_eq!(data.get("input.dir").unwrap(), "s3://bucket/raw");
        assert_eq!(data.get("$.etl.status").unwrap(), "Succeeded");
        assert_eq!(data.get("$").unwrap(), data.as_value());
    }

    #[test]
    fn missing_path_is_an_error() {
        let data = sample();
        assert_eq!(
            data.get("etl.outputs.model").unwrap_err(),
            RunDataError::MissingField("etl.outputs.model".into())
        );
        // Descending through a leaf is also missing, not a panic.
        assert!(data.get("accuracy.value").is_err());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut data = RunData::new();
        data.set("train.outputs.model", json!("s3://models/1")).unwrap();
        assert_eq!(data.get("train.outputs.model").unwrap(), "s3://models/1");
    }

    #[test]
    fn set_through_leaf_conflicts() {
        let mut data = sample();
        assert!(matches!(
            data.set("accuracy.value", json!(1)),
            Err(RunDataError::PathConflict(_))
        ));
    }

    #[test]
    fn merge_strings_at_root_and_nested() {
        let mut data = RunData::new();
        let outputs = BTreeMap::from([("accuracy".to_string(), "0.95".to_string())]);
        data.merge_strings(None, &outputs).unwrap();
        data.merge_strings(Some("eval"), &outputs).unwrap();
        assert_eq!(data.get("accuracy").unwrap(), "0.95");
        assert_eq!(data.get("eval.accuracy").unwrap(), "0.95");
    }

    #[test]
    fn stringifies_non_string_values() {
        let data = sample();
        assert_eq!(data.get_string("accuracy").unwrap(), "0.95");
        assert_eq!(data.get_string("input.dir").unwrap(), "s3://bucket/raw");
        assert_eq!(
            data.get_string("etl").unwrap(),
            r#"{"job_name":"etl","run_id":"jr_1","status":"Succeeded"}"#
        );
    }

    #[test]
    fn flatten_uses_dotted_keys() {
        let flat = sample().flatten();
        assert_eq!(flat["input.dir"], "s3://bucket/raw");
        assert_eq!(flat["etl.run_id"], "jr_1");
        assert_eq!(flat["accuracy"], "0.95");
    }

    #[test]
    fn rejects_non_object_root() {
        assert_eq!(
            RunData::from_value(json!([1, 2])).unwrap_err(),
            RunDataError::NotAnObject
        );
    }

    #[test]
    fn oversized_output_is_rejected() {
        let big = BTreeMap::from([("blob".to_string(), "x".repeat(MAX_STEP_OUTPUT_SIZE + 1))]);
        assert!(matches!(
            check_output_size(&big),
            Err(RunDataError::TooLarge { .. })
        ));
        assert!(sample().check_size().is_ok());
    }
}
