//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition`,
//! validates structural constraints (unique names, resolvable successors,
//! bounded cycles), and provides discovery for workflow files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use jobflow_types::workflow::{StepKind, WorkflowDefinition};
use thiserror::Error;

use super::graph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A successor names a step that does not exist.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A cycle in the step graph has no `max_visits` bound.
    #[error("unbounded cycle: {0}")]
    UnboundedCycle(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// JSON Schema for the definition file format.
pub fn definition_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(WorkflowDefinition);
    serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - Version parses as semver
/// - Concurrency >= 1 and timeout > 0 if set
/// - At least one step exists, step names are unique, `start_at` exists
/// - Every successor (`next`, `catch`, choice target, `default`) exists
/// - Branches have at least one choice and a default
/// - Poll steps have a non-zero interval and attempt cap
/// - Every cycle has at least one member with `max_visits`
///
/// Steps unreachable from `start_at` are logged, not rejected.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if let Err(e) = semver::Version::parse(&def.version) {
        return Err(WorkflowError::ValidationError(format!(
            "version '{}' is not valid semver: {e}",
            def.version
        )));
    }

    if def.concurrency == Some(0) {
        return Err(WorkflowError::ValidationError(
            "concurrency must be >= 1".to_string(),
        ));
    }
    if def.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for step in &def.steps {
        if step.name.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step name must not be empty".to_string(),
            ));
        }
        if !names.insert(step.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step name: '{}'",
                step.name
            )));
        }
        if step.max_visits == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': max_visits must be >= 1",
                step.name
            )));
        }
    }

    if !names.contains(def.start_at.as_str()) {
        return Err(WorkflowError::UnknownStep(format!(
            "start_at names unknown step '{}'",
            def.start_at
        )));
    }

    for step in &def.steps {
        match &step.kind {
            StepKind::Branch { choices, default } => {
                if choices.is_empty() {
                    return Err(WorkflowError::ValidationError(format!(
                        "branch step '{}' has no choices",
                        step.name
                    )));
                }
                if default.is_none() {
                    return Err(WorkflowError::ValidationError(format!(
                        "branch step '{}' has no default successor",
                        step.name
                    )));
                }
            }
            StepKind::PollJob {
                poll_interval_secs,
                max_attempts,
                ..
            } => {
                if *poll_interval_secs == Some(0) {
                    return Err(WorkflowError::ValidationError(format!(
                        "poll step '{}': poll_interval_secs must be > 0",
                        step.name
                    )));
                }
                if *max_attempts == 0 {
                    return Err(WorkflowError::ValidationError(format!(
                        "poll step '{}': max_attempts must be >= 1",
                        step.name
                    )));
                }
            }
            StepKind::StartJob { job, .. } if job.is_empty() => {
                return Err(WorkflowError::ValidationError(format!(
                    "start step '{}' names no job",
                    step.name
                )));
            }
            _ => {}
        }

        for target in step.successors() {
            if !names.contains(target) {
                return Err(WorkflowError::UnknownStep(format!(
                    "step '{}' transitions to unknown step '{}'",
                    step.name, target
                )));
            }
        }
    }

    let report = graph::analyze(def)?;
    for name in &report.unreachable {
        tracing::warn!(workflow = %def.name, step = %name, "step is unreachable from start_at");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// or validate are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping invalid workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
