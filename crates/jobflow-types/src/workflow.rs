//! Workflow definition types for jobflow.
//!
//! A `WorkflowDefinition` is a named arena of `StepSpec` nodes addressed by
//! name. Each node is one of six step kinds (start a job, poll a job, branch,
//! wait, succeed, fail); successor resolution is always deterministic.
//! Definitions are static configuration: loaded once, never mutated mid-run.

use std::collections::{BTreeMap, HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default cap on status polls for a single `poll_job` step.
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 240;

/// Default run-data key where caught step errors are written.
pub const DEFAULT_ERROR_PATH: &str = "error-info";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Authored as YAML and interpreted generically by the engine. Steps are
/// addressed by their unique `name`; `start_at` names the entry step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    /// Workflow name (alphanumeric and hyphens). Used to route triggers.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Name of the entry step.
    pub start_at: String,
    /// Whole-run deadline in seconds, checked at every step boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum concurrent runs of this workflow (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// The step arena. Order is irrelevant to execution.
    pub steps: Vec<StepSpec>,
    /// Free-form metadata for integrations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Step Spec
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    /// Unique step name within the workflow.
    pub name: String,
    /// Kind-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Maximum number of times a run may enter this step. Required on at
    /// least one member of every cycle in the graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_visits: Option<u32>,
    /// Human-readable note. Ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl StepSpec {
    /// Names of every step this step can transition to.
    pub fn successors(&self) -> Vec<&str> {
        self.kind.successors()
    }

    /// Whether reaching this step ends the run.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// The kind of a step and its kind-specific configuration.
///
/// Internally tagged by `type` to match the YAML structure:
/// ```yaml
/// - name: preprocess
///   type: start_job
///   job: etl
///   next: wait-etl
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Start an external job and store its handle in run data.
    StartJob {
        /// Name of the external job to start.
        job: String,
        /// Literal job parameters.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, String>,
        /// Job parameters resolved from run data: parameter name -> path.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, String>,
        /// Run-data path where the job handle is stored (default: step name).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_path: Option<String>,
        next: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_path: Option<String>,
    },
    /// Poll a previously started job until it reaches a terminal state.
    PollJob {
        /// Run-data path of the job handle written by a `start_job` step.
        handle_path: String,
        /// Delay between polls (default from engine configuration).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_secs: Option<u64>,
        /// Maximum number of `Running` polls before giving up.
        #[serde(default = "default_poll_max_attempts")]
        max_attempts: u32,
        /// Maximum time spent in this step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// Run-data path where job outputs are merged (default: root).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_path: Option<String>,
        next: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_path: Option<String>,
    },
    /// Choose a successor by evaluating predicates in declaration order.
    Branch {
        choices: Vec<Choice>,
        /// Successor when no predicate matches. Required.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Suspend the run for a fixed delay.
    Wait { seconds: u64, next: String },
    /// Terminal success. Delivers the selected outputs to the callback.
    Succeed {
        /// Output name -> run-data path. Empty means all run data, flattened.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, String>,
    },
    /// Terminal failure with a fixed reason.
    Fail { reason: String },
}

fn default_poll_max_attempts() -> u32 {
    DEFAULT_POLL_MAX_ATTEMPTS
}

impl StepKind {
    /// Short snake_case label for logs and step logs.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::StartJob { .. } => "start_job",
            StepKind::PollJob { .. } => "poll_job",
            StepKind::Branch { .. } => "branch",
            StepKind::Wait { .. } => "wait",
            StepKind::Succeed { .. } => "succeed",
            StepKind::Fail { .. } => "fail",
        }
    }

    /// Whether this kind ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepKind::Succeed { .. } | StepKind::Fail { .. })
    }

    /// Every successor named by this step, including catch targets.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            StepKind::StartJob { next, catch, .. } | StepKind::PollJob { next, catch, .. } => {
                let mut out = vec![next.as_str()];
                if let Some(c) = catch {
                    out.push(c.as_str());
                }
                out
            }
            StepKind::Branch { choices, default } => {
                let mut out: Vec<&str> = choices.iter().map(|c| c.next.as_str()).collect();
                if let Some(d) = default {
                    out.push(d.as_str());
                }
                out
            }
            StepKind::Wait { next, .. } => vec![next.as_str()],
            StepKind::Succeed { .. } | StepKind::Fail { .. } => vec![],
        }
    }
}

/// One `(predicate, next-step)` pair of a branch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Choice {
    pub when: Predicate,
    pub next: String,
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A boolean test over run data, tagged by `op`.
///
/// Numeric comparisons accept JSON numbers and numeric strings, since job
/// outputs arrive as strings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    StringEquals { path: String, value: String },
    NumericEquals { path: String, value: f64 },
    NumericLessThan { path: String, value: f64 },
    NumericLessThanEquals { path: String, value: f64 },
    NumericGreaterThan { path: String, value: f64 },
    NumericGreaterThanEquals { path: String, value: f64 },
    BooleanEquals { path: String, value: bool },
    /// True when the path exists (or does not, with `present: false`).
    IsPresent {
        path: String,
        #[serde(default = "default_true")]
        present: bool,
    },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    /// JEXL boolean expression evaluated against the run data object.
    Expression { expr: String },
}

fn default_true() -> bool {
    true
}
