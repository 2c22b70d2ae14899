//! Workflow engine core: definitions, step execution, and durable runs.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `graph` -- reachability and bounded-cycle analysis
//! - `expression` -- JEXL evaluator for expression predicates
//! - `predicate` -- branch predicate evaluation
//! - `retry` -- retry and backoff policy
//! - `step_executor` -- handlers for the six step kinds
//! - `notify` -- terminal callback delivery
//! - `engine` -- the per-run state machine
//! - `checkpoint` -- snapshot and step log persistence
//! - `registry` -- loaded definitions keyed by name
//! - `orchestrator` -- background runs, cancellation, crash recovery

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod notify;
pub mod orchestrator;
pub mod predicate;
pub mod registry;
pub mod retry;
pub mod step_executor;
