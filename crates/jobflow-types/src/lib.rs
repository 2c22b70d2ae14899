//! Shared domain types for jobflow.
//!
//! This crate contains the data model used across the workflow orchestrator:
//! workflow definitions, runs and their run data, external job references,
//! trigger events, lifecycle events, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod run;
pub mod run_data;
pub mod trigger;
pub mod workflow;
