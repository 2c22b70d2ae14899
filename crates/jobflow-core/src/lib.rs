//! Workflow engine and capability traits for jobflow.
//!
//! This crate defines the "ports" (job client, callback channel, run
//! repository) that the infrastructure layer implements, and the engine that
//! drives runs through them. It depends only on `jobflow-types` -- never on
//! `jobflow-infra` or any database/IO crate.

pub mod callback;
pub mod event;
pub mod job;
pub mod repository;
pub mod workflow;

#[cfg(test)]
mod test_support;
