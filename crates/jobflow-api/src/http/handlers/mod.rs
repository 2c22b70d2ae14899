//! HTTP request handlers for the REST API.

pub mod event;
pub mod run;
pub mod trigger;
pub mod workflow;
