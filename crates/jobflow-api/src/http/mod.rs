//! HTTP/REST API layer for jobflow.
//!
//! Axum-based REST API at `/api/v1/`: the trigger boundary, run inspection
//! and cancellation, loaded workflows, and an SSE stream of run events.
//! Responses use a common envelope format.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
