//! Event bus for workflow run lifecycle notifications.
//!
//! [`EventBus`] fans `WorkflowEvent`s out to [`EventSubscription`]s, each
//! following all runs or just one.

pub mod bus;

pub use bus::{EventBus, EventSubscription, Received};
