//! External job capability.
//!
//! The engine treats every long-running operation (ETL, training, batch
//! evaluation) as an opaque job reached through [`JobClient`]. Hosts inject
//! an implementation; the engine never knows what a job does.

pub mod box_client;
pub mod client;

pub use box_client::BoxJobClient;
pub use client::{JobClient, JobClientError};
