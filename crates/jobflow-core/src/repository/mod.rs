//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (jobflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod run;

pub use memory::InMemoryRunRepository;
pub use run::RunRepository;
