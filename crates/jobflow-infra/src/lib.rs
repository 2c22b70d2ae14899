//! Infrastructure layer for jobflow.
//!
//! Contains implementations of the ports defined in `jobflow-core`: SQLite
//! run storage, HTTP job and callback adapters, and the config loader.

pub mod config;
pub mod http;
pub mod sqlite;
