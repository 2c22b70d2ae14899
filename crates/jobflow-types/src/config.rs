//! Global configuration types for jobflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls
//! engine retry policy, the job service and callback endpoints, run storage,
//! and the HTTP server.

use serde::{Deserialize, Serialize};

/// Top-level configuration for jobflow.
///
/// Loaded from `~/.jobflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Directory holding workflow definition files, relative to the data dir
    /// unless absolute.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub jobs: JobServiceSettings,

    #[serde(default)]
    pub callbacks: CallbackSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            engine: EngineSettings::default(),
            jobs: JobServiceSettings::default(),
            callbacks: CallbackSettings::default(),
            storage: StorageSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

/// Retry and backoff policy applied by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Poll interval for `poll_job` steps that do not set one.
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,
    /// Consecutive status-call failures tolerated before a poll step gives up.
    #[serde(default = "default_client_error_retries")]
    pub client_error_retries: u32,
    /// Base delay for exponential backoff after a status-call failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Delivery attempts for a terminal callback before recording the error.
    #[serde(default = "default_callback_attempts")]
    pub callback_attempts: u32,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_client_error_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_callback_attempts() -> u32 {
    3
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_poll_interval_secs: default_poll_interval_secs(),
            client_error_retries: default_client_error_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            callback_attempts: default_callback_attempts(),
        }
    }
}

/// Where the external job service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobServiceSettings {
    #[serde(default = "default_jobs_endpoint")]
    pub endpoint: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_jobs_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_jobs_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_jobs_timeout_secs() -> u64 {
    30
}

impl Default for JobServiceSettings {
    fn default() -> Self {
        Self {
            endpoint: default_jobs_endpoint(),
            timeout_secs: default_jobs_timeout_secs(),
        }
    }
}

/// Where terminal callbacks are delivered. No endpoint means callbacks are
/// only logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Connection limits for the run database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Read connections kept open alongside the single writer.
    #[serde(default = "default_read_connections")]
    pub read_connections: u32,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_read_connections() -> u32 {
    4
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            read_connections: default_read_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Lifecycle events buffered per subscriber before it starts missing them.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_bind() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            event_buffer: default_event_buffer(),
        }
    }
}
