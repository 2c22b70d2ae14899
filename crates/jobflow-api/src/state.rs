//! Application state wiring the orchestrator to its concrete adapters.
//!
//! AppState holds the long-lived services used by both the CLI and the REST
//! API. The orchestrator is generic over its run repository; AppState pins it
//! to SQLite.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use jobflow_core::callback::{BoxCallbackChannel, IdempotentCallbacks, LoggingCallbackChannel};
use jobflow_core::event::EventBus;
use jobflow_core::job::BoxJobClient;
use jobflow_core::workflow::engine::{EngineConfig, WorkflowEngine};
use jobflow_core::workflow::orchestrator::Orchestrator;
use jobflow_core::workflow::registry::WorkflowRegistry;
use jobflow_infra::config::{load_global_config, workflows_dir};
use jobflow_infra::http::{HttpCallbackChannel, HttpJobClient};
use jobflow_infra::sqlite::pool::DatabasePool;
use jobflow_infra::sqlite::run::SqliteRunRepository;
use jobflow_types::config::GlobalConfig;

pub type ConcreteOrchestrator = Orchestrator<SqliteRunRepository>;

/// Shared application state.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ConcreteOrchestrator,
    pub registry: Arc<WorkflowRegistry>,
    pub events: EventBus,
    pub db: DatabasePool,
    pub config: Arc<GlobalConfig>,
}

/// Command-line values that take precedence over `config.toml`.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub jobs_endpoint: Option<String>,
    pub callback_endpoint: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut GlobalConfig) {
        if let Some(endpoint) = self.jobs_endpoint {
            config.jobs.endpoint = endpoint;
        }
        if self.callback_endpoint.is_some() {
            config.callbacks.endpoint = self.callback_endpoint;
        }
    }
}

impl AppState {
    /// Initialize the application state: load config and workflows, open
    /// the database, wire the engine.
    pub async fn init(data_dir: PathBuf, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let mut config = load_global_config(&data_dir).await;
        overrides.apply(&mut config);
        let registry = Arc::new(WorkflowRegistry::new());
        let dir = workflows_dir(&data_dir, &config);
        let loaded = registry
            .load_dir(&dir)
            .with_context(|| format!("failed to load workflows from {}", dir.display()))?;
        tracing::info!(count = loaded, dir = %dir.display(), "workflows loaded");

        let db_pool = DatabasePool::open(&data_dir, &config.storage)
            .await
            .context("failed to open run database")?;

        Self::build(db_pool, config, registry)
    }

    /// Wire services over an already-open pool and registry.
    pub fn build(
        db_pool: DatabasePool,
        config: GlobalConfig,
        registry: Arc<WorkflowRegistry>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new(config.server.event_buffer);
        let engine = build_engine(&config)?.with_event_bus(events.clone());
        let repo = Arc::new(SqliteRunRepository::new(db_pool.clone()));
        let orchestrator = Orchestrator::new(engine, repo, Arc::clone(&registry));

        Ok(Self {
            orchestrator,
            registry,
            events,
            db: db_pool,
            config: Arc::new(config),
        })
    }
}

/// Build a job client for the configured job service.
pub fn job_client(config: &GlobalConfig) -> anyhow::Result<HttpJobClient> {
    HttpJobClient::new(
        &config.jobs.endpoint,
        Duration::from_secs(config.jobs.timeout_secs),
    )
    .context("failed to build job service client")
}

/// Build the callback channel: HTTP when an endpoint is configured,
/// log-only otherwise. Either way duplicates are absorbed.
pub fn callback_channel(config: &GlobalConfig) -> anyhow::Result<BoxCallbackChannel> {
    match &config.callbacks.endpoint {
        Some(endpoint) => {
            let channel = HttpCallbackChannel::new(
                endpoint,
                Duration::from_secs(config.jobs.timeout_secs),
            )
            .context("failed to build callback client")?;
            Ok(BoxCallbackChannel::new(IdempotentCallbacks::new(channel)))
        }
        None => {
            tracing::debug!("no callback endpoint configured, callbacks are only logged");
            Ok(BoxCallbackChannel::new(IdempotentCallbacks::new(LoggingCallbackChannel)))
        }
    }
}

fn build_engine(config: &GlobalConfig) -> anyhow::Result<WorkflowEngine> {
    let jobs = BoxJobClient::new(job_client(config)?);
    let callbacks = callback_channel(config)?;
    Ok(WorkflowEngine::new(
        jobs,
        callbacks,
        EngineConfig::from(&config.engine),
    ))
}
