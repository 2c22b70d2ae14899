//! `jobflow run`: execute one workflow file in the foreground.
//!
//! The run is kept in memory; nothing is written to the data directory.
//! Ctrl+C requests cancellation, which stops any outstanding job.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::Value;

use jobflow_core::callback::{
    BoxCallbackChannel, CallbackRecord, IdempotentCallbacks, RecordingCallbackChannel,
};
use jobflow_core::event::EventBus;
use jobflow_core::job::BoxJobClient;
use jobflow_core::repository::InMemoryRunRepository;
use jobflow_core::workflow::definition::load_workflow_file;
use jobflow_core::workflow::engine::{EngineConfig, WorkflowEngine};
use jobflow_core::workflow::orchestrator::Orchestrator;
use jobflow_core::workflow::registry::WorkflowRegistry;
use jobflow_types::config::GlobalConfig;
use jobflow_types::event::WorkflowEvent;
use jobflow_types::run::RunStatus;
use jobflow_types::trigger::TriggerEvent;

use crate::cli::runs::{print_run, print_step_logs};
use crate::state::{callback_channel, job_client};

/// Parse `--input`: inline JSON, `@path` to a JSON file, or nothing (`{}`).
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    let text = match raw {
        None => return Ok(Value::Object(Default::default())),
        Some(raw) => match raw.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read input file {path}"))?,
            None => raw.to_string(),
        },
    };
    let value: Value = serde_json::from_str(&text).context("input is not valid JSON")?;
    if !value.is_object() {
        bail!("input must be a JSON object");
    }
    Ok(value)
}

pub async fn run_workflow(
    file: &Path,
    input: Option<&str>,
    token: Option<String>,
    config: &GlobalConfig,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("failed to load workflow {}", file.display()))?;
    let initial = parse_input(input)?;

    // Without a callback endpoint the terminal result is read back from memory.
    let recorder = Arc::new(IdempotentCallbacks::new(RecordingCallbackChannel::new()));
    let callbacks = match config.callbacks.endpoint {
        Some(_) => callback_channel(config)?,
        None => BoxCallbackChannel::from_arc(Arc::clone(&recorder)),
    };

    // This bus only ever carries the one run started below.
    let events = EventBus::new(config.server.event_buffer);
    let engine = WorkflowEngine::new(
        BoxJobClient::new(job_client(config)?),
        callbacks,
        EngineConfig::from(&config.engine),
    )
    .with_event_bus(events.clone());

    let registry = Arc::new(WorkflowRegistry::new());
    let def = registry.register(def)?;
    let orchestrator = Orchestrator::new(engine, Arc::new(InMemoryRunRepository::new()), registry);

    let token = token.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::now_v7()));
    let mut rx = events.subscribe();
    let run_id = orchestrator
        .submit(TriggerEvent::new(def.name.clone(), initial).with_token(token.clone()))
        .await?;

    if !json && !quiet {
        println!();
        println!(
            "  {} Running '{}' ({})",
            style("⚡").bold(),
            style(&def.name).cyan(),
            style(run_id).dim()
        );
        println!("  {}", style("Press Ctrl+C to cancel").dim());
        println!();
    }

    let progress = {
        let show = !json && !quiet;
        tokio::spawn(async move {
            rx.until_terminal(|event| {
                if show {
                    print_event(event);
                }
            })
            .await;
        })
    };

    let run = tokio::select! {
        run = orchestrator.wait(run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(%run_id, "cancellation requested from terminal");
            orchestrator.cancel(run_id).await?;
            orchestrator.wait(run_id).await?
        }
    };
    progress.abort();

    let Some(run) = run else {
        bail!("run {run_id} disappeared");
    };

    if json {
        let callback = recorder.inner().get(&token).map(|record| match record {
            CallbackRecord::Success(outputs) => serde_json::json!({ "success": outputs }),
            CallbackRecord::Failure(reason) => serde_json::json!({ "failure": reason }),
        });
        let out = serde_json::json!({
            "run": run,
            "steps": orchestrator.step_logs(run_id).await?,
            "callback": callback,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !quiet {
        print_step_logs(&orchestrator.step_logs(run_id).await?);
        print_run(&run);
    }

    if run.status == RunStatus::Failed {
        let reason = run
            .failure
            .as_ref()
            .map(|f| format!("{}: {}", f.kind.as_str(), f.reason))
            .unwrap_or_else(|| "unknown failure".to_string());
        bail!("run {run_id} failed ({reason})");
    }
    Ok(())
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepStarted { step, kind, attempt, .. } if *attempt == 0 => {
            println!("  {} {} {}", style("→").cyan(), step, style(kind).dim());
        }
        WorkflowEvent::StepAdvanced { from, to, caught: true, .. } => {
            println!(
                "  {} {} failed, caught by {}",
                style("!").yellow(),
                from,
                style(to).yellow()
            );
        }
        WorkflowEvent::StepWaiting { step, resume_at, .. } => {
            println!(
                "  {} {} waiting until {}",
                style("…").dim(),
                step,
                resume_at.format("%H:%M:%S")
            );
        }
        WorkflowEvent::RunSucceeded { steps_taken, .. } => {
            println!("  {} succeeded after {steps_taken} steps", style("✓").green());
        }
        WorkflowEvent::RunFailed { kind, reason, .. } => {
            println!("  {} {}: {}", style("✗").red(), kind.as_str(), reason);
        }
        WorkflowEvent::CallbackFailed { error, .. } => {
            println!("  {} callback failed: {error}", style("!").red());
        }
        _ => {}
    }
}
