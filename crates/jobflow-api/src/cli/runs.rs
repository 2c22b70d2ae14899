//! `jobflow runs`: inspect and cancel stored runs.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use jobflow_types::run::{RunStatus, StepLog, StepLogStatus, WorkflowRun};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List recent runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run in detail.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Show the step log of a run.
    Logs {
        /// Run UUID.
        run_id: String,
    },

    /// Request cancellation of a run.
    Cancel {
        /// Run UUID.
        run_id: String,
    },
}

pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunsCommand::List { workflow, limit } => list(state, workflow.as_deref(), limit, json).await,
        RunsCommand::Show { run_id } => show(state, &run_id, json).await,
        RunsCommand::Logs { run_id } => logs(state, &run_id, json).await,
        RunsCommand::Cancel { run_id } => cancel(state, &run_id, json).await,
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("'{raw}' is not a valid run id"))
}

async fn list(state: &AppState, workflow: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let runs = state.orchestrator.list_runs(workflow, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Started").fg(Color::White),
        Cell::new("Duration").fg(Color::White),
    ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(&run.workflow_name),
            status_cell(run.status),
            Cell::new(&run.current_step),
            Cell::new(format_time(run.started_at)),
            Cell::new(format_duration(run)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn show(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let Some(run) = state.orchestrator.get_run(run_id).await? else {
        bail!("run {run_id} not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(())
}

async fn logs(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let logs = state.orchestrator.step_logs(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
    } else if logs.is_empty() {
        println!();
        println!("  No step logs for run {run_id}.");
        println!();
    } else {
        print_step_logs(&logs);
    }
    Ok(())
}

async fn cancel(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let requested = state.orchestrator.cancel(run_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run_id,
                "cancel_requested": requested,
            }))?
        );
    } else if requested {
        println!();
        println!(
            "  {} Cancellation requested for {}",
            style("*").yellow().bold(),
            style(run_id).cyan()
        );
        println!("  The run stops at its next step boundary.");
        println!();
    } else {
        bail!("run {run_id} not found or already finished");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering (shared with `jobflow run`)
// ---------------------------------------------------------------------------

pub(crate) fn print_run(run: &WorkflowRun) {
    println!();
    println!(
        "  {} {} {}",
        style("Run").bold(),
        style(run.id).cyan(),
        style(format!("({} v{})", run.workflow_name, run.workflow_version)).dim()
    );
    println!();
    println!("  Status:   {}", styled_status(run.status));
    println!("  Step:     {}", run.current_step);
    println!("  Steps:    {}", run.step_counter);
    println!("  Started:  {}", format_time(run.started_at));
    if let Some(done) = run.completed_at {
        println!("  Finished: {} ({})", format_time(done), format_duration(run));
    }
    if run.cancel_requested && !run.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }

    if let Some(failure) = &run.failure {
        println!();
        println!("  {}", style("── Failure ──").dim());
        println!("  Kind:   {}", style(failure.kind.as_str()).red());
        println!("  Reason: {}", failure.reason);
        if let Some(step) = &failure.step {
            println!("  Step:   {step}");
        }
    }

    if let Some(outputs) = &run.outputs {
        println!();
        println!("  {}", style("── Outputs ──").dim());
        if outputs.is_empty() {
            println!("  (none)");
        }
        for (key, value) in outputs {
            println!("  {}: {}", style(key).cyan(), value);
        }
    }

    if let Some(token) = &run.callback_token {
        println!();
        println!("  {}", style("── Callback ──").dim());
        println!("  Token:     {token}");
        let delivery = match (&run.callback_error, run.notified) {
            (Some(err), _) => style(format!("failed: {err}")).red().to_string(),
            (None, true) => style("delivered").green().to_string(),
            (None, false) => style("pending").dim().to_string(),
        };
        println!("  Delivery:  {delivery}");
    }
    println!();
}

pub(crate) fn print_step_logs(logs: &[StepLog]) {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Attempt").fg(Color::White),
        Cell::new("Outcome").fg(Color::White),
        Cell::new("Detail").fg(Color::White),
        Cell::new("Time").fg(Color::White),
    ]);

    for log in logs {
        let outcome_color = match log.status {
            StepLogStatus::Advanced | StepLogStatus::Succeeded => Color::Green,
            StepLogStatus::Waiting => Color::DarkGrey,
            StepLogStatus::Caught => Color::Yellow,
            StepLogStatus::Failed => Color::Red,
        };
        table.add_row(vec![
            Cell::new(log.sequence),
            Cell::new(&log.step),
            Cell::new(log.attempt),
            Cell::new(log.status.as_str()).fg(outcome_color),
            Cell::new(log.detail.as_deref().unwrap_or("")),
            Cell::new(log.recorded_at.format("%H:%M:%S%.3f")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::DarkGrey,
        RunStatus::Running => Color::Cyan,
        RunStatus::Succeeded => Color::Green,
        RunStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn styled_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style(status.as_str()).dim().to_string(),
        RunStatus::Running => style(status.as_str()).cyan().to_string(),
        RunStatus::Succeeded => style(status.as_str()).green().to_string(),
        RunStatus::Failed => style(status.as_str()).red().to_string(),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Wall-clock duration of a finished run, `-` while it is still going.
fn format_duration(run: &WorkflowRun) -> String {
    let Some(done) = run.completed_at else {
        return "-".to_string();
    };
    let secs = (done - run.started_at).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}
