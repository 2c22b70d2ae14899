//! jobflow CLI and REST API entry point.
//!
//! Binary name: `jobflow`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! matching command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use jobflow_infra::config::{load_global_config, resolve_data_dir};
use jobflow_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::{AppState, ConfigOverrides};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_filter(), cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);

    match cli.command {
        Commands::Validate { files } => cli::definition::validate(&files, cli.json),

        Commands::Schema => cli::definition::schema(),

        Commands::Run {
            file,
            input,
            token,
            jobs_endpoint,
        } => {
            let mut config = load_global_config(&data_dir).await;
            ConfigOverrides {
                jobs_endpoint,
                callback_endpoint: None,
            }
            .apply(&mut config);
            cli::run::run_workflow(&file, input.as_deref(), token, &config, cli.json, cli.quiet)
                .await
        }

        Commands::Serve {
            bind,
            jobs_endpoint,
            callback_endpoint,
        } => serve(&data_dir, bind, jobs_endpoint, callback_endpoint).await,

        Commands::Runs { action } => {
            let state = AppState::init(data_dir, ConfigOverrides::default()).await?;
            cli::runs::handle_runs_command(action, &state, cli.json).await
        }

        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "jobflow", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn serve(
    data_dir: &Path,
    bind: Option<String>,
    jobs_endpoint: Option<String>,
    callback_endpoint: Option<String>,
) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        jobs_endpoint,
        callback_endpoint,
    };
    let state = AppState::init(data_dir.to_path_buf(), overrides).await?;

    let recovered = state
        .orchestrator
        .recover()
        .await
        .context("failed to resume stored runs")?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed unfinished runs");
    }

    let addr = bind.unwrap_or_else(|| state.config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "  {} jobflow listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!(
        "  {} workflow(s) loaded, {} run(s) resumed",
        state.registry.len(),
        recovered
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let db = state.db.clone();
    let router = http::router::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    db.close().await;

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
