//! CLI command definitions for the `jobflow` binary.
//!
//! Uses clap derive macros for argument parsing. Flags fall back to
//! environment variables and then to `config.toml`.

pub mod definition;
pub mod run;
pub mod runs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-step workflows over external jobs.
#[derive(Parser)]
#[command(name = "jobflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml, workflows and the run database.
    #[arg(long, global = true, env = "JOBFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "JOBFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter derived from the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,jobflow_core=debug,jobflow_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate one or more workflow definition files.
    Validate {
        /// Workflow YAML files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the JSON Schema of the workflow definition format.
    Schema,

    /// Run a workflow file to completion in the foreground.
    Run {
        /// Workflow YAML file.
        file: PathBuf,

        /// Initial run data as a JSON object, or `@path` to read it from a file.
        #[arg(short, long)]
        input: Option<String>,

        /// Callback token to report the terminal result under.
        #[arg(long)]
        token: Option<String>,

        /// Job service endpoint (overrides config).
        #[arg(long, env = "JOBFLOW_JOBS_ENDPOINT")]
        jobs_endpoint: Option<String>,
    },

    /// Start the REST API server and resume unfinished runs.
    Serve {
        /// Address to bind (overrides config).
        #[arg(long, env = "JOBFLOW_BIND")]
        bind: Option<String>,

        /// Job service endpoint (overrides config).
        #[arg(long, env = "JOBFLOW_JOBS_ENDPOINT")]
        jobs_endpoint: Option<String>,

        /// Callback receiver endpoint (overrides config).
        #[arg(long, env = "JOBFLOW_CALLBACK_ENDPOINT")]
        callback_endpoint: Option<String>,
    },

    /// Inspect stored runs.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
