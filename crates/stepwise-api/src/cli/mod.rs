//! CLI command definitions for the `stepw` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow management lives
//! under `stepw workflow ...`; `run`, `worker` and `serve` start engine
//! processes.

pub mod run;
pub mod workflow;
pub mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use stepwise_types::workflow::{RunStatus, StepRunStatus};

use workflow::WorkflowCommand;

/// Durable workflow execution engine.
#[derive(Parser)]
#[command(name = "stepw", version, about, long_about = None)]
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

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter) and carry
    /// trace context on bus messages.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding `stepwise.db` and `config.toml`.
    #[arg(long, global = true, env = "STEPWISE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions and runs.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: WorkflowCommand,
    },

    /// Load a definition file, trigger it and drive the run to completion
    /// in this process.
    Run {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// JSON input for the run.
        #[arg(long)]
        input: Option<String>,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Consume step-tasks and cron ticks until interrupted.
    Worker {
        /// Step-tasks processed concurrently (defaults to config).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "3000")]
        port: u16,

        /// Host address to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Serve the API only; runs are executed by separate workers.
        #[arg(long)]
        no_worker: bool,
    },
}

/// Styled table cell for a run status.
pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Waiting => Color::Magenta,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

/// Styled table cell for a step-run status.
pub fn step_status_cell(status: StepRunStatus) -> Cell {
    let color = match status {
        StepRunStatus::Pending => Color::Yellow,
        StepRunStatus::Running => Color::Blue,
        StepRunStatus::Completed => Color::Green,
        StepRunStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

/// First eight characters of an id, for compact tables.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
