//! CLI workflow management subcommands.
//!
//! Provides create, trigger, list, status, steps and cancel operations for
//! workflow definitions and runs, plus approval decisions.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use stepwise_core::repository::RunFilter;
use stepwise_core::workflow::coordinator::RunRequest;
use stepwise_types::workflow::{RunStatus, StoredDefinition, TriggerKind, WorkflowRun};

use super::{run_status_cell, short_id, step_status_cell};
use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow definition from a YAML or JSON file.
    Create {
        /// Path to the definition file.
        file: std::path::PathBuf,
    },

    /// Trigger a run of a registered workflow.
    Trigger {
        /// Workflow definition id.
        id: String,

        /// JSON input for the run.
        #[arg(long)]
        input: Option<String>,

        /// Pin a definition version (content hash) instead of the latest.
        #[arg(long)]
        hash: Option<String>,
    },

    /// Show a run's status, current step and context.
    Status {
        /// Run UUID.
        run_id: String,
    },

    /// Show the step runs of a run.
    Steps {
        /// Run UUID.
        run_id: String,
    },

    /// Cancel a run.
    Cancel {
        /// Run UUID.
        run_id: String,
    },

    /// Approve the pending approval a run is waiting on.
    Approve {
        /// Run UUID.
        run_id: String,

        /// Who is deciding.
        #[arg(long = "by", default_value = "cli-user")]
        approver: String,

        /// Note recorded with the decision.
        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject the pending approval a run is waiting on; the run fails.
    Reject {
        /// Run UUID.
        run_id: String,

        /// Who is deciding.
        #[arg(long = "by", default_value = "cli-user")]
        approver: String,

        /// Why the step was rejected.
        #[arg(long)]
        reason: Option<String>,
    },

    /// List approvals waiting for a decision.
    Approvals,

    /// List registered workflows, or runs with `--runs`.
    List {
        /// List runs instead of definitions.
        #[arg(long)]
        runs: bool,

        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only runs in this status.
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file } => handle_create(&file, state, json).await,
        WorkflowCommand::Trigger { id, input, hash } => {
            handle_trigger(&id, input.as_deref(), hash, state, json).await
        }
        WorkflowCommand::Status { run_id } => handle_status(&run_id, state, json).await,
        WorkflowCommand::Steps { run_id } => handle_steps(&run_id, state, json).await,
        WorkflowCommand::Cancel { run_id } => handle_cancel(&run_id, state, json).await,
        WorkflowCommand::Approve {
            run_id,
            approver,
            comment,
        } => handle_approve(&run_id, &approver, comment, state, json).await,
        WorkflowCommand::Reject {
            run_id,
            approver,
            reason,
        } => handle_reject(&run_id, &approver, reason, state, json).await,
        WorkflowCommand::Approvals => handle_approvals(state, json).await,
        WorkflowCommand::List {
            runs,
            workflow,
            status,
            limit,
        } => {
            if runs {
                handle_list_runs(workflow, status.as_deref(), limit, state, json).await
            } else {
                handle_list(state, json).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Parse, validate and store a definition file.
pub async fn register_file(file: &Path, state: &AppState) -> Result<StoredDefinition> {
    let def = stepwise_core::workflow::definition::parse_file(file)
        .with_context(|| format!("Failed to load workflow from {}", file.display()))?;
    let stored = state
        .engine
        .register_definition(def)
        .await
        .context("Workflow validation failed")?;
    Ok(stored)
}

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let stored = register_file(file, state).await?;
    let def = &stored.definition;

    if json {
        let out = serde_json::json!({
            "id": def.id,
            "name": def.name,
            "hash": stored.hash,
            "states": def.states.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Registered workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Version: {}", stored.hash);
        println!("  States: {}", def.states.len());
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Parse an optional JSON input argument, defaulting to `{}`.
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON input"),
        None => Ok(serde_json::json!({})),
    }
}

async fn handle_trigger(
    id: &str,
    input: Option<&str>,
    hash: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let input = parse_input(input)?;
    let mut request = RunRequest::new(id, input, TriggerKind::Manual);
    if let Some(hash) = hash {
        request = request.with_hash(hash);
    }
    let (run, _) = state.engine.start_run(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!();
        println!(
            "  {} Triggered workflow '{}'",
            style("*").green().bold(),
            style(&run.workflow_name).cyan()
        );
        println!("  Run ID: {}", run.id);
        println!("  Status: {}", run.status);
        println!();
        println!(
            "  Check progress: {}",
            style(format!("stepw workflow status {}", run.id)).dim()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.engine.list_definitions().await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.definition.id,
                    "name": d.definition.name,
                    "hash": d.hash,
                    "states": d.definition.states.len(),
                    "created_at": d.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Create one with: {}",
            style("stepw workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("States"),
            Cell::new("Registered"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.definition.id),
            Cell::new(&d.definition.name),
            Cell::new(d.hash.chars().take(12).collect::<String>()),
            Cell::new(d.definition.states.len()),
            Cell::new(d.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

async fn handle_list_runs(
    workflow: Option<String>,
    status: Option<&str>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let filter = RunFilter {
        definition_id: workflow,
        status,
        limit: Some(limit),
    };
    let runs = state.engine.list_runs(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Step"),
            Cell::new("Created"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.definition_id),
            run_status_cell(r.status),
            Cell::new(r.trigger.as_str()),
            Cell::new(r.current_step.as_deref().unwrap_or("-")),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

fn parse_run_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid run ID: '{raw}'"))
}

async fn handle_status(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run = state.engine.get_run(parse_run_id(run_id)?).await?;
    display_run(&run, json)
}

/// Print a run as JSON or as a styled summary.
pub fn display_run(run: &WorkflowRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {}",
        style("Workflow:").bold(),
        style(short_id(&run.id)).cyan()
    );
    println!("  Workflow: {}", style(&run.workflow_name).cyan());
    println!("  Status: {}", run.status);
    println!("  Trigger: {}", run.trigger.as_str());
    if let Some(step) = &run.current_step {
        println!("  Step: {step}");
    }
    if let Some(approval) = &run.approval {
        println!("  Approval: {}", style(&approval.message).yellow());
        println!(
            "  Expires: {}",
            approval.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    } else if let Some(wake_at) = run.wake_at {
        println!("  Wakes: {}", wake_at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();
    println!("  Context:");
    for line in serde_json::to_string_pretty(&run.context)?.lines() {
        println!("    {line}");
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn handle_steps(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    // Surface "run not found" rather than an empty list.
    state.engine.get_run(run_id).await?;
    let steps = state.engine.list_step_runs(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  No steps recorded for run '{}'.", short_id(&run_id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempt"),
            Cell::new("Next"),
            Cell::new("Started"),
            Cell::new("Error"),
        ]);

    for s in &steps {
        let error = s
            .error
            .as_ref()
            .map(|e| e.to_string().chars().take(40).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&s.step_id),
            Cell::new(&s.step_type),
            step_status_cell(s.status),
            Cell::new(s.attempt),
            Cell::new(s.next_step.as_deref().unwrap_or("-")),
            Cell::new(s.started_at.format("%H:%M:%S").to_string()),
            Cell::new(error),
        ]);
    }

    println!();
    println!("  Steps for run '{}'", style(short_id(&run_id)).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run = state.engine.cancel_run(parse_run_id(run_id)?).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({"cancelled": run.id.to_string(), "status": run.status.as_str()})
        );
    } else {
        println!();
        println!(
            "  {} Cancelled run '{}'",
            style("*").green().bold(),
            style(short_id(&run.id)).cyan()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn handle_approve(
    run_id: &str,
    approver: &str,
    comment: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let run = state
        .engine
        .approve_step(parse_run_id(run_id)?, approver, comment)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!();
        println!(
            "  {} Approved run '{}' as {}",
            style("*").green().bold(),
            style(short_id(&run.id)).cyan(),
            approver
        );
        println!("  Status: {}", run.status);
        println!();
    }

    Ok(())
}

async fn handle_reject(
    run_id: &str,
    approver: &str,
    reason: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let run = state
        .engine
        .reject_step(parse_run_id(run_id)?, approver, reason)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!();
        println!(
            "  {} Rejected run '{}' as {}",
            style("x").red().bold(),
            style(short_id(&run.id)).cyan(),
            approver
        );
        if let Some(err) = &run.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
    }

    Ok(())
}

async fn handle_approvals(state: &AppState, json: bool) -> Result<()> {
    let runs = state.engine.list_pending_approvals().await?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .filter_map(|r| {
                r.approval.as_ref().map(|a| {
                    serde_json::json!({
                        "run_id": r.id,
                        "workflow": r.workflow_name,
                        "approval": a,
                    })
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No pending approvals.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Step"),
            Cell::new("Message"),
            Cell::new("Approvers"),
            Cell::new("Expires"),
        ]);

    for r in &runs {
        let Some(a) = &r.approval else { continue };
        let approvers = if a.approvers.is_empty() {
            "anyone".to_string()
        } else {
            a.approvers.join(", ")
        };
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.workflow_name),
            Cell::new(&a.step_id),
            Cell::new(&a.message),
            Cell::new(approvers),
            Cell::new(a.expires_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_defaults_to_empty_object() {
        assert_eq!(parse_input(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_input(Some(r#"{"severity":"high"}"#)).unwrap(),
            serde_json::json!({"severity": "high"})
        );
        assert!(parse_input(Some("{not json")).is_err());
    }

    #[test]
    fn test_parse_run_id_rejects_garbage() {
        assert!(parse_run_id("nope").is_err());
        assert!(parse_run_id(&Uuid::now_v7().to_string()).is_ok());
    }
}
