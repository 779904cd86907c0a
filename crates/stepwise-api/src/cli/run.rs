//! `stepw run <file>`: register, trigger and drive a run in-process.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use stepwise_types::workflow::{RunStatus, TriggerKind};
use tokio_util::sync::CancellationToken;

use super::workflow::{display_run, parse_input, register_file};
use super::worker::spawn_engine;
use crate::state::AppState;

pub async fn handle_run(
    file: &Path,
    input: Option<&str>,
    timeout: Duration,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let input = parse_input(input)?;
    let stored = register_file(file, state).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = spawn_engine(state, None, shutdown.clone()).await?;

    let run = state
        .engine
        .create_run(&stored.definition.id, input, TriggerKind::Manual)
        .await;
    let finished = match run {
        Ok(run) => state.engine.wait_for_run(run.id, timeout).await,
        Err(e) => Err(e),
    };

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    let run = finished?;
    display_run(&run, json)?;
    if run.status != RunStatus::Completed {
        bail!("run {} finished as {}", run.id, run.status);
    }
    Ok(())
}
