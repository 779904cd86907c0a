//! Engine processes: step worker, cron scheduler and crash recovery.

use anyhow::Result;
use console::style;
use stepwise_core::workflow::worker::StepWorker;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Spawn the step worker, the cron scheduler and startup recovery.
///
/// All tasks stop when `shutdown` is cancelled.
pub async fn spawn_engine(
    state: &AppState,
    concurrency: Option<usize>,
    shutdown: CancellationToken,
) -> Result<JoinSet<()>> {
    let mut tasks = JoinSet::new();

    let mut worker = StepWorker::new(state.engine.clone());
    if let Some(concurrency) = concurrency {
        worker = worker.with_concurrency(concurrency);
    }
    let token = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = worker.run(token).await {
            tracing::error!(error = %e, "step worker stopped");
        }
    });

    let scheduled = state.scheduler.schedule_all().await?;
    tracing::info!(schedules = scheduled, "cron schedules armed");
    let scheduler = state.scheduler.clone();
    let token = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = scheduler.run(token).await {
            tracing::error!(error = %e, "cron scheduler stopped");
        }
    });

    let engine = state.engine.clone();
    tasks.spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = engine.recover_pending_runs() => match result {
                Ok(recovered) => tracing::info!(recovered, "recovery pass finished"),
                Err(e) => tracing::warn!(error = %e, "recovery pass failed"),
            },
        }
    });

    Ok(tasks)
}

/// `stepw worker`: process runs until Ctrl+C or SIGTERM.
pub async fn handle_worker(state: &AppState, concurrency: Option<usize>, quiet: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut tasks = spawn_engine(state, concurrency, shutdown.clone()).await?;

    if !quiet {
        println!(
            "  {} Stepwise worker running (data: {})",
            style("*").green().bold(),
            style(state.data_dir.display()).cyan()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    crate::shutdown_signal().await;
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    if !quiet {
        println!("\n  Worker stopped.");
    }
    Ok(())
}
