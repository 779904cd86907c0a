//! Stepwise CLI and REST API entry point.
//!
//! Binary name: `stepw`
//!
//! Parses CLI arguments, opens the database and wires the engine, then
//! dispatches to the command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use std::time::Duration;

use clap::Parser;
use console::style;
use stepwise_infra::sqlite::pool::data_dir as default_data_dir;
use stepwise_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let default_filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise=debug",
        _ => "trace",
    };
    init_tracing(TracingOptions {
        otel: cli.otel,
        json: cli.log_json,
        default_filter: Some(default_filter),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let state = AppState::init(&data_dir, cli.otel).await?;

    let result = dispatch(cli, state).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, state: AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await?;
        }

        Commands::Run {
            file,
            input,
            timeout,
        } => {
            cli::run::handle_run(
                &file,
                input.as_deref(),
                Duration::from_secs(timeout),
                &state,
                cli.json,
            )
            .await?;
        }

        Commands::Worker { concurrency } => {
            cli::worker::handle_worker(&state, concurrency, cli.quiet).await?;
        }

        Commands::Serve {
            port,
            host,
            no_worker,
        } => {
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            let shutdown = CancellationToken::new();
            let engine_tasks = if no_worker {
                None
            } else {
                Some(cli::worker::spawn_engine(&state, None, shutdown.clone()).await?)
            };

            println!(
                "  {} Stepwise API listening on {}",
                style("*").green().bold(),
                style(format!("http://{addr}")).cyan()
            );
            println!("  {}", style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            shutdown.cancel();
            if let Some(mut tasks) = engine_tasks {
                while tasks.join_next().await.is_some() {}
            }
            println!("\n  Server stopped.");
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
