//! Application state wiring the engine to its infrastructure.
//!
//! `WorkflowEngine` is generic over repository and bus; AppState pins it to
//! the SQLite implementations so the CLI, the worker and the REST API all
//! share one durable database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stepwise_core::trace::{SharedPropagator, noop};
use stepwise_core::workflow::agent::UnconfiguredAgentExecutor;
use stepwise_core::workflow::coordinator::WorkflowEngine;
use stepwise_core::workflow::executor::StepExecutorRegistry;
use stepwise_core::workflow::scheduler::CronScheduler;
use stepwise_infra::config::load_engine_config;
use stepwise_infra::sqlite::bus::SqliteMessageBus;
use stepwise_infra::sqlite::pool::DatabasePool;
use stepwise_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepwise_observe::OtelTracePropagator;

/// Engine pinned to the durable infra implementations.
pub type Engine = WorkflowEngine<SqliteWorkflowRepository, SqliteMessageBus>;

pub type Scheduler = CronScheduler<SqliteWorkflowRepository, SqliteMessageBus>;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under `data_dir`, load `config.toml` and wire the
    /// engine. Trace context is carried on bus messages when `otel` is set.
    pub async fn init(data_dir: &Path, otel: bool) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let config = load_engine_config(data_dir).await;
        let db_url = format!("sqlite://{}?mode=rwc", data_dir.join("stepwise.db").display());
        let pool = DatabasePool::new(&db_url).await?;

        let repo = Arc::new(SqliteWorkflowRepository::new(pool.clone()));
        let bus = Arc::new(SqliteMessageBus::from_config(pool, &config));
        // Operation steps need an agent backend; none ships with the CLI.
        let registry = Arc::new(StepExecutorRegistry::with_builtins(Arc::new(
            UnconfiguredAgentExecutor,
        )));
        let propagator: SharedPropagator = if otel {
            Arc::new(OtelTracePropagator::new())
        } else {
            noop()
        };

        let engine = Arc::new(
            WorkflowEngine::new(repo, bus, registry, config).with_propagator(propagator),
        );
        let scheduler = Arc::new(CronScheduler::new(engine.clone()));

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            engine,
            scheduler,
            data_dir: data_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
pub(crate) async fn test_state() -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::init(dir.path(), false).await.unwrap();
    (dir, state)
}
