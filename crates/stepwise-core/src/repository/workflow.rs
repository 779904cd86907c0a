//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, runs and step
//! runs. The infrastructure layer (stepwise-infra) implements this trait
//! with SQLite persistence; `super::memory` implements it in-process.

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{RunError, StepCompletion, StepRun, StoredDefinition, WorkflowRun};
use uuid::Uuid;

use super::RunFilter;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** versioned by content hash, insert-if-absent.
/// - **Runs:** create once, then whole-state saves that never overwrite a
///   terminal status.
/// - **Step runs:** one record per (run_id, step_id), upserted idempotently.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a definition version. Saving an existing (id, hash) is a no-op.
    fn save_definition(
        &self,
        def: &StoredDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a specific definition version.
    fn get_definition(
        &self,
        id: &str,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredDefinition>, RepositoryError>> + Send;

    /// Get the most recently saved version of a definition.
    fn get_latest_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredDefinition>, RepositoryError>> + Send;

    /// List the latest version of every definition, ordered by id.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StoredDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run. Returns `false` if a run with this id already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Persist the mutable state of a run (status, context, current step,
    /// timer fields, error, timestamps).
    ///
    /// Returns `false` without writing if the stored run is already terminal.
    /// Fails with `NotFound` if the run does not exist.
    fn save_run_state(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List runs, newest first.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Non-terminal runs updated at or after `since` (crash recovery).
    fn list_recoverable_runs(
        &self,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step runs
    // -----------------------------------------------------------------------

    /// Upsert a step run as `running` and return the stored record.
    ///
    /// If no record exists, `step` is inserted. If a non-terminal record
    /// exists, its attempt is raised to `step.attempt` (never lowered). A
    /// terminal record is returned unchanged so the caller can detect a
    /// duplicate delivery.
    fn start_step(
        &self,
        step: &StepRun,
    ) -> impl std::future::Future<Output = Result<StepRun, RepositoryError>> + Send;

    /// Mark a step run completed with its output, write path and chosen
    /// transition. Returns `false` if it was already terminal.
    fn complete_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        completion: &StepCompletion,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark a step run failed. Returns `false` if it was already terminal.
    fn fail_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        error: &RunError,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get one step run.
    fn get_step_run(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRun>, RepositoryError>> + Send;

    /// All step runs of a run, ordered by started_at ASC.
    fn list_step_runs(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;
}
