//! Run coordinator: the single writer of run state.
//!
//! A run advances one step-task at a time. Each task is handled under a
//! per-run async mutex, so completions of the same run never interleave. A
//! task that finds the mutex held is refused with `RunBusy` rather than
//! queued, so a duplicate delivery never parks a worker behind a long step:
//!
//! 1. Load the run and drop the task if it is stale (terminal run, run moved
//!    past the step, older attempt).
//! 2. Upsert the StepRun as `running` and execute the state.
//! 3. On completion persist the StepRun (output, write path, chosen
//!    transition), merge the output into the run context, save the run and
//!    publish the next step-task.
//!
//! Because the StepRun completion is persisted before the run is advanced,
//! a crash in between is repaired by replaying the stored completion when
//! the task is redelivered. Recovery republishes the current step of every
//! in-flight run and re-arms timers of waiting runs.
//!
//! An approval step parks the run as `waiting` with the request stored on
//! the run and a timer armed for its expiry. `approve_step` and
//! `reject_step` settle it; an expiry that fires first fails the step with
//! `approval_timed_out`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::message::{StepTask, TaskKind};
use stepwise_types::workflow::{
    PendingApproval, RunError, RunStatus, StateConfig, StateDefinition, StepCompletion, StepRun,
    StepRunStatus, StoredDefinition, TriggerKind, WorkflowDefinition, WorkflowRun,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{ContextError, RunContext};
use super::definition::{DefinitionError, DefinitionLoader, resolve_entry, trigger_target};
use super::executor::{
    ExecutionRuntime, Next, StepError, StepExecutorRegistry, StepOutcome, execute_state,
    resolve_next,
};
use super::retry::RetryPolicy;
use super::schema;
use crate::message::{BusError, Headers, MessageBus, MessageId, PublishOptions};
use crate::repository::RunFilter;
use crate::repository::workflow::WorkflowRepository;
use crate::trace::{SharedPropagator, noop};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("invalid run input: {}", .0.join("; "))]
    InvalidInput(Vec<String>),

    #[error("state '{0}' not found in definition")]
    UnknownState(String),

    #[error("run {0} is already {1}")]
    AlreadyTerminal(Uuid, RunStatus),

    #[error("timed out waiting for run {0}")]
    WaitTimeout(Uuid),

    #[error("run {0} is busy with another task")]
    RunBusy(Uuid),

    #[error("run {0} has no pending approval")]
    NoPendingApproval(Uuid),

    #[error("'{approver}' may not decide the approval of run {run_id}")]
    ApproverNotAllowed { run_id: Uuid, approver: String },

    #[error("approval for run {0} has expired")]
    ApprovalExpired(Uuid),
}

impl CoordinatorError {
    /// Whether handling the same task again could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Repository(_) | CoordinatorError::Bus(_) | CoordinatorError::RunBusy(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Run requests
// ---------------------------------------------------------------------------

/// Parameters of a new run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub definition_id: String,
    /// Pin a definition version. `None` uses the latest.
    pub definition_hash: Option<String>,
    pub input: Value,
    pub trigger: TriggerKind,
    /// Caller-chosen run id (cron runs derive theirs from the fire time).
    pub run_id: Option<Uuid>,
    /// Start at this state instead of the definition's entry.
    pub entry: Option<String>,
}

impl RunRequest {
    pub fn new(definition_id: impl Into<String>, input: Value, trigger: TriggerKind) -> Self {
        Self {
            definition_id: definition_id.into(),
            definition_hash: None,
            input,
            trigger,
            run_id: None,
            entry: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.definition_hash = Some(hash.into());
        self
    }

    pub fn starting_at(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Coordinates runs over a repository and a message bus.
pub struct WorkflowEngine<R, B> {
    repo: Arc<R>,
    bus: Arc<B>,
    runtime: ExecutionRuntime,
    loader: DefinitionLoader,
    config: EngineConfig,
    propagator: SharedPropagator,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    in_flight: DashMap<Uuid, CancellationToken>,
    definitions: DashMap<(String, String), Arc<StoredDefinition>>,
}

impl<R, B> WorkflowEngine<R, B>
where
    R: WorkflowRepository + 'static,
    B: MessageBus,
{
    pub fn new(
        repo: Arc<R>,
        bus: Arc<B>,
        registry: Arc<StepExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            bus,
            runtime: ExecutionRuntime {
                registry: registry.clone(),
                default_timeout: Duration::from_secs(config.default_step_timeout_secs),
            },
            loader: DefinitionLoader::new(registry),
            config,
            propagator: noop(),
            run_locks: DashMap::new(),
            in_flight: DashMap::new(),
            definitions: DashMap::new(),
        }
    }

    /// Use `propagator` to carry trace context on published messages.
    pub fn with_propagator(mut self, propagator: SharedPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn loader(&self) -> &DefinitionLoader {
        &self.loader
    }

    pub fn propagator(&self) -> &SharedPropagator {
        &self.propagator
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id).or_default().clone()
    }

    async fn publish_task(
        &self,
        task: &StepTask,
        options: PublishOptions,
    ) -> Result<MessageId, CoordinatorError> {
        let mut headers = Headers::new();
        self.propagator.inject(&mut headers);
        let payload = serde_json::to_value(task).map_err(BusError::from)?;
        let id = self
            .bus
            .publish(&task.subject(), payload, headers, options)
            .await?;
        tracing::debug!(
            run_id = %task.run_id,
            step_id = %task.step_id,
            attempt = task.attempt,
            kind = ?task.kind,
            message_id = %id,
            "published step task"
        );
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition version.
    pub async fn register_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<StoredDefinition, CoordinatorError> {
        let stored = self.loader.prepare(def)?;
        self.repo.save_definition(&stored).await?;
        tracing::info!(
            definition_id = %stored.definition.id,
            hash = %stored.hash,
            states = stored.definition.states.len(),
            "registered workflow definition"
        );
        self.definitions.insert(
            (stored.definition.id.clone(), stored.hash.clone()),
            Arc::new(stored.clone()),
        );
        Ok(stored)
    }

    pub async fn register_yaml(&self, yaml: &str) -> Result<StoredDefinition, CoordinatorError> {
        let def = super::definition::parse_yaml(yaml)?;
        self.register_definition(def).await
    }

    /// A pinned definition version, or the latest when `hash` is `None`.
    pub async fn get_definition(
        &self,
        id: &str,
        hash: Option<&str>,
    ) -> Result<Arc<StoredDefinition>, CoordinatorError> {
        if let Some(hash) = hash {
            let key = (id.to_string(), hash.to_string());
            if let Some(cached) = self.definitions.get(&key) {
                return Ok(cached.clone());
            }
        }

        let stored = match hash {
            Some(hash) => self.repo.get_definition(id, hash).await?,
            None => self.repo.get_latest_definition(id).await?,
        }
        .ok_or_else(|| CoordinatorError::DefinitionNotFound(id.to_string()))?;

        let stored = Arc::new(stored);
        self.definitions.insert(
            (stored.definition.id.clone(), stored.hash.clone()),
            stored.clone(),
        );
        Ok(stored)
    }

    pub async fn list_definitions(&self) -> Result<Vec<StoredDefinition>, CoordinatorError> {
        Ok(self.repo.list_definitions().await?)
    }

    // -----------------------------------------------------------------------
    // Run creation
    // -----------------------------------------------------------------------

    /// Start a run of the latest version of `definition_id`.
    pub async fn create_run(
        &self,
        definition_id: &str,
        input: Value,
        trigger: TriggerKind,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let (run, _) = self
            .start_run(RunRequest::new(definition_id, input, trigger))
            .await?;
        Ok(run)
    }

    /// Start a run. Returns the run and whether it was newly created; a
    /// request carrying the id of an existing run returns that run.
    #[tracing::instrument(
        skip(self, request),
        fields(definition_id = %request.definition_id, trigger = request.trigger.as_str())
    )]
    pub async fn start_run(
        &self,
        request: RunRequest,
    ) -> Result<(WorkflowRun, bool), CoordinatorError> {
        let stored = self
            .get_definition(&request.definition_id, request.definition_hash.as_deref())
            .await?;
        let def = &stored.definition;

        let entry = match &request.entry {
            Some(id) => Some(
                def.state(id)
                    .ok_or_else(|| CoordinatorError::UnknownState(id.clone()))?,
            ),
            None => resolve_entry(def),
        };

        let mut issues = Vec::new();
        if let Some(expected) = &def.input_schema {
            if let Err(mut found) = schema::validate(&request.input, expected) {
                issues.append(&mut found);
            }
        }
        if let Some(expected) = entry.and_then(|s| s.input_schema.as_ref()) {
            if let Err(mut found) = schema::validate(&request.input, expected) {
                issues.append(&mut found);
            }
        }
        if !issues.is_empty() {
            return Err(CoordinatorError::InvalidInput(issues));
        }

        let run_id = request.run_id.unwrap_or_else(Uuid::now_v7);
        let now = Utc::now();
        let context = RunContext::new(
            run_id,
            &def.id,
            request.input.clone(),
            self.config.max_context_bytes,
        );
        let mut run = WorkflowRun {
            id: run_id,
            definition_id: def.id.clone(),
            definition_hash: stored.hash.clone(),
            workflow_name: def.name.clone(),
            status: RunStatus::Pending,
            trigger: request.trigger,
            input: request.input,
            context: context.into_value(),
            current_step: entry.map(|s| s.id.clone()),
            wake_at: None,
            timer_message_id: None,
            approval: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        if !self.repo.create_run(&run).await? {
            tracing::debug!(%run_id, "run already exists");
            let existing = self
                .repo
                .get_run(&run_id)
                .await?
                .ok_or(CoordinatorError::RunNotFound(run_id))?;
            return Ok((existing, false));
        }

        let Some(entry) = entry else {
            let error = RunError {
                step_id: None,
                class: "validation".to_string(),
                message: "workflow has no executable entry state".to_string(),
            };
            let run = self.fail_run(run, error).await?;
            return Ok((run, true));
        };

        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        self.repo.save_run_state(&run).await?;
        self.publish_task(
            &StepTask::execute(run_id, entry.id.clone(), 1),
            PublishOptions::immediate(),
        )
        .await?;

        tracing::info!(%run_id, entry = %entry.id, "run started");
        Ok((run, true))
    }

    /// Start a run for the cron trigger `trigger_id` of a pinned definition.
    pub async fn start_triggered_run(
        &self,
        definition_id: &str,
        definition_hash: &str,
        trigger_id: &str,
        run_id: Uuid,
    ) -> Result<(WorkflowRun, bool), CoordinatorError> {
        let stored = self
            .get_definition(definition_id, Some(definition_hash))
            .await?;
        let def = &stored.definition;
        let trigger = def
            .state(trigger_id)
            .ok_or_else(|| CoordinatorError::UnknownState(trigger_id.to_string()))?;
        let input = match &trigger.config {
            StateConfig::Cron(cfg) => {
                cfg.input.clone().unwrap_or_else(|| json!({}))
            }
            _ => return Err(CoordinatorError::UnknownState(trigger_id.to_string())),
        };
        let target = trigger_target(def, trigger)
            .ok_or_else(|| CoordinatorError::UnknownState(trigger_id.to_string()))?;

        let request = RunRequest::new(definition_id, input, TriggerKind::Cron)
            .with_hash(definition_hash)
            .with_run_id(run_id)
            .starting_at(target.id.clone());
        self.start_run(request).await
    }

    // -----------------------------------------------------------------------
    // Step-task handling
    // -----------------------------------------------------------------------

    /// Handle one step-task delivery. Safe to call more than once for the
    /// same task.
    #[tracing::instrument(
        skip(self, task),
        fields(run_id = %task.run_id, step_id = %task.step_id, attempt = task.attempt)
    )]
    pub async fn handle_step_task(&self, task: StepTask) -> Result<(), CoordinatorError> {
        if self.repo.get_run(&task.run_id).await?.is_none() {
            tracing::warn!("step task for unknown run, dropping");
            return Ok(());
        }

        let lock = self.run_lock(task.run_id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!("run is busy, deferring step task");
            return Err(CoordinatorError::RunBusy(task.run_id));
        };

        let Some(run) = self.repo.get_run(&task.run_id).await? else {
            self.run_locks.remove(&task.run_id);
            return Ok(());
        };
        if run.status.is_terminal() {
            tracing::debug!(status = %run.status, "run is terminal, dropping step task");
            self.release_lock(&run);
            return Ok(());
        }

        let stored = self
            .get_definition(&run.definition_id, Some(&run.definition_hash))
            .await?;
        let def = &stored.definition;
        let Some(state) = def.state(&task.step_id) else {
            let error = RunError {
                step_id: Some(task.step_id.clone()),
                class: "internal".to_string(),
                message: format!("state '{}' not found in definition", task.step_id),
            };
            self.fail_run(run, error).await?;
            return Ok(());
        };

        let run = match task.kind {
            TaskKind::Execute => self.execute_step(run, def, state, task.attempt).await?,
            TaskKind::TimerFired => self.resume_after_timer(run, def, state).await?,
        };
        if let Some(run) = run {
            self.release_lock(&run);
        }
        Ok(())
    }

    fn release_lock(&self, run: &WorkflowRun) {
        if run.status.is_terminal() {
            self.run_locks.remove(&run.id);
        }
    }

    async fn execute_step(
        &self,
        run: WorkflowRun,
        def: &WorkflowDefinition,
        state: &StateDefinition,
        attempt: u32,
    ) -> Result<Option<WorkflowRun>, CoordinatorError> {
        if run.status != RunStatus::Running || run.current_step.as_deref() != Some(state.id.as_str())
        {
            tracing::debug!(
                status = %run.status,
                current_step = ?run.current_step,
                "run is not at this step, dropping stale task"
            );
            return Ok(None);
        }

        if let Some(existing) = self.repo.get_step_run(&run.id, &state.id).await? {
            match existing.status {
                StepRunStatus::Completed => {
                    tracing::info!("replaying persisted step completion");
                    let completion = StepCompletion {
                        output: existing.output.unwrap_or(Value::Null),
                        write_path: existing.write_path,
                        next_step: existing.next_step,
                    };
                    return self.advance(run, def, state, completion).await.map(Some);
                }
                StepRunStatus::Failed => {
                    let error = existing.error.unwrap_or_else(|| RunError {
                        step_id: Some(state.id.clone()),
                        class: "internal".to_string(),
                        message: "step failed".to_string(),
                    });
                    return self.fail_run(run, error).await.map(Some);
                }
                _ if attempt < existing.attempt => {
                    tracing::debug!(current = existing.attempt, "stale attempt, dropping");
                    return Ok(None);
                }
                _ => {}
            }
        }

        let record = StepRun {
            run_id: run.id,
            step_id: state.id.clone(),
            step_type: state.state_type().to_string(),
            status: StepRunStatus::Running,
            attempt,
            output: None,
            next_step: None,
            write_path: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let cancel = CancellationToken::new();
        self.in_flight.insert(run.id, cancel.clone());
        let recorded = match self.repo.start_step(&record).await {
            Ok(recorded) => recorded,
            Err(e) => {
                self.in_flight.remove(&run.id);
                return Err(e.into());
            }
        };
        if recorded.status.is_terminal() {
            self.in_flight.remove(&run.id);
            return Ok(None);
        }

        let result = execute_state(&self.runtime, run.id, state, &run.context, attempt, &cancel).await;
        self.in_flight.remove(&run.id);

        match result {
            Ok(StepOutcome::Completed {
                output,
                write_path,
                next,
            }) => self
                .handle_step_completion(run, def, state, attempt, output, write_path, next)
                .await
                .map(Some),
            Ok(StepOutcome::Suspended { wake_at }) => {
                self.suspend(run, state, wake_at).await.map(Some)
            }
            Ok(StepOutcome::AwaitingApproval(pending)) => {
                self.await_approval(run, pending).await.map(Some)
            }
            Err(error) => self
                .handle_step_failure(run, state, attempt, error)
                .await
                .map(Some),
        }
    }

    /// Persist a completed step and advance the run past it.
    #[allow(clippy::too_many_arguments)]
    async fn handle_step_completion(
        &self,
        run: WorkflowRun,
        def: &WorkflowDefinition,
        state: &StateDefinition,
        attempt: u32,
        output: Value,
        write_path: Option<String>,
        next: Next,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let mut context = RunContext::from_value(run.context.clone(), self.config.max_context_bytes);
        if let Err(e) = context.apply_step_output(&state.id, write_path.as_deref(), &output) {
            return self
                .handle_step_failure(run, state, attempt, StepError::from(e))
                .await;
        }
        let next_step = match resolve_next(state, &next, context.as_value(), &output) {
            Ok(target) => target,
            Err(e) => return self.handle_step_failure(run, state, attempt, e).await,
        };

        let completion = StepCompletion {
            output,
            write_path,
            next_step,
        };
        self.repo
            .complete_step(&run.id, &state.id, &completion)
            .await?;
        tracing::info!(next = ?completion.next_step, "step completed");
        self.advance(run, def, state, completion).await
    }

    /// Merge a persisted completion into the run and move to the next state.
    async fn advance(
        &self,
        mut run: WorkflowRun,
        def: &WorkflowDefinition,
        state: &StateDefinition,
        completion: StepCompletion,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let mut context = RunContext::from_value(run.context, self.config.max_context_bytes);
        if let Err(e) =
            context.apply_step_output(&state.id, completion.write_path.as_deref(), &completion.output)
        {
            run.context = context.into_value();
            return self.fail_run(run, context_error(&state.id, e)).await;
        }
        run.context = context.into_value();
        run.updated_at = Utc::now();

        let next = completion
            .next_step
            .as_deref()
            .and_then(|id| def.state(id).map(|s| s.id.clone()));
        match (completion.next_step, next) {
            (Some(_), Some(next)) => {
                run.current_step = Some(next.clone());
                if !self.repo.save_run_state(&run).await? {
                    tracing::info!("run became terminal concurrently, not advancing");
                    return Ok(run);
                }
                self.publish_task(
                    &StepTask::execute(run.id, next, 1),
                    PublishOptions::immediate(),
                )
                .await?;
            }
            (Some(missing), None) => {
                let error = RunError {
                    step_id: Some(state.id.clone()),
                    class: "validation".to_string(),
                    message: format!("transition target '{missing}' does not exist"),
                };
                return self.fail_run(run, error).await;
            }
            (None, _) => {
                let now = Utc::now();
                run.status = RunStatus::Completed;
                run.completed_at = Some(now);
                run.updated_at = now;
                self.repo.save_run_state(&run).await?;
                tracing::info!(run_id = %run.id, last_step = %state.id, "run completed");
            }
        }
        Ok(run)
    }

    /// Park the run until `wake_at`.
    async fn suspend(
        &self,
        mut run: WorkflowRun,
        state: &StateDefinition,
        wake_at: chrono::DateTime<Utc>,
    ) -> Result<WorkflowRun, CoordinatorError> {
        run.status = RunStatus::Waiting;
        run.wake_at = Some(wake_at);
        run.updated_at = Utc::now();
        if !self.repo.save_run_state(&run).await? {
            return Ok(run);
        }
        self.arm_timer(run, &state.id).await
    }

    /// Park the run on an approval request until a decision or its expiry.
    async fn await_approval(
        &self,
        mut run: WorkflowRun,
        pending: PendingApproval,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let step_id = pending.step_id.clone();
        tracing::info!(
            run_id = %run.id,
            approval_id = %pending.approval_id,
            expires_at = %pending.expires_at,
            "run waiting on approval"
        );
        run.status = RunStatus::Waiting;
        run.wake_at = Some(pending.expires_at);
        run.approval = Some(pending);
        run.updated_at = Utc::now();
        if !self.repo.save_run_state(&run).await? {
            return Ok(run);
        }
        self.arm_timer(run, &step_id).await
    }

    /// Publish the delayed timer task for a waiting run and record its id.
    async fn arm_timer(
        &self,
        mut run: WorkflowRun,
        step_id: &str,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let wake_at = run.wake_at.unwrap_or_else(Utc::now);
        let message_id = self
            .publish_task(
                &StepTask::timer_fired(run.id, step_id),
                PublishOptions::at(wake_at),
            )
            .await?;
        run.timer_message_id = Some(message_id);
        run.updated_at = Utc::now();
        if !self.repo.save_run_state(&run).await? {
            self.bus.cancel_scheduled(&message_id).await?;
            return Ok(run);
        }
        tracing::info!(run_id = %run.id, step_id, %wake_at, "run waiting on timer");
        Ok(run)
    }

    async fn resume_after_timer(
        &self,
        mut run: WorkflowRun,
        def: &WorkflowDefinition,
        state: &StateDefinition,
    ) -> Result<Option<WorkflowRun>, CoordinatorError> {
        if run.status != RunStatus::Waiting || run.current_step.as_deref() != Some(state.id.as_str())
        {
            tracing::debug!(status = %run.status, "run is not waiting on this timer, dropping");
            return Ok(None);
        }

        if let Some(pending) = run.approval.take() {
            tracing::warn!(approval_id = %pending.approval_id, "approval expired");
            run.status = RunStatus::Running;
            run.wake_at = None;
            run.timer_message_id = None;
            let attempt = self.current_attempt(&run.id, &state.id).await?;
            return self
                .handle_step_failure(run, state, attempt, StepError::ApprovalTimedOut)
                .await
                .map(Some);
        }

        let output = json!({
            "wake_at": run.wake_at,
            "fired_at": Utc::now(),
        });
        run.status = RunStatus::Running;
        run.wake_at = None;
        run.timer_message_id = None;
        let attempt = self.current_attempt(&run.id, &state.id).await?;
        tracing::info!("timer fired, resuming run");
        self.handle_step_completion(
            run,
            def,
            state,
            attempt,
            output,
            state.result_path.clone(),
            Next::Transitions,
        )
        .await
        .map(Some)
    }

    async fn current_attempt(&self, run_id: &Uuid, step_id: &str) -> Result<u32, CoordinatorError> {
        Ok(self
            .repo
            .get_step_run(run_id, step_id)
            .await?
            .map(|s| s.attempt)
            .unwrap_or(1))
    }

    /// Retry the step if its policy allows, otherwise fail the run.
    async fn handle_step_failure(
        &self,
        mut run: WorkflowRun,
        state: &StateDefinition,
        attempt: u32,
        error: StepError,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let run_error = RunError {
            step_id: Some(state.id.clone()),
            class: error.class().to_string(),
            message: error.to_string(),
        };

        if matches!(error, StepError::Cancelled) {
            self.repo.fail_step(&run.id, &state.id, &run_error).await?;
            let now = Utc::now();
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(now);
            run.updated_at = now;
            self.repo.save_run_state(&run).await?;
            tracing::info!(run_id = %run.id, "run cancelled during step");
            return Ok(run);
        }

        let policy = RetryPolicy::from_config(state.retry.as_ref());
        if policy.should_retry(attempt, error.class(), error.is_retryable()) {
            let next_attempt = attempt + 1;
            let delay = policy.delay_for_attempt(next_attempt);
            tracing::warn!(
                error = %error,
                class = error.class(),
                next_attempt,
                ?delay,
                "step failed, scheduling retry"
            );
            let record = StepRun {
                run_id: run.id,
                step_id: state.id.clone(),
                step_type: state.state_type().to_string(),
                status: StepRunStatus::Running,
                attempt: next_attempt,
                output: None,
                next_step: None,
                write_path: None,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            self.repo.start_step(&record).await?;
            run.updated_at = Utc::now();
            self.repo.save_run_state(&run).await?;
            self.publish_task(
                &StepTask::execute(run.id, state.id.clone(), next_attempt),
                PublishOptions::after(delay),
            )
            .await?;
            return Ok(run);
        }

        self.repo.fail_step(&run.id, &state.id, &run_error).await?;
        self.fail_run(run, run_error).await
    }

    async fn fail_run(
        &self,
        mut run: WorkflowRun,
        error: RunError,
    ) -> Result<WorkflowRun, CoordinatorError> {
        tracing::warn!(run_id = %run.id, error = %error, "run failed");
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.error = Some(error);
        run.completed_at = Some(now);
        run.updated_at = now;
        self.repo.save_run_state(&run).await?;
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Cancellation and recovery
    // -----------------------------------------------------------------------

    /// Cancel a run: stop its in-flight step, withdraw a pending timer and
    /// mark it cancelled. Cancelling an already cancelled run is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<WorkflowRun, CoordinatorError> {
        let token = self.in_flight.get(&run_id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
        }

        if self.repo.get_run(&run_id).await?.is_none() {
            return Err(CoordinatorError::RunNotFound(run_id));
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let Some(mut run) = self.repo.get_run(&run_id).await? else {
            self.run_locks.remove(&run_id);
            return Err(CoordinatorError::RunNotFound(run_id));
        };
        if run.status.is_terminal() {
            self.run_locks.remove(&run_id);
            return match run.status {
                RunStatus::Cancelled => Ok(run),
                status => Err(CoordinatorError::AlreadyTerminal(run_id, status)),
            };
        }

        if let Some(message_id) = run.timer_message_id.take() {
            let withdrawn = self.bus.cancel_scheduled(&message_id).await?;
            tracing::debug!(%message_id, withdrawn, "withdrew pending timer");
        }
        if let Some(step_id) = &run.current_step {
            let error = RunError {
                step_id: Some(step_id.clone()),
                class: "cancelled".to_string(),
                message: "run cancelled".to_string(),
            };
            match self.repo.fail_step(&run_id, step_id, &error).await {
                Ok(_) | Err(RepositoryError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        run.status = RunStatus::Cancelled;
        run.wake_at = None;
        run.approval = None;
        run.completed_at = Some(now);
        run.updated_at = now;
        self.repo.save_run_state(&run).await?;
        self.run_locks.remove(&run_id);
        tracing::info!("run cancelled");
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Approve the run's pending approval and continue past the step.
    #[tracing::instrument(skip(self, comment))]
    pub async fn approve_step(
        &self,
        run_id: Uuid,
        approver: &str,
        comment: Option<String>,
    ) -> Result<WorkflowRun, CoordinatorError> {
        self.decide(run_id, approver, Decision::Approve { comment }).await
    }

    /// Reject the run's pending approval; the step fails with `approval_rejected`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn reject_step(
        &self,
        run_id: Uuid,
        approver: &str,
        reason: Option<String>,
    ) -> Result<WorkflowRun, CoordinatorError> {
        self.decide(run_id, approver, Decision::Reject { reason }).await
    }

    async fn decide(
        &self,
        run_id: Uuid,
        approver: &str,
        decision: Decision,
    ) -> Result<WorkflowRun, CoordinatorError> {
        if self.repo.get_run(&run_id).await?.is_none() {
            return Err(CoordinatorError::RunNotFound(run_id));
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let Some(mut run) = self.repo.get_run(&run_id).await? else {
            self.run_locks.remove(&run_id);
            return Err(CoordinatorError::RunNotFound(run_id));
        };
        if run.status.is_terminal() {
            self.run_locks.remove(&run_id);
            return Err(CoordinatorError::AlreadyTerminal(run_id, run.status));
        }
        let pending = match (&run.status, &run.approval) {
            (RunStatus::Waiting, Some(pending)) => pending.clone(),
            _ => return Err(CoordinatorError::NoPendingApproval(run_id)),
        };
        if !pending.allows(approver) {
            return Err(CoordinatorError::ApproverNotAllowed {
                run_id,
                approver: approver.to_string(),
            });
        }

        let stored = self
            .get_definition(&run.definition_id, Some(&run.definition_hash))
            .await?;
        let def = &stored.definition;
        let state = def
            .state(&pending.step_id)
            .ok_or_else(|| CoordinatorError::UnknownState(pending.step_id.clone()))?;

        if let Some(message_id) = run.timer_message_id.take() {
            self.bus.cancel_scheduled(&message_id).await?;
        }
        run.status = RunStatus::Running;
        run.wake_at = None;
        run.approval = None;
        let attempt = self.current_attempt(&run_id, &state.id).await?;

        let expired = Utc::now() >= pending.expires_at;
        let run = match decision {
            _ if expired => {
                let run = self
                    .handle_step_failure(run, state, attempt, StepError::ApprovalTimedOut)
                    .await?;
                self.release_lock(&run);
                return Err(CoordinatorError::ApprovalExpired(run_id));
            }
            Decision::Approve { comment } => {
                tracing::info!(approval_id = %pending.approval_id, approver, "approval granted");
                let output = json!({
                    "approval_id": pending.approval_id,
                    "status": "approved",
                    "decided_by": approver,
                    "decision_reason": comment,
                });
                self.handle_step_completion(
                    run,
                    def,
                    state,
                    attempt,
                    output,
                    state.result_path.clone(),
                    Next::Transitions,
                )
                .await?
            }
            Decision::Reject { reason } => {
                let reason = reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "Approval was rejected".to_string());
                tracing::info!(
                    approval_id = %pending.approval_id,
                    approver,
                    %reason,
                    "approval rejected"
                );
                self.handle_step_failure(run, state, attempt, StepError::ApprovalRejected(reason))
                    .await?
            }
        };
        self.release_lock(&run);
        Ok(run)
    }

    /// Waiting runs parked on an approval, newest first.
    pub async fn list_pending_approvals(&self) -> Result<Vec<WorkflowRun>, CoordinatorError> {
        let filter = RunFilter {
            status: Some(RunStatus::Waiting),
            limit: Some(100),
            ..Default::default()
        };
        let runs = self.repo.list_runs(&filter).await?;
        Ok(runs.into_iter().filter(|r| r.approval.is_some()).collect())
    }

    /// Wait `recovery_delay_secs`, then recover in-flight runs.
    pub async fn recover_pending_runs(&self) -> Result<usize, CoordinatorError> {
        tokio::time::sleep(Duration::from_secs(self.config.recovery_delay_secs)).await;
        self.recover_now().await
    }

    /// Republish the current step of every pending or running run and
    /// re-arm the timers of waiting runs. Returns the number of runs touched.
    pub async fn recover_now(&self) -> Result<usize, CoordinatorError> {
        let max_age = chrono::Duration::try_seconds(self.config.recovery_max_age_secs as i64)
            .unwrap_or(chrono::Duration::hours(4));
        let runs = self.repo.list_recoverable_runs(Utc::now() - max_age).await?;
        let mut recovered = 0;

        for run in runs {
            let lock = self.run_lock(run.id);
            let _guard = lock.lock().await;

            let Some(mut run) = self.repo.get_run(&run.id).await? else {
                continue;
            };
            let Some(step_id) = run.current_step.clone() else {
                continue;
            };

            match run.status {
                RunStatus::Pending | RunStatus::Running => {
                    if run.status == RunStatus::Pending {
                        run.status = RunStatus::Running;
                        run.updated_at = Utc::now();
                        self.repo.save_run_state(&run).await?;
                    }
                    let attempt = self
                        .repo
                        .get_step_run(&run.id, &step_id)
                        .await?
                        .map(|s| s.attempt)
                        .unwrap_or(1);
                    self.publish_task(
                        &StepTask::execute(run.id, step_id.clone(), attempt),
                        PublishOptions::immediate(),
                    )
                    .await?;
                }
                RunStatus::Waiting => {
                    if let Some(old) = run.timer_message_id.take() {
                        self.bus.cancel_scheduled(&old).await?;
                    }
                    self.arm_timer(run.clone(), &step_id).await?;
                }
                _ => continue,
            }
            tracing::info!(run_id = %run.id, step_id = %step_id, status = %run.status, "recovered run");
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "recovery complete");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, CoordinatorError> {
        self.repo
            .get_run(&run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, CoordinatorError> {
        Ok(self.repo.list_runs(filter).await?)
    }

    pub async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, CoordinatorError> {
        Ok(self.repo.list_step_runs(&run_id).await?)
    }

    /// Poll until the run reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_run(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowRun, CoordinatorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoordinatorError::WaitTimeout(run_id));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

enum Decision {
    Approve { comment: Option<String> },
    Reject { reason: Option<String> },
}

fn context_error(step_id: &str, error: ContextError) -> RunError {
    RunError {
        step_id: Some(step_id.to_string()),
        class: "validation".to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InMemoryMessageBus;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::agent::AgentExecutor;
    use crate::workflow::testing::{FlakyAgent, ScriptedAgent};
    use crate::workflow::worker::StepWorker;
    use std::sync::atomic::Ordering;

    type Engine = WorkflowEngine<InMemoryWorkflowRepository, InMemoryMessageBus>;

    const ALERT: &str = r#"
id: alert-routing
states:
  - id: alert
    type: inject
    config:
      data: { severity: high }
    result_path: alert
    next: route
  - id: route
    type: switch
    config:
      data_path: alert.severity
    transitions:
      - condition: "_value == 'critical'"
        next: page
      - condition: "_value == 'high'"
        next: notify
    default: log
  - id: page
    type: operation
    config: { task: "page on-call" }
    end: true
  - id: notify
    type: operation
    config: { task: "notify team" }
    end: true
  - id: log
    type: transform
    config: { expression: "alert.severity" }
    end: true
"#;

    fn engine_with(
        agent: Arc<dyn AgentExecutor>,
        repo: Arc<InMemoryWorkflowRepository>,
    ) -> Arc<Engine> {
        let bus = Arc::new(InMemoryMessageBus::new(
            Duration::from_secs(30),
            5,
            Duration::from_millis(10),
        ));
        let registry = Arc::new(StepExecutorRegistry::with_builtins(agent));
        Arc::new(WorkflowEngine::new(
            repo,
            bus,
            registry,
            EngineConfig::default(),
        ))
    }

    fn engine(agent: Arc<dyn AgentExecutor>) -> Arc<Engine> {
        engine_with(agent, Arc::new(InMemoryWorkflowRepository::new()))
    }

    fn spawn_worker(engine: &Arc<Engine>) -> CancellationToken {
        let shutdown = CancellationToken::new();
        tokio::spawn(StepWorker::new(engine.clone()).run(shutdown.clone()));
        shutdown
    }

    async fn wait_for_status(engine: &Engine, run_id: Uuid, status: RunStatus) -> WorkflowRun {
        for _ in 0..250 {
            let run = engine.get_run(run_id).await.unwrap();
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {run_id} never reached {status}");
    }

    /// Wait until the run is parked on an approval with its expiry timer armed.
    async fn wait_for_approval(engine: &Engine, run_id: Uuid) -> WorkflowRun {
        for _ in 0..250 {
            let run = engine.get_run(run_id).await.unwrap();
            if run.approval.is_some() && run.timer_message_id.is_some() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {run_id} never waited on an approval");
    }

    fn step_ids(steps: &[StepRun]) -> Vec<&str> {
        steps.iter().map(|s| s.step_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_alert_routes_to_notify() {
        let agent = Arc::new(ScriptedAgent::default());
        let engine = engine(agent.clone());
        engine.register_yaml(ALERT).await.unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("alert-routing", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step.as_deref(), Some("alert"));

        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step.as_deref(), Some("notify"));
        assert!(run.completed_at.is_some());
        assert_eq!(run.context["alert"]["severity"], "high");
        assert_eq!(run.context["steps"]["route"]["output"]["next"], "notify");
        assert_eq!(
            run.context["steps"]["notify"]["output"]["response"],
            "notify team"
        );

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(step_ids(&steps), vec!["alert", "route", "notify"]);
        assert!(steps.iter().all(|s| s.status == StepRunStatus::Completed));
        assert_eq!(steps[1].next_step.as_deref(), Some("notify"));
        assert_eq!(agent.call_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(
                r#"
id: typed
input_schema:
  type: object
  required: [severity]
states:
  - id: only
    type: inject
    config: { data: 1 }
    end: true
"#,
            )
            .await
            .unwrap();

        let err = engine
            .create_run("typed", json!({}), TriggerKind::Api)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidInput(_)));
        assert!(engine.list_runs(&RunFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_definition() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        let err = engine
            .create_run("missing", json!({}), TriggerKind::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DefinitionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_replays_persisted_completion_after_crash() {
        let agent = Arc::new(ScriptedAgent::default());
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = engine_with(agent.clone(), repo.clone());
        engine.register_yaml(ALERT).await.unwrap();
        let run = engine
            .create_run("alert-routing", json!({}), TriggerKind::Manual)
            .await
            .unwrap();

        // The step finished and was recorded, but the run never advanced.
        let started = StepRun {
            run_id: run.id,
            step_id: "alert".into(),
            step_type: "inject".into(),
            status: StepRunStatus::Running,
            attempt: 1,
            output: None,
            next_step: None,
            write_path: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        repo.start_step(&started).await.unwrap();
        let completion = StepCompletion {
            output: json!({"severity": "critical"}),
            write_path: Some("alert".into()),
            next_step: Some("route".into()),
        };
        repo.complete_step(&run.id, "alert", &completion)
            .await
            .unwrap();

        engine
            .handle_step_task(StepTask::execute(run.id, "alert", 1))
            .await
            .unwrap();
        let after = engine.get_run(run.id).await.unwrap();
        assert_eq!(after.current_step.as_deref(), Some("route"));
        // The recorded output wins over re-executing the inject.
        assert_eq!(after.context["alert"]["severity"], "critical");

        // A duplicate delivery of the same task changes nothing.
        engine
            .handle_step_task(StepTask::execute(run.id, "alert", 1))
            .await
            .unwrap();
        assert_eq!(engine.get_run(run.id).await.unwrap(), after);
        assert_eq!(engine.list_step_runs(run.id).await.unwrap().len(), 1);

        engine
            .handle_step_task(StepTask::execute(run.id, "route", 1))
            .await
            .unwrap();
        engine
            .handle_step_task(StepTask::execute(run.id, "page", 1))
            .await
            .unwrap();
        let done = engine.get_run(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.current_step.as_deref(), Some("page"));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_execute_once() {
        let agent = Arc::new(ScriptedAgent::default());
        let engine = engine(agent.clone());
        engine
            .register_yaml(
                r#"
id: single
states:
  - id: call
    type: operation
    config: { task: "sleep:100:hello" }
    end: true
"#,
            )
            .await
            .unwrap();
        let run = engine
            .create_run("single", json!({}), TriggerKind::Manual)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            engine.handle_step_task(StepTask::execute(run.id, "call", 1)),
            engine.handle_step_task(StepTask::execute(run.id, "call", 1)),
        );
        let busy = [&a, &b]
            .into_iter()
            .filter(|r| matches!(r, Err(CoordinatorError::RunBusy(id)) if *id == run.id))
            .count();
        assert_eq!(busy, 1, "the second delivery is refused, not queued: {a:?} {b:?}");
        assert!(a.is_ok() || b.is_ok());

        // The refused delivery comes back later and finds nothing to do.
        engine
            .handle_step_task(StepTask::execute(run.id, "call", 1))
            .await
            .unwrap();

        assert_eq!(agent.call_count(), 1);
        let run = engine.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(engine.list_step_runs(run.id).await.unwrap().len(), 1);
        assert!(engine.run_locks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_leaves_no_lock_behind() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        let missing = Uuid::now_v7();

        engine
            .handle_step_task(StepTask::execute(missing, "alert", 1))
            .await
            .unwrap();
        let err = engine.cancel_run(missing).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::RunNotFound(id) if id == missing));

        assert!(engine.run_locks.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_republishes_in_flight_runs() {
        let agent = Arc::new(ScriptedAgent::default());
        let repo = Arc::new(InMemoryWorkflowRepository::new());

        let crashed = engine_with(agent.clone(), repo.clone());
        crashed.register_yaml(ALERT).await.unwrap();
        let run = crashed
            .create_run("alert-routing", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        // The published task dies with the old bus.
        drop(crashed);

        let restarted = engine_with(agent.clone(), repo.clone());
        assert_eq!(restarted.recover_now().await.unwrap(), 1);
        let shutdown = spawn_worker(&restarted);

        let run = restarted
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step.as_deref(), Some("notify"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let agent = Arc::new(FlakyAgent::new(2));
        let engine = engine(agent.clone());
        engine
            .register_yaml(
                r#"
id: flaky
states:
  - id: call
    type: operation
    config: { task: "deploy" }
    retry: { max_attempts: 3, initial_interval_ms: 10 }
    end: true
"#,
            )
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("flaky", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].attempt, 3);
        assert_eq!(steps[0].output.as_ref().unwrap()["response"], "done: deploy");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_retries_exhausted_fail_run() {
        let agent = Arc::new(FlakyAgent::new(10));
        let engine = engine(agent.clone());
        engine
            .register_yaml(
                r#"
id: flaky
states:
  - id: call
    type: operation
    config: { task: "deploy" }
    retry: { max_attempts: 2, initial_interval_ms: 10 }
    end: true
"#,
            )
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("flaky", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.step_id.as_deref(), Some("call"));
        assert_eq!(error.class, "operation_failed");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, StepRunStatus::Failed);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_try_catch_routes_to_recovery_state() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(
                r#"
id: guarded
states:
  - id: guard
    type: try_catch
    config:
      try:
        states:
          - id: risky
            type: operation
            config: { task: "fail:boom" }
            end: true
      catch:
        - errors: [operation_failed]
          next: recover
    next: done
  - id: recover
    type: inject
    config: { data: recovered }
    result_path: outcome
    end: true
  - id: done
    type: inject
    config: { data: fine }
    result_path: outcome
    end: true
"#,
            )
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("guarded", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step.as_deref(), Some("recover"));
        assert_eq!(run.context["outcome"], "recovered");
        assert_eq!(run.context["error"]["class"], "operation_failed");
        assert_eq!(run.context["error"]["step_id"], "risky");
        assert!(run.context["error"].get("error").is_none());

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(step_ids(&steps), vec!["guard", "recover"]);
        assert_eq!(steps[0].write_path.as_deref(), Some("error"));
        shutdown.cancel();
    }

    const TIMER: &str = r#"
id: waiter
states:
  - id: wait
    type: timer
    config: { delay_secs: 1 }
    next: done
  - id: done
    type: inject
    config: { data: 1 }
    result_path: finished
    end: true
"#;

    #[tokio::test]
    async fn test_timer_waits_then_resumes() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine.register_yaml(TIMER).await.unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("waiter", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let waiting = wait_for_status(&engine, run.id, RunStatus::Waiting).await;
        assert!(waiting.wake_at.is_some());
        assert!(waiting.timer_message_id.is_some());

        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context["finished"], 1);
        assert!(run.wake_at.is_none());

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(step_ids(&steps), vec!["wait", "done"]);
        let timer_output = steps[0].output.as_ref().unwrap();
        assert!(timer_output.get("fired_at").is_some());
        shutdown.cancel();
    }

    const APPROVAL: &str = r#"
id: release
states:
  - id: prepare
    type: inject
    config:
      data: { version: "1.2.0", changes: 4 }
    result_path: release
    next: signoff
  - id: signoff
    type: approval
    config:
      message: "Deploy {{ release.version }}?"
      summary_path: release
      approvers: [alice]
      timeout_secs: 60
    result_path: decision
    next: deploy
  - id: deploy
    type: operation
    config: { task: "deploy {{ release.version }}" }
    end: true
"#;

    #[tokio::test]
    async fn test_approval_parks_run_until_approved() {
        let agent = Arc::new(ScriptedAgent::default());
        let engine = engine(agent.clone());
        engine.register_yaml(APPROVAL).await.unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("release", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let waiting = wait_for_approval(&engine, run.id).await;
        assert_eq!(waiting.status, RunStatus::Waiting);
        let pending = waiting.approval.clone().expect("pending approval");
        assert_eq!(pending.step_id, "signoff");
        assert_eq!(pending.message, "Deploy 1.2.0?");
        assert_eq!(pending.summary, Some(json!({"version": "1.2.0", "changes": 4})));
        assert_eq!(waiting.wake_at, Some(pending.expires_at));
        let timer_id = waiting.timer_message_id.expect("expiry timer armed");

        let listed = engine.list_pending_approvals().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, run.id);

        let err = engine.approve_step(run.id, "mallory", None).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ApproverNotAllowed { ref approver, .. } if approver == "mallory"
        ));
        assert_eq!(engine.get_run(run.id).await.unwrap().status, RunStatus::Waiting);

        let resumed = engine
            .approve_step(run.id, "alice", Some("lgtm".into()))
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.current_step.as_deref(), Some("deploy"));
        assert!(resumed.approval.is_none());
        assert!(!engine.bus().cancel_scheduled(&timer_id).await.unwrap());

        let done = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.context["decision"]["status"], "approved");
        assert_eq!(done.context["decision"]["decided_by"], "alice");
        assert_eq!(done.context["decision"]["decision_reason"], "lgtm");
        assert_eq!(agent.call_count(), 1);
        assert!(engine.list_pending_approvals().await.unwrap().is_empty());

        let err = engine.approve_step(run.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyTerminal(_, RunStatus::Completed)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rejected_approval_fails_run() {
        let agent = Arc::new(ScriptedAgent::default());
        let engine = engine(agent.clone());
        engine.register_yaml(APPROVAL).await.unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("release", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_for_approval(&engine, run.id).await;

        let failed = engine.reject_step(run.id, "alice", None).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.approval.is_none());
        let error = failed.error.unwrap();
        assert_eq!(error.class, "approval_rejected");
        assert_eq!(error.step_id.as_deref(), Some("signoff"));
        assert!(error.message.contains("Approval was rejected"));

        let steps = engine.list_step_runs(run.id).await.unwrap();
        let signoff = steps.iter().find(|s| s.step_id == "signoff").unwrap();
        assert_eq!(signoff.status, StepRunStatus::Failed);
        assert_eq!(agent.call_count(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unanswered_approval_times_out() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(&APPROVAL.replace("timeout_secs: 60", "timeout_secs: 1"))
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("release", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().class, "approval_timed_out");

        let err = engine.approve_step(run.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyTerminal(_, RunStatus::Failed)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_late_decision_after_expiry_is_refused() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(&APPROVAL.replace("timeout_secs: 60", "timeout_secs: 1"))
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("release", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_for_approval(&engine, run.id).await;
        // No worker left to deliver the expiry timer.
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let err = engine.approve_step(run.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ApprovalExpired(id) if id == run.id));
        let run = engine.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().class, "approval_timed_out");
    }

    #[tokio::test]
    async fn test_decision_needs_pending_approval() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(&TIMER.replace("delay_secs: 1", "delay_secs: 60"))
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("waiter", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_for_status(&engine, run.id, RunStatus::Waiting).await;
        let err = engine.reject_step(run.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPendingApproval(id) if id == run.id));

        let missing = Uuid::now_v7();
        let err = engine.approve_step(missing, "alice", None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::RunNotFound(id) if id == missing));
        assert!(!engine.run_locks.contains_key(&missing));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_waiting_run() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(&TIMER.replace("delay_secs: 1", "delay_secs: 60"))
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("waiter", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let waiting = wait_for_status(&engine, run.id, RunStatus::Waiting).await;

        let cancelled = engine.cancel_run(run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.timer_message_id.is_none());
        let timer_id = waiting.timer_message_id.unwrap();
        assert!(!engine.bus().cancel_scheduled(&timer_id).await.unwrap());

        // Cancelling twice is a no-op.
        let again = engine.cancel_run(run.id).await.unwrap();
        assert_eq!(again.status, RunStatus::Cancelled);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_in_flight_operation() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine
            .register_yaml(
                r#"
id: slow
states:
  - id: call
    type: operation
    config: { task: "sleep:5000:late" }
    end: true
"#,
            )
            .await
            .unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("slow", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        for _ in 0..100 {
            if !engine.list_step_runs(run.id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let started = std::time::Instant::now();
        let cancelled = engine.cancel_run(run.id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(steps[0].status, StepRunStatus::Failed);
        assert_eq!(steps[0].error.as_ref().unwrap().class, "cancelled");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_completed_run_rejected() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine.register_yaml(ALERT).await.unwrap();
        let shutdown = spawn_worker(&engine);
        let run = engine
            .create_run("alert-routing", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();

        let err = engine.cancel_run(run.id).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::AlreadyTerminal(_, RunStatus::Completed)
        ));
        shutdown.cancel();
    }

    const NIGHTLY: &str = r#"
id: nightly
states:
  - id: tick
    type: cron
    config:
      schedule: "every 5 minutes"
      input: { source: cron }
    next: work
  - id: work
    type: inject
    config: { data: { ok: true } }
    result_path: result
    end: true
"#;

    #[tokio::test]
    async fn test_cron_entry_is_skipped() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        engine.register_yaml(NIGHTLY).await.unwrap();
        let shutdown = spawn_worker(&engine);

        let run = engine
            .create_run("nightly", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        assert_eq!(run.current_step.as_deref(), Some("work"));
        let run = engine
            .wait_for_run(run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let steps = engine.list_step_runs(run.id).await.unwrap();
        assert_eq!(step_ids(&steps), vec!["work"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_triggered_run_is_deduplicated() {
        let engine = engine(Arc::new(ScriptedAgent::default()));
        let stored = engine.register_yaml(NIGHTLY).await.unwrap();
        let run_id = Uuid::now_v7();

        let (run, created) = engine
            .start_triggered_run("nightly", &stored.hash, "tick", run_id)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(run.trigger, TriggerKind::Cron);
        assert_eq!(run.input, json!({"source": "cron"}));
        assert_eq!(run.current_step.as_deref(), Some("work"));

        let (again, created) = engine
            .start_triggered_run("nightly", &stored.hash, "tick", run_id)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, run_id);
        assert_eq!(
            engine.list_runs(&RunFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_transient_error_classification() {
        assert!(CoordinatorError::Repository(RepositoryError::Connection).is_transient());
        assert!(CoordinatorError::Bus(BusError::Closed).is_transient());
        assert!(CoordinatorError::RunBusy(Uuid::nil()).is_transient());
        assert!(!CoordinatorError::RunNotFound(Uuid::nil()).is_transient());
    }
}
