//! In-process implementation of `WorkflowRepository`.
//!
//! Backs embedded engines and tests. Semantics match the SQLite repository:
//! definitions are insert-if-absent per (id, hash), run saves never
//! overwrite a terminal status, and step runs are keyed by (run_id, step_id).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    RunError, StepCompletion, StepRun, StepRunStatus, StoredDefinition, WorkflowRun,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RunFilter;
use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Tables {
    /// id -> versions in insertion order.
    definitions: HashMap<String, Vec<StoredDefinition>>,
    runs: HashMap<Uuid, WorkflowRun>,
    steps: HashMap<(Uuid, String), StepRun>,
}

/// `WorkflowRepository` held entirely in memory.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    tables: RwLock<Tables>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &StoredDefinition) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let versions = tables
            .definitions
            .entry(def.definition.id.clone())
            .or_default();
        if !versions.iter().any(|v| v.hash == def.hash) {
            versions.push(def.clone());
        }
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        hash: &str,
    ) -> Result<Option<StoredDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .get(id)
            .and_then(|versions| versions.iter().find(|v| v.hash == hash))
            .cloned())
    }

    async fn get_latest_definition(
        &self,
        id: &str,
    ) -> Result<Option<StoredDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .get(id)
            .and_then(|versions| versions.last())
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<StoredDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut latest: Vec<StoredDefinition> = tables
            .definitions
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.definition.id.cmp(&b.definition.id));
        Ok(latest)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.id) {
            return Ok(false);
        }
        tables.runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.tables.read().await.runs.get(run_id).cloned())
    }

    async fn save_run_state(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .runs
            .get_mut(&run.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.status = run.status;
        stored.context = run.context.clone();
        stored.current_step = run.current_step.clone();
        stored.wake_at = run.wake_at;
        stored.timer_message_id = run.timer_message_id;
        stored.approval = run.approval.clone();
        stored.error = run.error.clone();
        stored.updated_at = run.updated_at;
        stored.completed_at = run.completed_at;
        Ok(true)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .values()
            .filter(|r| {
                filter
                    .definition_id
                    .as_deref()
                    .is_none_or(|id| r.definition_id == id)
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(filter.limit_or_default() as usize);
        Ok(runs)
    }

    async fn list_recoverable_runs(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at >= since)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn start_step(&self, step: &StepRun) -> Result<StepRun, RepositoryError> {
        let mut tables = self.tables.write().await;
        let key = (step.run_id, step.step_id.clone());
        let stored = tables.steps.entry(key).or_insert_with(|| step.clone());
        if !stored.status.is_terminal() {
            stored.status = StepRunStatus::Running;
            stored.attempt = stored.attempt.max(step.attempt);
        }
        Ok(stored.clone())
    }

    async fn complete_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        completion: &StepCompletion,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .steps
            .get_mut(&(*run_id, step_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.status = StepRunStatus::Completed;
        stored.output = Some(completion.output.clone());
        stored.write_path = completion.write_path.clone();
        stored.next_step = completion.next_step.clone();
        stored.error = None;
        stored.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        error: &RunError,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .steps
            .get_mut(&(*run_id, step_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.status = StepRunStatus::Failed;
        stored.error = Some(error.clone());
        stored.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_step_run(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepRun>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.steps.get(&(*run_id, step_id.to_string())).cloned())
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut steps: Vec<StepRun> = tables
            .steps
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use stepwise_types::workflow::{RunStatus, TriggerKind, WorkflowDefinition};

    fn sample_run() -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            id: Uuid::now_v7(),
            definition_id: "wf".into(),
            definition_hash: "abc".into(),
            workflow_name: "wf".into(),
            status: RunStatus::Running,
            trigger: TriggerKind::Manual,
            input: json!({}),
            context: json!({}),
            current_step: Some("a".into()),
            wake_at: None,
            timer_message_id: None,
            approval: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn completion(output: Value, next: Option<&str>) -> StepCompletion {
        StepCompletion {
            output,
            write_path: Some("out".into()),
            next_step: next.map(str::to_string),
        }
    }

    fn sample_step(run_id: Uuid, attempt: u32) -> StepRun {
        StepRun {
            run_id,
            step_id: "a".into(),
            step_type: "inject".into(),
            status: StepRunStatus::Running,
            attempt,
            output: None,
            next_step: None,
            write_path: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn stored(id: &str, hash: &str) -> StoredDefinition {
        StoredDefinition {
            definition: WorkflowDefinition {
                id: id.into(),
                name: id.into(),
                version: None,
                description: None,
                start: None,
                input_schema: None,
                states: vec![],
                metadata: Default::default(),
            },
            hash: hash.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_definition_versions_and_latest() {
        let repo = InMemoryWorkflowRepository::new();
        repo.save_definition(&stored("wf", "h1")).await.unwrap();
        repo.save_definition(&stored("wf", "h2")).await.unwrap();
        repo.save_definition(&stored("wf", "h1")).await.unwrap();

        assert!(repo.get_definition("wf", "h1").await.unwrap().is_some());
        assert_eq!(
            repo.get_latest_definition("wf").await.unwrap().unwrap().hash,
            "h2"
        );
        assert_eq!(repo.list_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_run_is_insert_if_absent() {
        let repo = InMemoryWorkflowRepository::new();
        let run = sample_run();
        assert!(repo.create_run(&run).await.unwrap());
        assert!(!repo.create_run(&run).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_run_state_is_never_overwritten() {
        let repo = InMemoryWorkflowRepository::new();
        let mut run = sample_run();
        repo.create_run(&run).await.unwrap();

        run.status = RunStatus::Cancelled;
        assert!(repo.save_run_state(&run).await.unwrap());

        run.status = RunStatus::Completed;
        assert!(!repo.save_run_state(&run).await.unwrap());
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_start_step_upserts_one_record() {
        let repo = InMemoryWorkflowRepository::new();
        let run_id = Uuid::now_v7();
        repo.start_step(&sample_step(run_id, 1)).await.unwrap();
        let second = repo.start_step(&sample_step(run_id, 2)).await.unwrap();
        assert_eq!(second.attempt, 2);

        let stale = repo.start_step(&sample_step(run_id, 1)).await.unwrap();
        assert_eq!(stale.attempt, 2, "attempt never goes backwards");
        assert_eq!(repo.list_step_runs(&run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_step_is_terminal() {
        let repo = InMemoryWorkflowRepository::new();
        let run_id = Uuid::now_v7();
        repo.start_step(&sample_step(run_id, 1)).await.unwrap();
        assert!(
            repo.complete_step(&run_id, "a", &completion(json!(1), Some("b")))
                .await
                .unwrap()
        );
        assert!(!repo.complete_step(&run_id, "a", &completion(json!(2), None)).await.unwrap());

        let err = RunError {
            step_id: Some("a".into()),
            class: "internal".into(),
            message: "late failure".into(),
        };
        assert!(!repo.fail_step(&run_id, "a", &err).await.unwrap());

        let restarted = repo.start_step(&sample_step(run_id, 3)).await.unwrap();
        assert_eq!(restarted.status, StepRunStatus::Completed);
        assert_eq!(restarted.output, Some(json!(1)));
        assert_eq!(restarted.next_step.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_status() {
        let repo = InMemoryWorkflowRepository::new();
        let a = sample_run();
        let mut b = sample_run();
        b.status = RunStatus::Completed;
        repo.create_run(&a).await.unwrap();
        repo.create_run(&b).await.unwrap();

        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            ..Default::default()
        };
        let runs = repo.list_runs(&filter).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, b.id);

        let recoverable = repo
            .list_recoverable_runs(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].id, a.id);
    }
}
