//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Definitions are JSON blobs keyed by (id, hash). Every
//! write to `workflow_runs` and `step_runs` is guarded in SQL so a terminal
//! status is never overwritten, whichever process writes last.

use stepwise_core::repository::RunFilter;
use stepwise_core::repository::workflow::WorkflowRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    PendingApproval, RunError, StepCompletion, StepRun, StepRunStatus, StoredDefinition,
    TriggerKind, WorkflowDefinition, WorkflowRun,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_error};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn run_exists(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }

    async fn step_exists(&self, run_id: &Uuid, step_id: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM step_runs WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const TERMINAL_RUN: &str = "('completed', 'failed', 'cancelled')";
const TERMINAL_STEP: &str = "('completed', 'failed')";

fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Serialization(format!("invalid {column} JSON: {e}")))
}

fn parse_optional_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    raw.as_deref().map(|s| parse_json(column, s)).transpose()
}

fn definition_from_row(row: &SqliteRow) -> Result<StoredDefinition, RepositoryError> {
    let definition: String = row.try_get("definition").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;
    Ok(StoredDefinition {
        definition: parse_json::<WorkflowDefinition>("definition", &definition)?,
        hash: row.try_get("hash").map_err(query_error)?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get(column).map_err(query_error)
    };
    let get_opt = |column: &str| -> Result<Option<String>, RepositoryError> {
        row.try_get(column).map_err(query_error)
    };

    let status = get("status")?;
    let trigger = get("trigger_kind")?;
    Ok(WorkflowRun {
        id: parse_uuid(&get("id")?)?,
        definition_id: get("definition_id")?,
        definition_hash: get("definition_hash")?,
        workflow_name: get("workflow_name")?,
        status: status.parse().map_err(RepositoryError::Query)?,
        trigger: trigger.parse::<TriggerKind>().map_err(RepositoryError::Query)?,
        input: parse_json::<Value>("input", &get("input")?)?,
        context: parse_json::<Value>("context", &get("context")?)?,
        current_step: get_opt("current_step")?,
        wake_at: get_opt("wake_at")?.as_deref().map(parse_datetime).transpose()?,
        timer_message_id: get_opt("timer_message_id")?
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        approval: parse_optional_json::<PendingApproval>("approval", get_opt("approval")?)?,
        error: parse_optional_json::<RunError>("error", get_opt("error")?)?,
        created_at: parse_datetime(&get("created_at")?)?,
        updated_at: parse_datetime(&get("updated_at")?)?,
        completed_at: get_opt("completed_at")?
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRun, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get(column).map_err(query_error)
    };
    let get_opt = |column: &str| -> Result<Option<String>, RepositoryError> {
        row.try_get(column).map_err(query_error)
    };
    let attempt: i64 = row.try_get("attempt").map_err(query_error)?;
    let status = get("status")?;

    Ok(StepRun {
        run_id: parse_uuid(&get("run_id")?)?,
        step_id: get("step_id")?,
        step_type: get("step_type")?,
        status: status.parse::<StepRunStatus>().map_err(RepositoryError::Query)?,
        attempt: attempt.max(1) as u32,
        output: parse_optional_json::<Value>("output", get_opt("output")?)?,
        next_step: get_opt("next_step")?,
        write_path: get_opt("write_path")?,
        error: parse_optional_json::<RunError>("error", get_opt("error")?)?,
        started_at: parse_datetime(&get("started_at")?)?,
        completed_at: get_opt("completed_at")?
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(RepositoryError::from)
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &StoredDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, hash, name, definition, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id, hash) DO NOTHING"#,
        )
        .bind(&def.definition.id)
        .bind(&def.hash)
        .bind(&def.definition.name)
        .bind(to_json(&def.definition)?)
        .bind(format_datetime(&def.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        hash: &str,
    ) -> Result<Option<StoredDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT hash, definition, created_at FROM workflow_definitions WHERE id = ? AND hash = ?",
        )
        .bind(id)
        .bind(hash)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn get_latest_definition(
        &self,
        id: &str,
    ) -> Result<Option<StoredDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT hash, definition, created_at FROM workflow_definitions WHERE id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<StoredDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.hash, d.definition, d.created_at
               FROM workflow_definitions d
               JOIN (SELECT id, MAX(seq) AS seq FROM workflow_definitions GROUP BY id) latest
                 ON d.seq = latest.seq
               ORDER BY d.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, definition_id, definition_hash, workflow_name, status, trigger_kind,
                input, context, current_step, wake_at, timer_message_id, approval, error,
                created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition_id)
        .bind(&run.definition_hash)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(run.trigger.as_str())
        .bind(to_json(&run.input)?)
        .bind(to_json(&run.context)?)
        .bind(&run.current_step)
        .bind(run.wake_at.as_ref().map(format_datetime))
        .bind(run.timer_message_id.map(|id| id.to_string()))
        .bind(run.approval.as_ref().map(to_json).transpose()?)
        .bind(run.error.as_ref().map(to_json).transpose()?)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn save_run_state(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let sql = format!(
            r#"UPDATE workflow_runs SET
                 status = ?, context = ?, current_step = ?, wake_at = ?,
                 timer_message_id = ?, approval = ?, error = ?, updated_at = ?,
                 completed_at = ?
               WHERE id = ? AND status NOT IN {TERMINAL_RUN}"#
        );
        let result = sqlx::query(&sql)
            .bind(run.status.as_str())
            .bind(to_json(&run.context)?)
            .bind(&run.current_step)
            .bind(run.wake_at.as_ref().map(format_datetime))
            .bind(run.timer_message_id.map(|id| id.to_string()))
            .bind(run.approval.as_ref().map(to_json).transpose()?)
            .bind(run.error.as_ref().map(to_json).transpose()?)
            .bind(format_datetime(&run.updated_at))
            .bind(run.completed_at.as_ref().map(format_datetime))
            .bind(run.id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.run_exists(&run.id).await? {
            tracing::debug!(run_id = %run.id, "run is terminal, state not saved");
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE (?1 IS NULL OR definition_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY created_at DESC, id DESC
               LIMIT ?3"#,
        )
        .bind(&filter.definition_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit_or_default() as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_recoverable_runs(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let sql = format!(
            "SELECT * FROM workflow_runs WHERE status NOT IN {TERMINAL_RUN} AND updated_at >= ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format_datetime(&since))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn start_step(&self, step: &StepRun) -> Result<StepRun, RepositoryError> {
        let sql = format!(
            r#"INSERT INTO step_runs
               (run_id, step_id, step_type, status, attempt, started_at)
               VALUES (?, ?, ?, 'running', ?, ?)
               ON CONFLICT(run_id, step_id) DO UPDATE SET
                 status = 'running',
                 attempt = MAX(step_runs.attempt, excluded.attempt)
               WHERE step_runs.status NOT IN {TERMINAL_STEP}"#
        );
        sqlx::query(&sql)
            .bind(step.run_id.to_string())
            .bind(&step.step_id)
            .bind(&step.step_type)
            .bind(step.attempt as i64)
            .bind(format_datetime(&step.started_at))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        let row = sqlx::query("SELECT * FROM step_runs WHERE run_id = ? AND step_id = ?")
            .bind(step.run_id.to_string())
            .bind(&step.step_id)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_error)?;
        step_from_row(&row)
    }

    async fn complete_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        completion: &StepCompletion,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            r#"UPDATE step_runs SET
                 status = 'completed', output = ?, write_path = ?, next_step = ?,
                 error = NULL, completed_at = ?
               WHERE run_id = ? AND step_id = ? AND status NOT IN {TERMINAL_STEP}"#
        );
        let result = sqlx::query(&sql)
            .bind(to_json(&completion.output)?)
            .bind(&completion.write_path)
            .bind(&completion.next_step)
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.step_exists(run_id, step_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn fail_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
        error: &RunError,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            r#"UPDATE step_runs SET status = 'failed', error = ?, completed_at = ?
               WHERE run_id = ? AND step_id = ? AND status NOT IN {TERMINAL_STEP}"#
        );
        let result = sqlx::query(&sql)
            .bind(to_json(error)?)
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.step_exists(run_id, step_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn get_step_run(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_runs WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_runs WHERE run_id = ? ORDER BY started_at ASC, rowid ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(step_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
