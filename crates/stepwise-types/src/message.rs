//! Bus payloads exchanged between the coordinator, workers and the scheduler.
//!
//! Every unit of step work travels as a `StepTask` on a per-run, per-step
//! subject. Cron triggers travel as `CronTick` on a per-workflow subject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject prefix shared by every step-task subject.
pub const STEP_SUBJECT_PREFIX: &str = "workflow.run.";

/// Subject prefix shared by every cron tick subject.
pub const CRON_SUBJECT_PREFIX: &str = "workflow.cron.";

/// Subject a step-task for `step_id` of `run_id` is published on.
pub fn step_subject(run_id: &Uuid, step_id: &str) -> String {
    format!("{STEP_SUBJECT_PREFIX}{run_id}.step.{step_id}.schedule")
}

/// Subject a cron tick for `workflow_id` is published on.
pub fn cron_subject(workflow_id: &str) -> String {
    format!("{CRON_SUBJECT_PREFIX}{workflow_id}.tick")
}

/// Why a step-task was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Execute the step (first attempt or retry).
    Execute,
    /// The step's timer has elapsed; resume the run after it.
    TimerFired,
}

/// A request to execute (or resume after) one step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTask {
    pub run_id: Uuid,
    pub step_id: String,
    /// 1-based attempt this task is for.
    pub attempt: u32,
    pub kind: TaskKind,
    pub published_at: DateTime<Utc>,
}

impl StepTask {
    pub fn execute(run_id: Uuid, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            attempt,
            kind: TaskKind::Execute,
            published_at: Utc::now(),
        }
    }

    pub fn timer_fired(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            attempt: 1,
            kind: TaskKind::TimerFired,
            published_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        step_subject(&self.run_id, &self.step_id)
    }
}

/// A scheduled firing of a workflow's cron trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTick {
    pub workflow_id: String,
    pub definition_hash: String,
    /// Id of the cron state that declared the schedule.
    pub trigger_id: String,
    pub fire_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_subject_format() {
        let run_id = Uuid::nil();
        assert_eq!(
            step_subject(&run_id, "route"),
            "workflow.run.00000000-0000-0000-0000-000000000000.step.route.schedule"
        );
        assert!(step_subject(&run_id, "x").starts_with(STEP_SUBJECT_PREFIX));
    }

    #[test]
    fn test_cron_subject_format() {
        assert_eq!(cron_subject("nightly"), "workflow.cron.nightly.tick");
    }

    #[test]
    fn test_step_task_serializes_kind_snake_case() {
        let task = StepTask::timer_fired(Uuid::now_v7(), "wait");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "timer_fired");
        let back: StepTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
