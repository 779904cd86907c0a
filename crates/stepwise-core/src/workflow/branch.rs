//! Inline execution of a bounded sub-graph (parallel branch, foreach
//! iteration, try body).
//!
//! A branch runs over a private copy of the parent context. States inside
//! it go through the same registry as top-level states, but are not
//! persisted individually: the enclosing step's StepRun records the branch
//! result. Retries inside a branch happen in-process.

use serde_json::{Value, json};
use stepwise_types::workflow::BranchDefinition;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::set_path;
use super::executor::{ExecutionRuntime, StepError, StepOutcome, execute_state, resolve_next};
use super::retry::RetryPolicy;

/// Result of a branch: the last state's output and the final private context.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchResult {
    pub output: Value,
    pub context: Value,
}

/// A branch error and the state inside the branch that raised it.
#[derive(Debug, Clone)]
pub struct BranchFailure {
    /// `None` when the branch failed before reaching a state.
    pub step_id: Option<String>,
    pub error: StepError,
}

impl BranchFailure {
    fn at(step_id: &str, error: impl Into<StepError>) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            error: error.into(),
        }
    }
}

/// Execute `branch` from its entry state until a state ends it.
pub async fn run_branch(
    runtime: ExecutionRuntime,
    run_id: Uuid,
    branch: BranchDefinition,
    context: Value,
    cancel: CancellationToken,
) -> Result<BranchResult, StepError> {
    run_branch_located(runtime, run_id, branch, context, cancel)
        .await
        .map_err(|failure| failure.error)
}

/// Like `run_branch`, but a failure names the inner state it came from.
pub async fn run_branch_located(
    runtime: ExecutionRuntime,
    run_id: Uuid,
    branch: BranchDefinition,
    mut context: Value,
    cancel: CancellationToken,
) -> Result<BranchResult, BranchFailure> {
    let Some(entry) = branch.entry_id() else {
        return Ok(BranchResult {
            output: Value::Null,
            context,
        });
    };

    let mut current = entry.to_string();
    let mut output = Value::Null;
    let mut steps_taken = 0usize;

    loop {
        steps_taken += 1;
        if steps_taken > branch.states.len() {
            return Err(BranchFailure::at(
                &current,
                StepError::Internal(format!("branch '{}' revisited a state", branch.name)),
            ));
        }

        let state = branch.state(&current).ok_or_else(|| BranchFailure {
            step_id: None,
            error: StepError::Validation(format!(
                "branch '{}' references unknown state '{current}'",
                branch.name
            )),
        })?;
        let policy = RetryPolicy::from_config(state.retry.as_ref());

        let mut attempt = 1;
        let outcome = loop {
            if cancel.is_cancelled() {
                return Err(BranchFailure::at(&state.id, StepError::Cancelled));
            }
            match execute_state(&runtime, run_id, state, &context, attempt, &cancel).await {
                Ok(outcome) => break outcome,
                Err(e) if policy.should_retry(attempt, e.class(), e.is_retryable()) => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        %run_id,
                        branch = %branch.name,
                        step_id = %state.id,
                        attempt,
                        ?delay,
                        error = %e,
                        "retrying branch step"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(BranchFailure::at(&state.id, StepError::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(BranchFailure::at(&state.id, e)),
            }
        };

        let (step_output, write_path, next) = match outcome {
            StepOutcome::Completed {
                output,
                write_path,
                next,
            } => (output, write_path, next),
            StepOutcome::Suspended { .. } | StepOutcome::AwaitingApproval(_) => {
                return Err(BranchFailure::at(
                    &state.id,
                    StepError::Validation(format!(
                        "state '{}' suspends, which is not allowed inside a branch",
                        state.id
                    )),
                ));
            }
        };

        if let Some(path) = &write_path {
            set_path(&mut context, path, step_output.clone())
                .map_err(|e| BranchFailure::at(&state.id, e))?;
        }
        set_path(
            &mut context,
            &format!("steps.{}", state.id),
            json!({ "output": step_output }),
        )
        .map_err(|e| BranchFailure::at(&state.id, e))?;

        let target = resolve_next(state, &next, &context, &step_output)
            .map_err(|e| BranchFailure::at(&state.id, e))?;
        output = step_output;
        match target {
            Some(next_id) => current = next_id,
            None => break,
        }
    }

    Ok(BranchResult { output, context })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::runtime;

    fn branch(states: Value) -> BranchDefinition {
        serde_json::from_value(json!({"name": "body", "states": states})).unwrap()
    }

    #[tokio::test]
    async fn test_failure_names_inner_state() {
        let body = branch(json!([
            {"id": "first", "type": "inject", "config": {"data": 1}, "next": "second"},
            {"id": "second", "type": "operation", "config": {"task": "fail:nope"}}
        ]));
        let failure = run_branch_located(runtime(), Uuid::nil(), body, json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.step_id.as_deref(), Some("second"));
        assert_eq!(failure.error.class(), "operation_failed");
    }

    #[tokio::test]
    async fn test_outputs_flow_through_private_context() {
        let body = branch(json!([
            {"id": "seed", "type": "inject", "config": {"data": 2}, "result_path": "n", "next": "double"},
            {"id": "double", "type": "transform", "config": {"expression": "n * 2"}}
        ]));
        let result = run_branch(runtime(), Uuid::nil(), body, json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output.as_f64(), Some(4.0));
        assert_eq!(result.context["n"], json!(2));
        assert_eq!(result.context["steps"]["seed"]["output"], json!(2));
    }
}
