//! Parallel: run every branch concurrently over a copy of the context.
//!
//! Join policies:
//! - `all` + `fail_fast` -- first failure cancels the siblings and fails the step
//! - `all` + `collect_errors` -- every branch finishes, failures are aggregated
//! - `quorum` -- completes once `count` branches succeed and cancels the rest;
//!   fails as soon as the quorum can no longer be reached
//!
//! The output is an object keyed by branch name. Under a quorum it holds
//! only the branches that finished successfully.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use stepwise_types::workflow::{FailurePolicy, JoinMode, StateConfig, state_types};
use tokio::task::JoinSet;

use crate::workflow::branch::run_branch;
use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct ParallelExecutor;

/// Display name of the branch at `index`.
pub fn branch_name(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("branch-{index}")
    } else {
        name.to_string()
    }
}

impl StepExecutor for ParallelExecutor {
    fn step_type(&self) -> &str {
        state_types::PARALLEL
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let state = invocation.state;
            let StateConfig::Parallel(config) = &state.config else {
                return Err(StepError::Validation(format!(
                    "state '{}' is not a parallel state",
                    state.id
                )));
            };

            let total = config.branches.len();
            if total == 0 {
                return Err(StepError::Validation(format!(
                    "parallel '{}' has no branches",
                    state.id
                )));
            }
            let required = match config.join.mode {
                JoinMode::All => total,
                JoinMode::Quorum => {
                    let count = config.join.count.unwrap_or(1);
                    if count == 0 || count > total {
                        return Err(StepError::Validation(format!(
                            "parallel '{}': quorum {count} is outside 1..={total}",
                            state.id
                        )));
                    }
                    count
                }
            };
            let quorum = config.join.mode == JoinMode::Quorum;

            let names: Vec<String> = config
                .branches
                .iter()
                .enumerate()
                .map(|(i, b)| branch_name(&b.name, i))
                .collect();

            let scope = invocation.cancel.child_token();
            let mut tasks = JoinSet::new();
            for (index, branch) in config.branches.iter().enumerate() {
                let runtime = invocation.runtime.clone();
                let run_id = invocation.run_id;
                let branch = branch.clone();
                let context = invocation.context.clone();
                let token = scope.clone();
                tasks.spawn(async move {
                    (index, run_branch(runtime, run_id, branch, context, token).await)
                });
            }
            tracing::debug!(step_id = %state.id, branches = total, required, "parallel fan-out");

            let mut outputs: Vec<Option<Value>> = vec![None; total];
            let mut failures: Vec<(usize, StepError)> = Vec::new();
            let mut succeeded = 0usize;

            while let Some(joined) = tasks.join_next().await {
                let (index, result) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        scope.cancel();
                        return Err(StepError::Internal(format!("branch task failed: {e}")));
                    }
                };

                match result {
                    Ok(branch) => {
                        outputs[index] = Some(branch.output);
                        succeeded += 1;
                        if succeeded >= required {
                            break;
                        }
                    }
                    Err(StepError::Cancelled) if invocation.cancel.is_cancelled() => {
                        scope.cancel();
                        return Err(StepError::Cancelled);
                    }
                    Err(e) => {
                        tracing::debug!(
                            step_id = %state.id,
                            branch = %names[index],
                            error = %e,
                            "parallel branch failed"
                        );
                        if !quorum && config.join.on_failure == FailurePolicy::FailFast {
                            scope.cancel();
                            return Err(StepError::BranchFailed {
                                branch: names[index].clone(),
                                source: Box::new(e),
                            });
                        }
                        failures.push((index, e));
                        if quorum && total - failures.len() < required {
                            scope.cancel();
                            break;
                        }
                    }
                }
            }
            scope.cancel();
            tasks.abort_all();

            if succeeded < required || (!quorum && !failures.is_empty()) {
                failures.sort_by_key(|(i, _)| *i);
                return Err(StepError::BranchesFailed {
                    failed: failures.len(),
                    messages: failures
                        .iter()
                        .map(|(i, e)| format!("{}: {e}", names[*i]))
                        .collect(),
                });
            }

            let mut merged = Map::new();
            for (name, output) in names.into_iter().zip(outputs) {
                if let Some(output) = output {
                    merged.insert(name, output);
                }
            }
            Ok(StepOutcome::completed(state, Value::Object(merged)))
        })
    }
}
