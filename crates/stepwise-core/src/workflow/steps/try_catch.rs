//! Try/catch: run a body sub-graph and route classified failures.
//!
//! On success the body's last output becomes the step output and the
//! state's own transitions apply. On failure the first catch clause whose
//! error list matches the error class wins: `{class, message, step_id}` is
//! written at the clause's `result_path` (default `error`), where `step_id`
//! names the body state that failed, and the run continues at the clause's
//! `next`. Unmatched errors and cancellation propagate.

use futures_util::future::BoxFuture;
use serde_json::json;
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::branch::run_branch_located;
use crate::workflow::executor::{Next, StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct TryCatchExecutor;

impl StepExecutor for TryCatchExecutor {
    fn step_type(&self) -> &str {
        state_types::TRY_CATCH
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let state = invocation.state;
            let StateConfig::TryCatch(config) = &state.config else {
                return Err(StepError::Validation(format!(
                    "state '{}' is not a try/catch state",
                    state.id
                )));
            };

            let result = run_branch_located(
                invocation.runtime.clone(),
                invocation.run_id,
                config.body.clone(),
                invocation.context.clone(),
                invocation.cancel.clone(),
            )
            .await;

            let failure = match result {
                Ok(body) => return Ok(StepOutcome::completed(state, body.output)),
                Err(failure) if matches!(failure.error, StepError::Cancelled) => {
                    return Err(StepError::Cancelled);
                }
                Err(failure) => failure,
            };
            let error = failure.error;
            let failed_step = failure.step_id.unwrap_or_else(|| state.id.clone());

            let class = error.class();
            let Some(clause) = config.catch.iter().find(|c| c.matches(class)) else {
                return Err(error);
            };
            tracing::info!(
                run_id = %invocation.run_id,
                step_id = %state.id,
                failed_step = %failed_step,
                class,
                next = %clause.next,
                "caught step error"
            );

            Ok(StepOutcome::Completed {
                output: json!({
                    "class": class,
                    "message": error.to_string(),
                    "step_id": failed_step,
                }),
                write_path: Some(
                    clause
                        .result_path
                        .clone()
                        .unwrap_or_else(|| "error".to_string()),
                ),
                next: Next::Goto(clause.next.clone()),
            })
        })
    }
}
