//! Inject: write `config.data` verbatim at the state's result path.

use futures_util::future::BoxFuture;
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct InjectExecutor;

impl StepExecutor for InjectExecutor {
    fn step_type(&self) -> &str {
        state_types::INJECT
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let StateConfig::Inject(config) = &invocation.state.config else {
                return Err(StepError::Validation(format!(
                    "state '{}' is not an inject state",
                    invocation.state.id
                )));
            };
            Ok(StepOutcome::completed(invocation.state, config.data.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::Next;
    use crate::workflow::testing::{invoke, state_from};
    use serde_json::json;

    #[tokio::test]
    async fn test_inject_returns_data_exactly() {
        let state = state_from(json!({
            "id": "alert",
            "type": "inject",
            "config": {"data": {"severity": "high"}},
            "result_path": "alert"
        }));
        let outcome = invoke(&state, json!({})).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Completed {
                output: json!({"severity": "high"}),
                write_path: Some("alert".into()),
                next: Next::Transitions,
            }
        );
    }
}
