//! Transform: compute a value from the context with an expression.

use futures_util::future::BoxFuture;
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};
use crate::workflow::expression::WorkflowEvaluator;

pub struct TransformExecutor;

impl TransformExecutor {
    fn compute(invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let StateConfig::Transform(config) = &invocation.state.config else {
            return Err(StepError::Validation(format!(
                "state '{}' is not a transform state",
                invocation.state.id
            )));
        };
        let value = WorkflowEvaluator::new().evaluate_value(&config.expression, invocation.context)?;
        Ok(StepOutcome::completed(invocation.state, value))
    }
}

impl StepExecutor for TransformExecutor {
    fn step_type(&self) -> &str {
        state_types::TRANSFORM
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        let result = Self::compute(&invocation);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{invoke, state_from};
    use serde_json::json;

    #[tokio::test]
    async fn test_transform_evaluates_against_context() {
        let state = state_from(json!({
            "id": "count",
            "type": "transform",
            "config": {"expression": "input.items|length"},
            "result_path": "count"
        }));
        match invoke(&state, json!({"input": {"items": [1, 2, 3]}})).await.unwrap() {
            StepOutcome::Completed { output, write_path, .. } => {
                assert_eq!(output.as_f64(), Some(3.0));
                assert_eq!(write_path.as_deref(), Some("count"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transform_undefined_reference_fails() {
        let state = state_from(json!({
            "id": "t",
            "type": "transform",
            "config": {"expression": "missing.value"}
        }));
        let err = invoke(&state, json!({"input": {}})).await.unwrap_err();
        assert_eq!(err.class(), "expression");
    }
}
