//! Foreach: run the iterator sub-graph once per element of a context array.
//!
//! Each iteration sees a private copy of the context with the element bound
//! at `item_name`, plus `_index` and `_total`. At most `max_concurrency`
//! iterations run at once. Outputs keep the input order regardless of
//! completion order. Every iteration runs to completion; failures are
//! reported together.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stepwise_types::workflow::{StateConfig, state_types};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::workflow::branch::run_branch;
use crate::workflow::context::{get_path, set_path};
use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct ForeachExecutor;

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl StepExecutor for ForeachExecutor {
    fn step_type(&self) -> &str {
        state_types::FOREACH
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let state = invocation.state;
            let StateConfig::Foreach(config) = &state.config else {
                return Err(StepError::Validation(format!(
                    "state '{}' is not a foreach state",
                    state.id
                )));
            };

            let items = get_path(invocation.context, &config.items_path).ok_or_else(|| {
                StepError::Validation(format!(
                    "foreach '{}': items path '{}' not found in context",
                    state.id, config.items_path
                ))
            })?;
            let Value::Array(items) = items else {
                return Err(StepError::Validation(format!(
                    "foreach '{}': '{}' is {}, expected an array",
                    state.id,
                    config.items_path,
                    kind_name(items)
                )));
            };
            if items.is_empty() {
                return Ok(StepOutcome::completed(state, json!([])));
            }

            let total = items.len();
            let limit = config.max_concurrency.max(1);
            let semaphore = Arc::new(Semaphore::new(limit));
            let scope = invocation.cancel.child_token();
            let mut tasks = JoinSet::new();

            for (index, item) in items.iter().enumerate() {
                let mut context = invocation.context.clone();
                set_path(&mut context, &config.item_name, item.clone())?;
                if let Some(root) = context.as_object_mut() {
                    root.insert("_index".to_string(), json!(index));
                    root.insert("_total".to_string(), json!(total));
                }

                let runtime = invocation.runtime.clone();
                let run_id = invocation.run_id;
                let iterator = config.iterator.clone();
                let semaphore = semaphore.clone();
                let token = scope.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (index, Err(StepError::Cancelled));
                    };
                    (index, run_branch(runtime, run_id, iterator, context, token).await)
                });
            }
            tracing::debug!(step_id = %state.id, items = total, limit, "foreach fan-out");

            let mut outputs: Vec<Value> = vec![Value::Null; total];
            let mut failures: Vec<(usize, StepError)> = Vec::new();

            while let Some(joined) = tasks.join_next().await {
                let (index, result) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        scope.cancel();
                        return Err(StepError::Internal(format!("iteration task failed: {e}")));
                    }
                };
                match result {
                    Ok(branch) => outputs[index] = branch.output,
                    Err(StepError::Cancelled) if invocation.cancel.is_cancelled() => {
                        scope.cancel();
                        return Err(StepError::Cancelled);
                    }
                    Err(e) => failures.push((index, e)),
                }
            }

            if !failures.is_empty() {
                failures.sort_by_key(|(i, _)| *i);
                return Err(StepError::IterationFailed {
                    failed: failures.len(),
                    messages: failures
                        .iter()
                        .map(|(i, e)| format!("item {i}: {e}"))
                        .collect(),
                });
            }
            Ok(StepOutcome::completed(state, Value::Array(outputs)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::workflow::testing::{invoke, state_from};
    use stepwise_types::workflow::StateDefinition;

    fn foreach(max_concurrency: usize, task: &str) -> StateDefinition {
        state_from(json!({
            "id": "each",
            "type": "foreach",
            "config": {
                "items_path": "input.items",
                "max_concurrency": max_concurrency,
                "iterator": {
                    "states": [{
                        "id": "work",
                        "type": "operation",
                        "config": {"task": task}
                    }]
                }
            },
            "result_path": "results"
        }))
    }

    fn output_of(outcome: StepOutcome) -> Value {
        match outcome {
            StepOutcome::Completed { output, .. } => output,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outputs_keep_input_order_under_concurrency() {
        // Earlier items sleep longer, so they finish last.
        let state = foreach(3, "sleep:{{ item.ms }}:{{ item.name }}");
        let ctx = json!({"input": {"items": [
            {"ms": 150, "name": "a"},
            {"ms": 75, "name": "b"},
            {"ms": 1, "name": "c"}
        ]}});
        let output = output_of(invoke(&state, ctx).await.unwrap());
        let responses: Vec<&str> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["response"].as_str().unwrap())
            .collect();
        assert_eq!(responses, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let state = foreach(1, "sleep:100:{{ item }}");
        let ctx = json!({"input": {"items": [1, 2, 3]}});
        let started = Instant::now();
        invoke(&state, ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_index_and_total_are_bound() {
        let state = state_from(json!({
            "id": "each",
            "type": "foreach",
            "config": {
                "items_path": "input.items",
                "item_name": "entry",
                "iterator": {"states": [{
                    "id": "t",
                    "type": "transform",
                    "config": {"expression": "_index * 10 + _total + (entry|length)"}
                }]}
            }
        }));
        let output = output_of(invoke(&state, json!({"input": {"items": ["x", "yy"]}})).await.unwrap());
        let values: Vec<f64> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![3.0, 14.0]);
    }

    #[tokio::test]
    async fn test_empty_list_yields_empty_output() {
        let state = foreach(2, "never");
        let output = output_of(invoke(&state, json!({"input": {"items": []}})).await.unwrap());
        assert_eq!(output, json!([]));
    }

    #[tokio::test]
    async fn test_non_array_is_validation_error() {
        let state = foreach(2, "x");
        let err = invoke(&state, json!({"input": {"items": "nope"}})).await.unwrap_err();
        assert_eq!(err.class(), "validation");
        assert!(err.to_string().contains("expected an array"));
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let state = foreach(2, "{{ item }}");
        let ctx = json!({"input": {"items": ["ok", "fail:one", "fine", "fail:two"]}});
        match invoke(&state, ctx).await.unwrap_err() {
            StepError::IterationFailed { failed, messages } => {
                assert_eq!(failed, 2);
                assert!(messages[0].starts_with("item 1:"));
                assert!(messages[1].starts_with("item 3:"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
