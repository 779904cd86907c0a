//! Switch: route on a value read from the context.
//!
//! The value at `config.data_path` is bound to `_value` (an object value
//! also exposes its fields at top level, unless they shadow a context key)
//! and the state's transitions are checked in declaration order. The first true condition
//! wins; then `default`. An expression that fails to evaluate is an
//! `expression` error, distinct from a value no case matches.

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::context::get_path;
use crate::workflow::executor::{
    Next, StepError, StepExecutor, StepInvocation, StepOutcome, condition_scope,
    resolve_transitions,
};

pub struct SwitchExecutor;

impl SwitchExecutor {
    fn route(invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let state = invocation.state;
        let StateConfig::Switch(config) = &state.config else {
            return Err(StepError::Validation(format!(
                "state '{}' is not a switch state",
                state.id
            )));
        };

        let value = match &config.data_path {
            Some(path) => get_path(invocation.context, path).cloned().ok_or_else(|| {
                StepError::Validation(format!(
                    "switch '{}': data path '{path}' not found in context",
                    state.id
                ))
            })?,
            None => Value::Null,
        };

        let mut scope = condition_scope(invocation.context, &value);
        if let (Some(fields), Some(scope)) = (value.as_object(), scope.as_object_mut()) {
            for (key, field) in fields {
                scope.entry(key.clone()).or_insert_with(|| field.clone());
            }
        }
        let target = resolve_transitions(state, &scope)?;
        tracing::debug!(
            step_id = %state.id,
            value = %value,
            next = target.as_deref().unwrap_or("<end>"),
            "switch routed"
        );

        let next = match &target {
            Some(t) => Next::Goto(t.clone()),
            None => Next::End,
        };
        Ok(StepOutcome::Completed {
            output: json!({ "value": value, "next": target }),
            write_path: state.result_path.clone(),
            next,
        })
    }
}

impl StepExecutor for SwitchExecutor {
    fn step_type(&self) -> &str {
        state_types::SWITCH
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        let result = Self::route(&invocation);
        Box::pin(async move { result })
    }
}
