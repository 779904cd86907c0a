//! Operation: delegate a task to the configured `AgentExecutor`.
//!
//! `{{ path }}` placeholders in the task text and input resolve against the
//! context before the call. The step output carries the response, any JSON
//! extracted from it, and usage metadata (tokens, duration, sub-calls).
//! Timeouts are applied around the executor by `execute_state`.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::agent::{AgentError, AgentExecutor, AgentRequest, extract_json};
use crate::workflow::context::{resolve_template, resolve_value};
use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};
use crate::workflow::schema;

pub struct OperationExecutor {
    agent: Arc<dyn AgentExecutor>,
}

impl OperationExecutor {
    pub fn new(agent: Arc<dyn AgentExecutor>) -> Self {
        Self { agent }
    }
}

fn map_agent_error(error: AgentError) -> StepError {
    StepError::Operation {
        retryable: error.is_transient(),
        message: error.to_string(),
    }
}

impl StepExecutor for OperationExecutor {
    fn step_type(&self) -> &str {
        state_types::OPERATION
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let state = invocation.state;
            let StateConfig::Operation(config) = &state.config else {
                return Err(StepError::Validation(format!(
                    "state '{}' is not an operation state",
                    state.id
                )));
            };

            let request = AgentRequest {
                run_id: invocation.run_id,
                step_id: state.id.clone(),
                task: resolve_template(invocation.context, &config.task),
                agent: config.agent.clone(),
                input: config
                    .input
                    .as_ref()
                    .map(|input| resolve_value(invocation.context, input))
                    .unwrap_or_else(|| json!({})),
                input_schema: state.input_schema.clone(),
                output_schema: state.output_schema.clone(),
                tools: config.tools.clone(),
            };

            let started = Instant::now();
            let response = tokio::select! {
                biased;
                _ = invocation.cancel.cancelled() => return Err(StepError::Cancelled),
                result = self.agent.execute(request) => result.map_err(map_agent_error)?,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let result = extract_json(&response.response);
            if let Some(expected) = &state.output_schema {
                let structured = result.as_ref().ok_or_else(|| {
                    StepError::Validation(format!(
                        "operation '{}' returned no structured result",
                        state.id
                    ))
                })?;
                schema::validate(structured, expected).map_err(|issues| {
                    StepError::Validation(format!(
                        "operation '{}' result does not match output schema: {}",
                        state.id,
                        issues.join("; ")
                    ))
                })?;
            }

            tracing::info!(
                run_id = %invocation.run_id,
                step_id = %state.id,
                attempt = invocation.attempt,
                duration_ms,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                sub_calls = response.sub_call_count,
                "operation completed"
            );

            let mut output = json!({
                "response": response.response,
                "agent": config.agent,
                "duration_ms": duration_ms,
                "usage": {
                    "input_tokens": response.usage.input_tokens,
                    "output_tokens": response.usage.output_tokens,
                    "total_tokens": response.usage.total(),
                },
                "sub_call_count": response.sub_call_count,
                "tool_calls": response.tool_calls,
            });
            if let Some(result) = result {
                output["result"] = result;
            }
            if let Some(model) = response.model {
                output["model"] = Value::String(model);
            }
            Ok(StepOutcome::completed(state, output))
        })
    }
}
