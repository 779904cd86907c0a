//! Shared fixtures for engine tests: state builders and scripted agents.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::workflow::StateDefinition;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent::{AgentError, AgentExecutor, AgentRequest, AgentResponse, TokenUsage};
use super::executor::{
    ExecutionRuntime, StepError, StepExecutorRegistry, StepOutcome, execute_state,
};

pub fn state_from(value: Value) -> StateDefinition {
    serde_json::from_value(value).unwrap()
}

pub fn runtime_with(agent: Arc<dyn AgentExecutor>) -> ExecutionRuntime {
    ExecutionRuntime {
        registry: Arc::new(StepExecutorRegistry::with_builtins(agent)),
        default_timeout: Duration::from_secs(30),
    }
}

pub fn runtime() -> ExecutionRuntime {
    runtime_with(Arc::new(ScriptedAgent::default()))
}

pub async fn invoke(state: &StateDefinition, context: Value) -> Result<StepOutcome, StepError> {
    invoke_with(&runtime(), state, context).await
}

pub async fn invoke_with(
    runtime: &ExecutionRuntime,
    state: &StateDefinition,
    context: Value,
) -> Result<StepOutcome, StepError> {
    execute_state(runtime, Uuid::nil(), state, &context, 1, &CancellationToken::new()).await
}

/// Agent whose behaviour is driven by the task text:
///
/// - `fail:<msg>` fails permanently
/// - `transient:<msg>` fails with a retryable error
/// - `sleep:<ms>:<text>` waits, then answers `<text>`
/// - anything else is echoed back
///
/// The most recent request is kept for inspection.
#[derive(Default)]
pub struct ScriptedAgent {
    pub calls: AtomicUsize,
    last: Mutex<Option<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<AgentRequest> {
        self.last.lock().unwrap().clone()
    }
}

impl AgentExecutor for ScriptedAgent {
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentResponse, AgentError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            let task = request.task;
            if let Some(msg) = task.strip_prefix("fail:") {
                return Err(AgentError::Failed(msg.to_string()));
            }
            if let Some(msg) = task.strip_prefix("transient:") {
                return Err(AgentError::Transient(msg.to_string()));
            }
            let text = match task.strip_prefix("sleep:") {
                Some(rest) => {
                    let (ms, text) = rest.split_once(':').unwrap_or((rest, ""));
                    tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
                    text.to_string()
                }
                None => task,
            };
            Ok(AgentResponse {
                response: text,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                sub_call_count: 1,
                tool_calls: vec![],
                model: Some("scripted".into()),
            })
        })
    }
}

/// Fails transiently `failures` times, then succeeds.
pub struct FlakyAgent {
    remaining: AtomicU32,
    pub calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining: AtomicU32::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

impl AgentExecutor for FlakyAgent {
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentResponse, AgentError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.store(left - 1, Ordering::SeqCst);
                return Err(AgentError::Transient("temporarily unavailable".into()));
            }
            Ok(AgentResponse {
                response: format!("done: {}", request.task),
                ..Default::default()
            })
        })
    }
}
