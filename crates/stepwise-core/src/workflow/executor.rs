//! Step executor contract and registry.
//!
//! Every state kind is one `StepExecutor` strategy, looked up by its type
//! string in a `StepExecutorRegistry`. Executors read an immutable context
//! snapshot and return a `StepOutcome`: the output, where to write it, and
//! how to pick the next state. They never mutate the run context or persist
//! anything; the coordinator does that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use stepwise_types::workflow::{PendingApproval, StateDefinition, state_types};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent::AgentExecutor;
use super::context::ContextError;
use super::expression::{ExpressionError, WorkflowEvaluator};
use super::steps;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// How the next state is chosen after a step completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Evaluate the state's declared transitions.
    Transitions,
    /// Go to this state (already resolved by the executor).
    Goto(String),
    /// The run (or branch) ends here.
    End,
}

/// Result of one successful step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        output: Value,
        /// Context path the output is written at, besides `steps.<id>.output`.
        write_path: Option<String>,
        next: Next,
    },
    /// The run waits until `wake_at`, then follows the state's transitions.
    Suspended { wake_at: DateTime<Utc> },
    /// The run waits for a person to decide on `approval`.
    AwaitingApproval(PendingApproval),
}

impl StepOutcome {
    /// Completed outcome written at the state's `result_path`.
    pub fn completed(state: &StateDefinition, output: Value) -> Self {
        StepOutcome::Completed {
            output,
            write_path: state.result_path.clone(),
            next: Next::Transitions,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("no condition matched value {value}")]
    UnmatchedCondition { value: Value },

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation failed: {message}")]
    Operation { message: String, retryable: bool },

    #[error("branch '{branch}' failed: {source}")]
    BranchFailed {
        branch: String,
        source: Box<StepError>,
    },

    #[error("{failed} branch(es) failed: {}", messages.join("; "))]
    BranchesFailed { failed: usize, messages: Vec<String> },

    #[error("{failed} iteration(s) failed: {}", messages.join("; "))]
    IterationFailed { failed: usize, messages: Vec<String> },

    #[error("step cancelled")]
    Cancelled,

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("approval timed out")]
    ApprovalTimedOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Machine-readable class used by retry policies and catch clauses.
    pub fn class(&self) -> &'static str {
        match self {
            StepError::Validation(_) => "validation",
            StepError::Expression(_) => "expression",
            StepError::UnmatchedCondition { .. } => "unmatched_condition",
            StepError::Timeout(_) => "timeout",
            StepError::Operation { .. } => "operation_failed",
            StepError::BranchFailed { .. } | StepError::BranchesFailed { .. } => "branch_failed",
            StepError::IterationFailed { .. } => "iteration_failed",
            StepError::Cancelled => "cancelled",
            StepError::ApprovalRejected(_) => "approval_rejected",
            StepError::ApprovalTimedOut => "approval_timed_out",
            StepError::Internal(_) => "internal",
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Timeout(_) => true,
            StepError::Operation { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<ContextError> for StepError {
    fn from(e: ContextError) -> Self {
        StepError::Validation(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Shared, immutable execution services handed to every executor.
#[derive(Clone)]
pub struct ExecutionRuntime {
    pub registry: Arc<StepExecutorRegistry>,
    /// Timeout for operation steps that declare none.
    pub default_timeout: Duration,
}

/// Everything an executor may read for one execution.
pub struct StepInvocation<'a> {
    pub run_id: Uuid,
    pub state: &'a StateDefinition,
    /// Read-only snapshot of the run (or branch) context.
    pub context: &'a Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub runtime: &'a ExecutionRuntime,
}

/// One state kind.
///
/// Uses a boxed future so executors can be stored as trait objects.
pub trait StepExecutor: Send + Sync {
    /// The `type` string this executor handles.
    fn step_type(&self) -> &str;

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps type strings to executors. Unregistered types are rejected at
/// definition-load time, never silently skipped.
#[derive(Default)]
pub struct StepExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in state kind.
    pub fn with_builtins(agent: Arc<dyn AgentExecutor>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(steps::inject::InjectExecutor));
        registry.register(Arc::new(steps::switch::SwitchExecutor));
        registry.register(Arc::new(steps::parallel::ParallelExecutor));
        registry.register(Arc::new(steps::foreach::ForeachExecutor));
        registry.register(Arc::new(steps::operation::OperationExecutor::new(agent)));
        registry.register(Arc::new(steps::timer::TimerExecutor));
        registry.register(Arc::new(steps::try_catch::TryCatchExecutor));
        registry.register(Arc::new(steps::cron::CronTriggerExecutor));
        registry.register(Arc::new(steps::transform::TransformExecutor));
        registry.register(Arc::new(steps::approval::ApprovalExecutor));
        registry
    }

    /// Register (or replace) an executor under its `step_type()`.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.step_type().to_string(), executor);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn supports(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registered type strings, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ---------------------------------------------------------------------------
// Execution with timeout and cancellation
// ---------------------------------------------------------------------------

/// Run one state through its executor, bounded by the state's timeout and
/// the cancellation token.
pub async fn execute_state(
    runtime: &ExecutionRuntime,
    run_id: Uuid,
    state: &StateDefinition,
    context: &Value,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StepError> {
    let executor = runtime.registry.get(state.state_type()).ok_or_else(|| {
        StepError::Validation(format!(
            "no executor registered for step type '{}'",
            state.state_type()
        ))
    })?;

    let limit = state.timeout_secs.map(Duration::from_secs).or_else(|| {
        (state.state_type() == state_types::OPERATION).then_some(runtime.default_timeout)
    });

    let invocation = StepInvocation {
        run_id,
        state,
        context,
        attempt,
        cancel: cancel.clone(),
        runtime,
    };
    let run = executor.execute(invocation);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, run)
                    .await
                    .unwrap_or(Err(StepError::Timeout(limit))),
                None => run.await,
            }
        } => result,
    }
}

// ---------------------------------------------------------------------------
// Transition resolution
// ---------------------------------------------------------------------------

/// Scope used to evaluate transition conditions: the context's top-level
/// fields plus `_value` bound to `value`.
pub fn condition_scope(context: &Value, value: &Value) -> Value {
    let mut scope = context.as_object().cloned().unwrap_or_else(Map::new);
    scope.insert("_value".to_string(), value.clone());
    Value::Object(scope)
}

/// Pick the next state from `state`'s transitions.
///
/// Conditions are checked in declaration order and the first true one wins;
/// an unconditional transition always matches. Then `default`. A state with
/// no transitions ends the run (or moves to `default`). Conditional
/// transitions with no match and no default are an `UnmatchedCondition`
/// error, even when the state is also marked `end`.
pub fn resolve_transitions(
    state: &StateDefinition,
    scope: &Value,
) -> Result<Option<String>, StepError> {
    if state.transitions.is_empty() {
        return Ok(state.default.clone());
    }

    let evaluator = WorkflowEvaluator::new();
    for transition in &state.transitions {
        match &transition.condition {
            None => return Ok(Some(transition.next.clone())),
            Some(condition) => {
                if evaluator.evaluate_condition(condition, scope)? {
                    return Ok(Some(transition.next.clone()));
                }
            }
        }
    }

    match &state.default {
        Some(default) => Ok(Some(default.clone())),
        None => Err(StepError::UnmatchedCondition {
            value: scope.get("_value").cloned().unwrap_or(Value::Null),
        }),
    }
}

/// Resolve `next` to a concrete target (or `None` for the end of the graph).
pub fn resolve_next(
    state: &StateDefinition,
    next: &Next,
    context: &Value,
    output: &Value,
) -> Result<Option<String>, StepError> {
    match next {
        Next::End => Ok(None),
        Next::Goto(target) => Ok(Some(target.clone())),
        Next::Transitions => resolve_transitions(state, &condition_scope(context, output)),
    }
}
