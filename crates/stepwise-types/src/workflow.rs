//! Workflow domain types for Stepwise.
//!
//! Defines the canonical representation of a workflow definition (a graph of
//! named states with ordered transitions) and the execution records the
//! engine persists: `WorkflowRun` for a run as a whole and `StepRun` for each
//! state executed inside it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Type tags for the built-in state kinds.
pub mod state_types {
    pub const INJECT: &str = "inject";
    pub const SWITCH: &str = "switch";
    pub const PARALLEL: &str = "parallel";
    pub const FOREACH: &str = "foreach";
    pub const OPERATION: &str = "operation";
    pub const TIMER: &str = "timer";
    pub const TRY_CATCH: &str = "try_catch";
    pub const CRON: &str = "cron";
    pub const TRANSFORM: &str = "transform";
    pub const APPROVAL: &str = "approval";
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: a list of states and the transitions between them.
///
/// Definitions are immutable once validated; a changed document is a new
/// version identified by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "incident-runbook").
    pub id: String,
    /// Human-readable name. Defaults to `id` when omitted.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry state. Defaults to the first declared state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Expected shape of the run input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<ShapeSchema>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a top-level state by id.
    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.id == id)
    }

    /// The declared entry state id (`start`, else the first state).
    pub fn entry_id(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.id.as_str()))
    }

    /// Cron trigger states declared in this definition.
    pub fn cron_triggers(&self) -> impl Iterator<Item = (&StateDefinition, &CronConfig)> {
        self.states.iter().filter_map(|s| match &s.config {
            StateConfig::Cron(cfg) => Some((s, cfg)),
            _ => None,
        })
    }
}

/// A validated definition as stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDefinition {
    pub definition: WorkflowDefinition,
    /// Hex SHA-256 of the canonical JSON form.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// States and transitions
// ---------------------------------------------------------------------------

/// A named node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawState", into = "RawState")]
pub struct StateDefinition {
    pub id: String,
    pub config: StateConfig,
    /// Ordered transitions. Conditional entries are checked in declaration order.
    pub transitions: Vec<Transition>,
    /// Fallback target when no conditional transition matches.
    pub default: Option<String>,
    /// Marks a terminal state; the run completes after it.
    pub end: bool,
    /// Context path where the step's result is written.
    pub result_path: Option<String>,
    pub retry: Option<RetryConfig>,
    pub timeout_secs: Option<u64>,
    pub input_schema: Option<ShapeSchema>,
    pub output_schema: Option<ShapeSchema>,
}

impl StateDefinition {
    /// The type tag used to look up this state's executor.
    pub fn state_type(&self) -> &str {
        self.config.type_name()
    }

    /// Every state id this state may transition to.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.transitions.iter().map(|t| t.next.as_str()).collect();
        if let Some(default) = &self.default {
            targets.push(default);
        }
        if let StateConfig::TryCatch(cfg) = &self.config {
            targets.extend(cfg.catch.iter().map(|c| c.next.as_str()));
        }
        targets
    }
}

/// A transition to another state, optionally guarded by a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub next: String,
}

impl Transition {
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            condition: None,
            next: next.into(),
        }
    }

    pub fn when(condition: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            condition: Some(condition.into()),
            next: next.into(),
        }
    }
}

/// A bounded sub-graph executed by parallel, foreach and try/catch states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
}

impl BranchDefinition {
    pub fn entry_id(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.id.as_str()))
    }

    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Step-specific configuration
// ---------------------------------------------------------------------------

/// Typed configuration for each state kind.
///
/// Unknown type tags are preserved as `Custom` so that an executor registered
/// under that tag can handle them; validation rejects tags with no executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StateConfig {
    Inject(InjectConfig),
    Switch(SwitchConfig),
    Parallel(ParallelConfig),
    Foreach(ForeachConfig),
    Operation(OperationConfig),
    Timer(TimerConfig),
    TryCatch(TryCatchConfig),
    Cron(CronConfig),
    Transform(TransformConfig),
    Approval(ApprovalConfig),
    Custom { type_name: String, config: Value },
}

impl StateConfig {
    pub fn type_name(&self) -> &str {
        match self {
            StateConfig::Inject(_) => state_types::INJECT,
            StateConfig::Switch(_) => state_types::SWITCH,
            StateConfig::Parallel(_) => state_types::PARALLEL,
            StateConfig::Foreach(_) => state_types::FOREACH,
            StateConfig::Operation(_) => state_types::OPERATION,
            StateConfig::Timer(_) => state_types::TIMER,
            StateConfig::TryCatch(_) => state_types::TRY_CATCH,
            StateConfig::Cron(_) => state_types::CRON,
            StateConfig::Transform(_) => state_types::TRANSFORM,
            StateConfig::Approval(_) => state_types::APPROVAL,
            StateConfig::Custom { type_name, .. } => type_name,
        }
    }

    /// Parse the raw `config` object for the given type tag.
    pub fn from_parts(type_name: &str, config: Value) -> Result<Self, serde_json::Error> {
        let config = if config.is_null() {
            Value::Object(Default::default())
        } else {
            config
        };
        Ok(match type_name {
            state_types::INJECT => StateConfig::Inject(serde_json::from_value(config)?),
            state_types::SWITCH => StateConfig::Switch(serde_json::from_value(config)?),
            state_types::PARALLEL => StateConfig::Parallel(serde_json::from_value(config)?),
            state_types::FOREACH => StateConfig::Foreach(serde_json::from_value(config)?),
            state_types::OPERATION | "agent" => {
                StateConfig::Operation(serde_json::from_value(config)?)
            }
            state_types::TIMER => StateConfig::Timer(serde_json::from_value(config)?),
            state_types::TRY_CATCH | "try" => StateConfig::TryCatch(serde_json::from_value(config)?),
            state_types::CRON => StateConfig::Cron(serde_json::from_value(config)?),
            state_types::TRANSFORM => StateConfig::Transform(serde_json::from_value(config)?),
            state_types::APPROVAL | "human_approval" => {
                StateConfig::Approval(serde_json::from_value(config)?)
            }
            other => StateConfig::Custom {
                type_name: other.to_string(),
                config,
            },
        })
    }

    fn to_value(&self) -> Value {
        let value = match self {
            StateConfig::Inject(c) => serde_json::to_value(c),
            StateConfig::Switch(c) => serde_json::to_value(c),
            StateConfig::Parallel(c) => serde_json::to_value(c),
            StateConfig::Foreach(c) => serde_json::to_value(c),
            StateConfig::Operation(c) => serde_json::to_value(c),
            StateConfig::Timer(c) => serde_json::to_value(c),
            StateConfig::TryCatch(c) => serde_json::to_value(c),
            StateConfig::Cron(c) => serde_json::to_value(c),
            StateConfig::Transform(c) => serde_json::to_value(c),
            StateConfig::Approval(c) => serde_json::to_value(c),
            StateConfig::Custom { config, .. } => Ok(config.clone()),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Writes a literal value into the run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectConfig {
    #[serde(default)]
    pub data: Value,
}

/// Routes on a value read from the context. Cases are the state's transitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default, alias = "dataPath", skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

/// Fans out into concurrent branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default)]
    pub branches: Vec<BranchDefinition>,
    #[serde(default)]
    pub join: JoinPolicy,
}

/// When a fan-out step is considered complete and how branch failures count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinPolicy {
    #[serde(default)]
    pub mode: JoinMode,
    /// Number of successful branches required in `quorum` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for every branch.
    #[default]
    All,
    /// Complete once `count` branches have succeeded.
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail on the first branch error and cancel the remaining branches.
    #[default]
    FailFast,
    /// Let every branch finish, then fail with all errors aggregated.
    CollectErrors,
}

/// Runs a sub-graph per element of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachConfig {
    #[serde(alias = "itemsPath")]
    pub items_path: String,
    #[serde(default = "default_item_name", alias = "itemName")]
    pub item_name: String,
    #[serde(default = "default_max_concurrency", alias = "maxConcurrency")]
    pub max_concurrency: usize,
    pub iterator: BranchDefinition,
}

fn default_item_name() -> String {
    "item".to_string()
}

fn default_max_concurrency() -> usize {
    1
}

/// Delegates a task to the external agent/task execution capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Task description; `{{ path }}` placeholders resolve against the context.
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Input mapping; string leaves may contain `{{ path }}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// Suspends the run for a relative delay or until an absolute time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Runs a sub-graph and routes classified errors to recovery states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryCatchConfig {
    #[serde(rename = "try")]
    pub body: BranchDefinition,
    #[serde(default)]
    pub catch: Vec<CatchClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    /// Error classes handled by this clause. Empty or `*` matches any class.
    #[serde(default)]
    pub errors: Vec<String>,
    pub next: String,
    /// Where the caught error is written. Defaults to `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl CatchClause {
    pub fn matches(&self, class: &str) -> bool {
        self.errors.is_empty() || self.errors.iter().any(|e| e == "*" || e == class)
    }
}

/// A recurring schedule that starts new runs. Never executed as a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronConfig {
    /// Cron expression (5 or 6 fields) or a phrase like "every 5 minutes".
    pub schedule: String,
    /// Input passed to runs created by this trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Computes a value from the context with an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub expression: String,
}

/// Pauses the run until a person approves or rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Shown to the approver; `{{ path }}` placeholders resolve against the context.
    pub message: String,
    /// Who may decide. Empty means anyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    /// Context value attached to the request for the approver to review.
    #[serde(default, alias = "summaryPath", skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
    #[serde(default = "default_approval_timeout_secs", alias = "timeout_seconds")]
    pub timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Per-state retry budget with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Jitter factor between 0.0 and 1.0.
    #[serde(default)]
    pub jitter: f64,
    /// Error classes that are never retried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
            jitter: 0.0,
            non_retryable: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shape schema
// ---------------------------------------------------------------------------

/// A small JSON-Schema subset describing the shape of a value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ShapeKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ShapeSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ShapeSchema>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShapeKind::Object => "object",
            ShapeKind::Array => "array",
            ShapeKind::String => "string",
            ShapeKind::Number => "number",
            ShapeKind::Integer => "integer",
            ShapeKind::Boolean => "boolean",
            ShapeKind::Null => "null",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Wire form of a state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawState {
    #[serde(default)]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    state_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    end: bool,
    #[serde(default, alias = "resultPath", skip_serializing_if = "Option::is_none")]
    result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_schema: Option<ShapeSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_schema: Option<ShapeSchema>,
}

impl TryFrom<RawState> for StateDefinition {
    type Error = String;

    fn try_from(raw: RawState) -> Result<Self, Self::Error> {
        let id = if raw.id.is_empty() {
            raw.name.unwrap_or_default()
        } else {
            raw.id
        };
        if id.is_empty() {
            return Err(format!("state of type '{}' has no id", raw.state_type));
        }

        let config = StateConfig::from_parts(&raw.state_type, raw.config)
            .map_err(|e| format!("state '{id}': invalid {} config: {e}", raw.state_type))?;

        let mut transitions = raw.transitions;
        if let Some(next) = raw.next {
            transitions.push(Transition::to(next));
        }

        Ok(StateDefinition {
            id,
            config,
            transitions,
            default: raw.default,
            end: raw.end,
            result_path: raw.result_path,
            retry: raw.retry,
            timeout_secs: raw.timeout_secs,
            input_schema: raw.input_schema,
            output_schema: raw.output_schema,
        })
    }
}

impl From<StateDefinition> for RawState {
    fn from(state: StateDefinition) -> Self {
        RawState {
            id: state.id,
            name: None,
            state_type: state.config.type_name().to_string(),
            config: state.config.to_value(),
            transitions: state.transitions,
            next: None,
            default: state.default,
            end: state.end,
            result_path: state.result_path,
            retry: state.retry,
            timeout_secs: state.timeout_secs,
            input_schema: state.input_schema,
            output_schema: state.output_schema,
        }
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never change once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "waiting" => Ok(RunStatus::Waiting),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// Status of a single step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepRunStatus::Completed | StepRunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepRunStatus::Pending => "pending",
            StepRunStatus::Running => "running",
            StepRunStatus::Completed => "completed",
            StepRunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepRunStatus::Pending),
            "running" => Ok(StepRunStatus::Running),
            "completed" => Ok(StepRunStatus::Completed),
            "failed" => Ok(StepRunStatus::Failed),
            other => Err(format!("invalid step status: {other}")),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Api,
    Cron,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Api => "api",
            TriggerKind::Cron => "cron",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "api" => Ok(TriggerKind::Api),
            "cron" => Ok(TriggerKind::Cron),
            other => Err(format!("invalid trigger kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// Structured failure attached to a run or step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Machine-readable error class (e.g. "timeout", "unmatched_condition").
    pub class: String,
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "step '{step}' failed ({}): {}", self.class, self.message),
            None => write!(f, "{}: {}", self.class, self.message),
        }
    }
}

/// An approval request a waiting run is parked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// `appr-<run_id>-<step_id>`.
    pub approval_id: String,
    pub step_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn approval_id(run_id: &Uuid, step_id: &str) -> String {
        format!("appr-{run_id}-{step_id}")
    }

    /// Whether `approver` may decide. An empty approver list admits anyone.
    pub fn allows(&self, approver: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == approver)
    }
}

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_hash: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub trigger: TriggerKind,
    pub input: Value,
    /// Accumulated run context.
    pub context: Value,
    /// The state the run is currently executing or waiting on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// When a waiting run's timer fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Bus message scheduled for the pending timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_message_id: Option<Uuid>,
    /// Set while the run waits on an approval step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<PendingApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution record of one state within a run, keyed by (run_id, step_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub run_id: Uuid,
    pub step_id: String,
    pub step_type: String,
    pub status: StepRunStatus,
    /// 1-based attempt counter.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Transition chosen when the step completed. `None` means the run ended here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Context path the output was written at, besides `steps.<id>.output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything needed to replay a step's completion without re-executing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
