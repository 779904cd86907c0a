//! Workflow definition loading: parsing, validation and content hashing.
//!
//! Converts YAML or JSON documents into the canonical `WorkflowDefinition`,
//! validates every structural constraint the engine relies on, and wraps
//! the result in a `StoredDefinition` keyed by a SHA-256 content hash.
//! Validation collects every issue instead of stopping at the first one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use sha2::{Digest, Sha256};
use stepwise_types::workflow::{
    BranchDefinition, JoinMode, StateConfig, StateDefinition, StoredDefinition, WorkflowDefinition,
};
use thiserror::Error;

use super::context::{RESERVED_KEYS, is_valid_path, root_key};
use super::executor::StepExecutorRegistry;
use super::expression::check_syntax;
use super::scheduler::parse_schedule;
use super::schema::check_compatible;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// One problem found while validating a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Machine-readable issue code (e.g. "unknown_target").
    pub code: &'static str,
    /// Location inside the document (e.g. "states.route.transitions[1]").
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.path, self.message, self.code)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while loading a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more structural problems.
    #[error("invalid workflow definition: {}", join_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

impl DefinitionError {
    /// Validation issues, if this is a validation failure.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            DefinitionError::Invalid(issues) => issues,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document. No validation beyond the document shape.
pub fn parse_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let mut def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    apply_defaults(&mut def);
    Ok(def)
}

/// Parse a JSON document. No validation beyond the document shape.
pub fn parse_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let mut def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    apply_defaults(&mut def);
    Ok(def)
}

/// Parse a file, choosing the format by extension (`.json`, else YAML).
pub fn parse_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json(&content),
        _ => parse_yaml(&content),
    }
}

/// Serialize a definition back to YAML.
pub fn to_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

fn apply_defaults(def: &mut WorkflowDefinition) {
    if def.name.is_empty() {
        def.name = def.id.clone();
    }
}

/// Hex SHA-256 of the definition's canonical JSON form (sorted keys).
pub fn content_hash(def: &WorkflowDefinition) -> String {
    let canonical = serde_json::to_value(def)
        .map(|v| v.to_string())
        .unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Discover workflow files (`.yaml`, `.yml`, `.json`) under `base_dir`.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_definition = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
        if !is_definition {
            continue;
        }
        match parse_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry resolution
// ---------------------------------------------------------------------------

/// Follow a cron trigger to the state runs created by it start at.
pub fn trigger_target<'a>(
    def: &'a WorkflowDefinition,
    trigger: &StateDefinition,
) -> Option<&'a StateDefinition> {
    let target = trigger
        .transitions
        .iter()
        .find(|t| t.condition.is_none())
        .map(|t| t.next.as_str())
        .or(trigger.default.as_deref())?;
    def.state(target)
}

/// The first executable state of a run, skipping cron trigger nodes.
pub fn resolve_entry(def: &WorkflowDefinition) -> Option<&StateDefinition> {
    let entry = def.state(def.entry_id()?)?;
    match &entry.config {
        StateConfig::Cron(_) => {
            trigger_target(def, entry).filter(|s| !matches!(s.config, StateConfig::Cron(_)))
        }
        _ => Some(entry),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validates definitions against a registry of step executors.
#[derive(Clone)]
pub struct DefinitionLoader {
    registry: Arc<StepExecutorRegistry>,
}

impl DefinitionLoader {
    pub fn new(registry: Arc<StepExecutorRegistry>) -> Self {
        Self { registry }
    }

    pub fn load_yaml(&self, yaml: &str) -> Result<StoredDefinition, DefinitionError> {
        self.prepare(parse_yaml(yaml)?)
    }

    pub fn load_json(&self, json: &str) -> Result<StoredDefinition, DefinitionError> {
        self.prepare(parse_json(json)?)
    }

    pub fn load_file(&self, path: &Path) -> Result<StoredDefinition, DefinitionError> {
        self.prepare(parse_file(path)?)
    }

    /// Validate a parsed definition and compute its content hash.
    pub fn prepare(&self, mut def: WorkflowDefinition) -> Result<StoredDefinition, DefinitionError> {
        apply_defaults(&mut def);
        self.validate(&def)?;
        Ok(StoredDefinition {
            hash: content_hash(&def),
            definition: def,
            created_at: Utc::now(),
        })
    }

    /// Check every structural constraint, returning all issues found.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
        let mut v = Validator {
            registry: &self.registry,
            issues: Vec::new(),
            seen_ids: HashSet::new(),
        };

        if def.id.is_empty()
            || !def
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            v.issue(
                "invalid_id",
                "id",
                format!(
                    "workflow id '{}' must be non-empty and use only letters, digits, '-' or '_'",
                    def.id
                ),
            );
        }
        if def.states.is_empty() {
            v.issue("empty", "states", "workflow must declare at least one state");
        }
        if let Some(start) = &def.start {
            if def.state(start).is_none() {
                v.issue(
                    "unknown_target",
                    "start",
                    format!("start state '{start}' does not exist"),
                );
            }
        }

        v.check_scope("states", &def.states, true);

        if !def.states.is_empty() && v.issues.is_empty() && resolve_entry(def).is_none() {
            v.issue(
                "no_entry",
                "start",
                "entry does not resolve to an executable state",
            );
        }

        if v.issues.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::Invalid(v.issues))
        }
    }
}

struct Validator<'a> {
    registry: &'a StepExecutorRegistry,
    issues: Vec<ValidationIssue>,
    seen_ids: HashSet<String>,
}

impl Validator<'_> {
    fn issue(&mut self, code: &'static str, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            code,
            path: path.into(),
            message: message.into(),
        });
    }

    /// Validate one list of states: the top-level graph or a branch.
    fn check_scope(&mut self, scope: &str, states: &[StateDefinition], top_level: bool) {
        let by_id: HashMap<&str, &StateDefinition> =
            states.iter().map(|s| (s.id.as_str(), s)).collect();

        for state in states {
            let path = format!("{scope}.{}", state.id);
            self.check_state(&path, state, &by_id, top_level);
        }

        self.check_acyclic(scope, states, &by_id);
    }

    fn check_state(
        &mut self,
        path: &str,
        state: &StateDefinition,
        by_id: &HashMap<&str, &StateDefinition>,
        top_level: bool,
    ) {
        let id_ok = !state.id.is_empty()
            && state
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !id_ok {
            self.issue(
                "invalid_id",
                path,
                format!(
                    "state id '{}' must use only letters, digits, '-' or '_'",
                    state.id
                ),
            );
        }
        if !self.seen_ids.insert(state.id.clone()) {
            self.issue(
                "duplicate_id",
                path,
                format!("duplicate state id '{}'", state.id),
            );
        }

        if !self.registry.supports(state.state_type()) {
            self.issue(
                "unsupported_type",
                path,
                format!("no executor registered for step type '{}'", state.state_type()),
            );
        }

        for target in state.targets() {
            match by_id.get(target) {
                None => self.issue(
                    "unknown_target",
                    path,
                    format!("transition target '{target}' does not exist"),
                ),
                Some(t) if matches!(t.config, StateConfig::Cron(_)) => self.issue(
                    "invalid_target",
                    path,
                    format!("cannot transition into cron trigger '{target}'"),
                ),
                Some(_) => {}
            }
        }
        if state.end && !state.transitions.is_empty() {
            self.issue(
                "conflicting_end",
                path,
                "a state marked end cannot declare transitions",
            );
        }

        for (i, transition) in state.transitions.iter().enumerate() {
            if let Some(condition) = &transition.condition {
                if let Err(e) = check_syntax(condition) {
                    self.issue(
                        "invalid_expression",
                        format!("{path}.transitions[{i}]"),
                        e.to_string(),
                    );
                }
            }
        }

        if let Some(result_path) = &state.result_path {
            self.check_write_path(&format!("{path}.result_path"), result_path);
        }
        if state.timeout_secs == Some(0) {
            self.issue("invalid_config", path, "timeout_secs must be > 0");
        }

        self.check_config(path, state, top_level);

        if let Some(output) = &state.output_schema {
            for target in state.targets() {
                let Some(consumer) = by_id.get(target).and_then(|t| t.input_schema.as_ref()) else {
                    continue;
                };
                if let Err(e) = check_compatible(output, consumer) {
                    self.issue(
                        "schema_mismatch",
                        path,
                        format!("output does not satisfy input of '{target}': {e}"),
                    );
                }
            }
        }
    }

    fn check_write_path(&mut self, path: &str, write_path: &str) {
        if !is_valid_path(write_path) {
            self.issue(
                "invalid_path",
                path,
                format!("'{write_path}' is not a valid context path"),
            );
            return;
        }
        if let Some(root) = root_key(write_path) {
            if RESERVED_KEYS.contains(&root.as_str()) {
                self.issue(
                    "reserved_path",
                    path,
                    format!("'{root}' is reserved and cannot be written by a state"),
                );
            }
        }
    }

    fn check_config(&mut self, path: &str, state: &StateDefinition, top_level: bool) {
        match &state.config {
            StateConfig::Switch(cfg) => {
                if let Some(data_path) = &cfg.data_path {
                    if !is_valid_path(data_path) {
                        self.issue(
                            "invalid_path",
                            format!("{path}.config.data_path"),
                            format!("'{data_path}' is not a valid context path"),
                        );
                    }
                }
                if state.transitions.is_empty() && state.default.is_none() {
                    self.issue("invalid_config", path, "switch needs at least one case or a default");
                }
            }
            StateConfig::Parallel(cfg) => {
                if cfg.branches.is_empty() {
                    self.issue("invalid_config", path, "parallel needs at least one branch");
                }
                if cfg.join.mode == JoinMode::Quorum {
                    let count = cfg.join.count.unwrap_or(1);
                    if count == 0 || count > cfg.branches.len() {
                        self.issue(
                            "invalid_config",
                            format!("{path}.config.join"),
                            format!("quorum {count} is outside 1..={}", cfg.branches.len()),
                        );
                    }
                }
                let mut names = HashSet::new();
                for (i, branch) in cfg.branches.iter().enumerate() {
                    if !branch.name.is_empty() && !names.insert(branch.name.as_str()) {
                        self.issue(
                            "duplicate_id",
                            format!("{path}.config.branches[{i}]"),
                            format!("duplicate branch name '{}'", branch.name),
                        );
                    }
                    self.check_branch(&format!("{path}.config.branches[{i}]"), branch);
                }
            }
            StateConfig::Foreach(cfg) => {
                if !is_valid_path(&cfg.items_path) {
                    self.issue(
                        "invalid_path",
                        format!("{path}.config.items_path"),
                        format!("'{}' is not a valid context path", cfg.items_path),
                    );
                }
                self.check_write_path(&format!("{path}.config.item_name"), &cfg.item_name);
                if cfg.max_concurrency == 0 {
                    self.issue("invalid_config", path, "max_concurrency must be >= 1");
                }
                self.check_branch(&format!("{path}.config.iterator"), &cfg.iterator);
            }
            StateConfig::Operation(cfg) => {
                if cfg.task.trim().is_empty() {
                    self.issue("invalid_config", path, "operation task must not be empty");
                }
            }
            StateConfig::Timer(cfg) => {
                if cfg.delay_secs.is_none() && cfg.until.is_none() {
                    self.issue("invalid_config", path, "timer needs delay_secs or until");
                }
                if !top_level {
                    self.issue(
                        "misplaced_state",
                        path,
                        "timers are only allowed in the top-level graph",
                    );
                }
            }
            StateConfig::TryCatch(cfg) => {
                self.check_branch(&format!("{path}.config.try"), &cfg.body);
                for (i, clause) in cfg.catch.iter().enumerate() {
                    if let Some(result_path) = &clause.result_path {
                        self.check_write_path(&format!("{path}.config.catch[{i}]"), result_path);
                    }
                }
            }
            StateConfig::Cron(cfg) => {
                if !top_level {
                    self.issue(
                        "misplaced_state",
                        path,
                        "cron triggers are only allowed in the top-level graph",
                    );
                }
                if let Err(e) = parse_schedule(&cfg.schedule) {
                    self.issue("invalid_schedule", format!("{path}.config.schedule"), e.to_string());
                }
                let unconditional = state.transitions.iter().any(|t| t.condition.is_none());
                if !unconditional && state.default.is_none() {
                    self.issue(
                        "invalid_config",
                        path,
                        "cron trigger needs an unconditional next state",
                    );
                }
            }
            StateConfig::Transform(cfg) => {
                if let Err(e) = check_syntax(&cfg.expression) {
                    self.issue(
                        "invalid_expression",
                        format!("{path}.config.expression"),
                        e.to_string(),
                    );
                }
            }
            StateConfig::Approval(cfg) => {
                if cfg.message.trim().is_empty() {
                    self.issue("invalid_config", path, "approval message must not be empty");
                }
                if let Some(summary) = &cfg.summary_path {
                    if !is_valid_path(summary) {
                        self.issue(
                            "invalid_path",
                            format!("{path}.config.summary_path"),
                            format!("'{summary}' is not a valid context path"),
                        );
                    }
                }
                if !top_level {
                    self.issue(
                        "misplaced_state",
                        path,
                        "approvals are only allowed in the top-level graph",
                    );
                }
            }
            StateConfig::Inject(_) | StateConfig::Custom { .. } => {}
        }
    }

    fn check_branch(&mut self, path: &str, branch: &BranchDefinition) {
        if branch.states.is_empty() {
            self.issue("empty", path, "branch must declare at least one state");
            return;
        }
        if let Some(start) = &branch.start {
            if branch.state(start).is_none() {
                self.issue(
                    "unknown_target",
                    format!("{path}.start"),
                    format!("start state '{start}' does not exist"),
                );
            }
        }
        self.check_scope(&format!("{path}.states"), &branch.states, false);
    }

    /// Each state runs at most once per run (step records are keyed by
    /// state id), so every graph must be acyclic.
    fn check_acyclic(
        &mut self,
        scope: &str,
        states: &[StateDefinition],
        by_id: &HashMap<&str, &StateDefinition>,
    ) {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = states
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        for state in states {
            for target in state.targets() {
                if !by_id.contains_key(target) {
                    continue;
                }
                if let (Some(from), Some(to)) = (nodes.get(state.id.as_str()), nodes.get(target)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let node_id = graph[cycle.node_id()];
            self.issue(
                "cycle",
                format!("{scope}.{node_id}"),
                format!("cycle detected involving state '{node_id}'"),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
