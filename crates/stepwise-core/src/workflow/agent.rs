//! Agent/task execution collaborator used by operation steps.
//!
//! The engine does not know how an operation is carried out (an LLM agent,
//! a tool call, a remote service). It hands an `AgentRequest` to an
//! `AgentExecutor` and records the response and its usage metadata.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::workflow::ShapeSchema;
use uuid::Uuid;

/// One delegated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: Uuid,
    pub step_id: String,
    /// Task description with placeholders already resolved.
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Structured input with placeholders already resolved.
    pub input: Value,
    /// Declared shape of the step's input, so the agent can interpret `input`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<ShapeSchema>,
    /// Expected output shape, when the state declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<ShapeSchema>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Token accounting reported by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Response of a delegated task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Nested calls the agent made (sub-agents, model round trips).
    #[serde(default)]
    pub sub_call_count: u32,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Errors reported by an `AgentExecutor`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),

    /// Worth retrying (rate limits, connection resets, overload).
    #[error("transient agent failure: {0}")]
    Transient(String),

    #[error("agent failed: {0}")]
    Failed(String),

    #[error("no agent executor configured")]
    Unconfigured,
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

/// Executes delegated tasks on behalf of operation steps.
///
/// Uses a boxed future so the executor can be shared as a trait object.
pub trait AgentExecutor: Send + Sync {
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentResponse, AgentError>>;
}

/// Executor for deployments with no agent backend. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAgentExecutor;

impl AgentExecutor for UnconfiguredAgentExecutor {
    fn execute(&self, _request: AgentRequest) -> BoxFuture<'_, Result<AgentResponse, AgentError>> {
        Box::pin(async { Err(AgentError::Unconfigured) })
    }
}

/// Pull a JSON value out of a free-text response.
///
/// Accepts a bare JSON document, a fenced ```json block, or the outermost
/// `{...}` / `[...]` span.
pub fn extract_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_bare_json() {
        assert_eq!(extract_json(r#" {"a": 1} "#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"status\": \"ok\"}\n```\nThanks";
        assert_eq!(extract_json(text), Some(json!({"status": "ok"})));
    }

    #[test]
    fn test_extract_embedded_object() {
        let text = "Result: {\"n\": [1, 2]} -- done";
        assert_eq!(extract_json(text), Some(json!({"n": [1, 2]})));
    }

    #[test]
    fn test_plain_text_has_no_json() {
        assert_eq!(extract_json("all good"), None);
        assert_eq!(extract_json("42"), None);
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), 15);
    }

    #[tokio::test]
    async fn test_unconfigured_executor_fails() {
        let request = AgentRequest {
            run_id: Uuid::nil(),
            step_id: "s".into(),
            task: "t".into(),
            agent: None,
            input: json!({}),
            input_schema: None,
            output_schema: None,
            tools: vec![],
        };
        let err = UnconfiguredAgentExecutor.execute(request).await.unwrap_err();
        assert!(matches!(err, AgentError::Unconfigured));
    }
}
