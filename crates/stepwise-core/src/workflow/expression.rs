//! JEXL expression evaluator for switch conditions and transform steps.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms and
//! adds what the bare evaluator lacks for workflow routing:
//! - a structural syntax check usable at definition-load time
//! - undefined-reference detection (JEXL silently yields `null` for unknown
//!   identifiers, which would turn a typo into a quiet "no match")
//! - strict boolean results for conditions
//!
//! **Security note:** payloads are always passed as context objects, NEVER
//! interpolated into expression strings.
//!
//! The underlying evaluator is not `Send`; build a `WorkflowEvaluator` where
//! it is used and never hold one across an `.await`.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression syntax error: {0}")]
    Syntax(String),

    #[error("undefined reference '{0}'")]
    UndefinedReference(String),

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Structural scan
// ---------------------------------------------------------------------------

const KEYWORDS: &[&str] = &["true", "false", "null", "in"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Operand,
    Dot,
    Pipe,
    Open(char),
    Close,
    Comma,
    Colon,
    Operator,
}

/// Check brackets, string literals and operator placement, returning the
/// root identifiers the expression reads from its context (in order of
/// first appearance).
pub fn scan(expression: &str) -> Result<Vec<String>, ExpressionError> {
    let chars: Vec<char> = expression.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return Err(ExpressionError::Syntax("empty expression".to_string()));
    }

    let mut roots: Vec<String> = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut prev: Option<Token> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                i += 1;
            }
            if !closed {
                return Err(ExpressionError::Syntax("unterminated string literal".to_string()));
            }
            prev = Some(Token::Operand);
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();

            let is_member = matches!(prev, Some(Token::Dot) | Some(Token::Pipe));
            let in_object = stack.last() == Some(&'{');
            let next_is_colon = chars[i..]
                .iter()
                .find(|c| !c.is_whitespace())
                .is_some_and(|c| *c == ':');
            let is_object_key = in_object
                && next_is_colon
                && matches!(prev, Some(Token::Open('{')) | Some(Token::Comma));

            prev = Some(if ident == "in" {
                Token::Operator
            } else {
                Token::Operand
            });
            if !is_member
                && !is_object_key
                && !KEYWORDS.contains(&ident.as_str())
                && !roots.contains(&ident)
            {
                roots.push(ident);
            }
            continue;
        }

        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent: `e`/`E`, an optional sign, then at least one digit.
            if matches!(chars.get(i), Some('e' | 'E')) {
                let digits_at = match chars.get(i + 1) {
                    Some('+' | '-') => i + 2,
                    _ => i + 1,
                };
                if chars.get(digits_at).is_some_and(char::is_ascii_digit) {
                    i = digits_at;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            prev = Some(Token::Operand);
            continue;
        }

        match c {
            '(' | '[' | '{' => {
                stack.push(c);
                prev = Some(Token::Open(c));
            }
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(ExpressionError::Syntax(format!("unbalanced '{c}'")));
                }
                if matches!(prev, Some(Token::Operator) | Some(Token::Dot) | Some(Token::Pipe)) {
                    return Err(ExpressionError::Syntax(format!("missing operand before '{c}'")));
                }
                prev = Some(Token::Close);
            }
            '.' => prev = Some(Token::Dot),
            ',' => prev = Some(Token::Comma),
            ':' => prev = Some(Token::Colon),
            '|' if chars.get(i + 1) == Some(&'|') => {
                i += 1;
                prev = Some(Token::Operator);
            }
            '|' => prev = Some(Token::Pipe),
            '=' | '!' | '<' | '>' | '&' | '+' | '-' | '*' | '/' | '%' | '^' | '?' => {
                if (c == '=' || c == '&') && chars.get(i + 1) == Some(&c) {
                    i += 1;
                } else if (c == '!' || c == '<' || c == '>') && chars.get(i + 1) == Some(&'=') {
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'/') {
                    i += 1;
                } else if c == '=' || c == '&' {
                    return Err(ExpressionError::Syntax(format!(
                        "unexpected '{c}' (did you mean '{c}{c}'?)"
                    )));
                }
                prev = Some(Token::Operator);
            }
            other => {
                return Err(ExpressionError::Syntax(format!("unexpected character '{other}'")));
            }
        }
        i += 1;
    }

    if let Some(open) = stack.last() {
        return Err(ExpressionError::Syntax(format!("unclosed '{open}'")));
    }
    if matches!(
        prev,
        Some(Token::Operator) | Some(Token::Dot) | Some(Token::Pipe) | Some(Token::Colon)
    ) {
        return Err(ExpressionError::Syntax("unexpected end of expression".to_string()));
    }
    Ok(roots)
}

/// Structural syntax check only.
pub fn check_syntax(expression: &str) -> Result<(), ExpressionError> {
    scan(expression).map(|_| ())
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Switch `condition` evaluation (e.g. `_value == 'critical'`)
/// - Transform step expressions (e.g. `input.items|length`)
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().cloned().unwrap_or(Value::Null);
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match (&subject, &needle) {
                    (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
                    (Value::Array(items), n) => items.contains(n),
                    (Value::Object(map), Value::String(k)) => map.contains_key(k),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = args
                    .first()
                    .and_then(|v| v.as_object())
                    .map(|o| o.keys().cloned().collect())
                    .unwrap_or_default();
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate a routing condition. The result must be a boolean.
    ///
    /// Fails with `UndefinedReference` if the expression reads a root
    /// identifier that `scope` does not define.
    pub fn evaluate_condition(
        &self,
        expression: &str,
        scope: &Value,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate_value(expression, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean { result: other }),
        }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        scope: &Value,
    ) -> Result<Value, ExpressionError> {
        let Some(fields) = scope.as_object() else {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        };

        for root in scan(expression)? {
            if !fields.contains_key(&root) {
                return Err(ExpressionError::UndefinedReference(root));
            }
        }

        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
