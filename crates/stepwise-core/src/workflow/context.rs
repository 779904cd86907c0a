//! Run context: the per-run JSON variable bag threaded between steps.
//!
//! `RunContext` is owned by the coordinator, which is its only writer.
//! Executors receive a read-only snapshot and return their output plus the
//! path it should be written at. Paths are dot-separated with optional
//! array indices (`alert.severity`, `items[0].name`, `steps.fetch.output`).
//!
//! Reserved top-level keys:
//! - `input` -- the run input
//! - `steps` -- `steps.<id>.output` for every completed step
//! - `run` -- `{ id, workflow }`

use serde_json::{Map, Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Top-level keys the engine writes itself; steps may not target them.
pub const RESERVED_KEYS: &[&str] = &["input", "steps", "run"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("cannot write '{path}': {reason}")]
    NotWritable { path: String, reason: String },

    #[error("context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, ContextError> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(ContextError::InvalidPath(path.to_string()));
    }

    let invalid = || ContextError::InvalidPath(path.to_string());
    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            return Err(invalid());
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            match key.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Key(key.to_string())),
            }
        } else if rest.is_empty() {
            return Err(invalid());
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            let inner = rest[1..close].trim();
            let inner = inner.trim_matches(|c| c == '\'' || c == '"');
            match inner.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) if !inner.is_empty() => segments.push(Segment::Key(inner.to_string())),
                Err(_) => return Err(invalid()),
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid());
            }
        }
    }
    Ok(segments)
}

/// Whether `path` is a syntactically valid context path.
pub fn is_valid_path(path: &str) -> bool {
    parse_path(path).is_ok()
}

/// The first key of a path (`alert` for `alert.severity`).
pub fn root_key(path: &str) -> Option<String> {
    match parse_path(path).ok()?.into_iter().next()? {
        Segment::Key(key) => Some(key),
        Segment::Index(_) => None,
    }
}

/// Read the value at `path`. Missing keys and out-of-range indices yield `None`.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let mut current = root;
    for segment in &segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
            (Segment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), ContextError> {
    let segments = parse_path(path)?;
    let not_writable = |reason: &str| ContextError::NotWritable {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ContextError::InvalidPath(path.to_string()))?;

    let mut current = root;
    for segment in parents {
        current = match segment {
            Segment::Key(key) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let map = current
                    .as_object_mut()
                    .ok_or_else(|| not_writable("parent is not an object"))?;
                map.entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            Segment::Index(index) => current
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or_else(|| not_writable("array index out of range"))?,
        };
    }

    match last {
        Segment::Key(key) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current
                .as_object_mut()
                .ok_or_else(|| not_writable("parent is not an object"))?
                .insert(key.clone(), value);
        }
        Segment::Index(index) => {
            let slot = current
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or_else(|| not_writable("array index out of range"))?;
            *slot = value;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// The context of one run, with a size limit on its serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    data: Value,
    max_bytes: usize,
}

impl RunContext {
    /// Fresh context for a new run.
    pub fn new(run_id: Uuid, workflow_id: &str, input: Value, max_bytes: usize) -> Self {
        Self {
            data: json!({
                "input": input,
                "steps": {},
                "run": { "id": run_id.to_string(), "workflow": workflow_id },
            }),
            max_bytes,
        }
    }

    /// Rehydrate a persisted context.
    pub fn from_value(data: Value, max_bytes: usize) -> Self {
        let data = if data.is_object() {
            data
        } else {
            Value::Object(Map::new())
        };
        Self { data, max_bytes }
    }

    pub fn as_value(&self) -> &Value {
        &self.data
    }

    pub fn into_value(self) -> Value {
        self.data
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.data, path)
    }

    /// Apply a step's result: write it at `write_path` (when given) and
    /// record it under `steps.<step_id>.output`.
    ///
    /// On error the context is left unchanged.
    pub fn apply_step_output(
        &mut self,
        step_id: &str,
        write_path: Option<&str>,
        output: &Value,
    ) -> Result<(), ContextError> {
        let mut next = self.data.clone();
        if let Some(path) = write_path {
            set_path(&mut next, path, output.clone())?;
        }
        let steps = next
            .as_object_mut()
            .map(|root| {
                root.entry("steps")
                    .or_insert_with(|| Value::Object(Map::new()))
            })
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ContextError::NotWritable {
                path: "steps".to_string(),
                reason: "steps is not an object".to_string(),
            })?;
        steps.insert(step_id.to_string(), json!({ "output": output }));

        let size = serialized_size(&next);
        if size > self.max_bytes {
            tracing::warn!(step_id, size, max = self.max_bytes, "run context exceeds size limit");
            return Err(ContextError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        self.data = next;
        Ok(())
    }

    /// Write an arbitrary value (used for caught errors).
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ContextError> {
        set_path(&mut self.data, path, value)
    }

    pub fn size_bytes(&self) -> usize {
        serialized_size(&self.data)
    }

    /// Resolve `{{ path }}` placeholders in a string.
    ///
    /// Unknown references are left as-is (not an error).
    pub fn resolve_template(&self, template: &str) -> String {
        resolve_template(&self.data, template)
    }

    /// Resolve placeholders in every string leaf of `value`.
    ///
    /// A string consisting of exactly one placeholder resolves to the
    /// referenced value itself, preserving its JSON type.
    pub fn resolve_value(&self, value: &Value) -> Value {
        resolve_value(&self.data, value)
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Resolve `{{ path }}` placeholders against `root`.
pub fn resolve_template(root: &Value, template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            result.push_str(&rest[start..]);
            return result;
        };
        let expr = after_open[..end].trim();
        match get_path(root, expr) {
            Some(value) => result.push_str(&value_to_string(value)),
            None => result.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);
    result
}

/// Resolve placeholders in every string leaf of `value`.
pub fn resolve_value(root: &Value, value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(inner) = trimmed
                .strip_prefix("{{")
                .and_then(|t| t.strip_suffix("}}"))
                .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
            {
                if let Some(found) = get_path(root, inner.trim()) {
                    return found.clone();
                }
            }
            Value::String(resolve_template(root, s))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(root, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(root, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
