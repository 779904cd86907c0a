//! Shape checks for run input and producer/consumer schema compatibility.

use serde_json::Value;
use stepwise_types::workflow::{ShapeKind, ShapeSchema};

fn kind_of(value: &Value) -> ShapeKind {
    match value {
        Value::Null => ShapeKind::Null,
        Value::Bool(_) => ShapeKind::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ShapeKind::Integer,
        Value::Number(_) => ShapeKind::Number,
        Value::String(_) => ShapeKind::String,
        Value::Array(_) => ShapeKind::Array,
        Value::Object(_) => ShapeKind::Object,
    }
}

/// Whether a value of kind `actual` satisfies an `expected` kind.
fn kind_satisfies(actual: ShapeKind, expected: ShapeKind) -> bool {
    actual == expected || (actual == ShapeKind::Integer && expected == ShapeKind::Number)
}

/// Validate `value` against `schema`. Returns every violation found.
pub fn validate(value: &Value, schema: &ShapeSchema) -> Result<(), Vec<String>> {
    let mut issues = Vec::new();
    validate_at("$", value, schema, &mut issues);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn validate_at(path: &str, value: &Value, schema: &ShapeSchema, issues: &mut Vec<String>) {
    if let Some(expected) = schema.kind {
        let actual = kind_of(value);
        if !kind_satisfies(actual, expected) {
            issues.push(format!("{path}: expected {expected}, got {actual}"));
            return;
        }
    }

    if let Value::Object(map) = value {
        for key in &schema.required {
            if !map.contains_key(key) {
                issues.push(format!("{path}: missing required field '{key}'"));
            }
        }
        for (key, prop) in &schema.properties {
            if let Some(child) = map.get(key) {
                validate_at(&format!("{path}.{key}"), child, prop, issues);
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.items.as_deref()) {
        for (i, item) in items.iter().enumerate() {
            validate_at(&format!("{path}[{i}]"), item, item_schema, issues);
        }
    }
}

/// Check that everything a consumer requires is guaranteed by a producer.
pub fn check_compatible(producer: &ShapeSchema, consumer: &ShapeSchema) -> Result<(), String> {
    compatible_at("$", producer, consumer)
}

fn compatible_at(path: &str, producer: &ShapeSchema, consumer: &ShapeSchema) -> Result<(), String> {
    if let (Some(produced), Some(expected)) = (producer.kind, consumer.kind) {
        if !kind_satisfies(produced, expected) {
            return Err(format!("{path}: produces {produced}, consumer expects {expected}"));
        }
    }

    for key in &consumer.required {
        if !producer.required.contains(key) {
            return Err(format!("{path}: consumer requires '{key}' which the producer does not guarantee"));
        }
    }

    for (key, expected) in &consumer.properties {
        if let Some(produced) = producer.properties.get(key) {
            compatible_at(&format!("{path}.{key}"), produced, expected)?;
        }
    }

    if let (Some(produced), Some(expected)) = (producer.items.as_deref(), consumer.items.as_deref()) {
        compatible_at(&format!("{path}[]"), produced, expected)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: Value) -> ShapeSchema {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_accepts_matching_shape() {
        let s = schema(json!({
            "type": "object",
            "required": ["severity"],
            "properties": {"severity": {"type": "string"}, "count": {"type": "number"}}
        }));
        assert!(validate(&json!({"severity": "high", "count": 3}), &s).is_ok());
    }

    #[test]
    fn test_validate_reports_all_issues() {
        let s = schema(json!({
            "type": "object",
            "required": ["severity", "source"],
            "properties": {"severity": {"type": "string"}}
        }));
        let issues = validate(&json!({"severity": 5}), &s).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.contains("missing required field 'source'")));
        assert!(issues.iter().any(|i| i.contains("$.severity: expected string")));
    }

    #[test]
    fn test_validate_array_items() {
        let s = schema(json!({"type": "array", "items": {"type": "integer"}}));
        assert!(validate(&json!([1, 2]), &s).is_ok());
        let issues = validate(&json!([1, "x"]), &s).unwrap_err();
        assert_eq!(issues, vec!["$[1]: expected integer, got string".to_string()]);
    }

    #[test]
    fn test_integer_satisfies_number() {
        let s = schema(json!({"type": "number"}));
        assert!(validate(&json!(3), &s).is_ok());
    }

    #[test]
    fn test_compatibility_requires_guaranteed_fields() {
        let producer = schema(json!({"type": "object", "required": ["a"]}));
        let consumer = schema(json!({"type": "object", "required": ["a", "b"]}));
        let err = check_compatible(&producer, &consumer).unwrap_err();
        assert!(err.contains("'b'"));

        let consumer_ok = schema(json!({"type": "object", "required": ["a"]}));
        assert!(check_compatible(&producer, &consumer_ok).is_ok());
    }

    #[test]
    fn test_compatibility_kind_mismatch() {
        let producer = schema(json!({"type": "string"}));
        let consumer = schema(json!({"type": "object"}));
        assert!(check_compatible(&producer, &consumer).is_err());
    }
}
