use serde_json::Value;

use crate::error::{TaskError, TaskErrorKind};

/// Validate a structured value against a JSON-Schema subset: `type`,
/// `required`, `properties` and `items`. Anything the schema does not
/// mention is accepted; a `null` or missing schema accepts everything.
///
/// Returns a `Validation` task error naming the first offending path.
pub fn validate_value(schema: &Value, value: &Value) -> Result<(), TaskError> {
    check(schema, value, "$")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), TaskError> {
    let obj = match schema.as_object() {
        Some(o) if !o.is_empty() => o,
        _ => return Ok(()),
    };

    if let Some(expected) = obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(mismatch(path, expected, value));
        }
    }

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        let map = value.as_object();
        for field in required.iter().filter_map(Value::as_str) {
            let present = map.map(|m| m.contains_key(field)).unwrap_or(false);
            if !present {
                return Err(TaskError::new(
                    TaskErrorKind::Validation,
                    format!("missing required field '{}.{}'", path, field),
                ));
            }
        }
    }

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        if let Some(map) = value.as_object() {
            for (key, sub_schema) in props {
                if let Some(sub_value) = map.get(key) {
                    check(sub_schema, sub_value, &format!("{}.{}", path, key))?;
                }
            }
        }
    }

    if let Some(item_schema) = obj.get("items") {
        if let Some(items) = value.as_array() {
            for (i, item) in items.iter().enumerate() {
                check(item_schema, item, &format!("{}[{}]", path, i))?;
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn mismatch(path: &str, expected: &str, value: &Value) -> TaskError {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    TaskError::new(
        TaskErrorKind::Validation,
        format!("{}: expected {}, got {}", path, expected, actual),
    )
}

/// Top-level field names a schema's `properties` block advertises. Used by
/// the composer to wire step outputs into later step inputs.
pub fn advertised_fields(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}
