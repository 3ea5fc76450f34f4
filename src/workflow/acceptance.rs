//! Acceptance-criteria validation.
//!
//! A dispatched task may carry `acceptance_criteria` in its metadata; the
//! completion endpoint checks the submitted result against them and
//! returns structured violation codes. A violating result leaves the task
//! incomplete (not failed) pending resubmission.

use serde_json::Value;

/// Check `result` against `criteria`, returning violation codes.
///
/// Supported criteria:
/// - `required_outputs`: each named output must appear somewhere in the
///   serialized result.
/// - `format`: expected JSON type of the result; object results always
///   pass.
/// - `min_sources`: the result's `sources` array must have at least this
///   many entries.
/// - `confidence_threshold`: the result's `confidence` number must meet it.
pub fn validate(criteria: &Value, result: Option<&Value>) -> Vec<String> {
    let mut violations = Vec::new();

    if let Some(required) = criteria.get("required_outputs").and_then(Value::as_array) {
        let serialized = result.map(|r| r.to_string()).unwrap_or_default();
        for output in required.iter().filter_map(Value::as_str) {
            if !serialized.contains(output) {
                violations.push(format!("missing_required_output: {output}"));
            }
        }
    }

    if let (Some(format), Some(result)) = (criteria.get("format").and_then(Value::as_str), result) {
        if json_type(result) != format && !result.is_object() {
            violations.push(format!("format_mismatch: expected {format}"));
        }
    }

    if let (Some(min), Some(result)) = (
        criteria.get("min_sources").and_then(Value::as_u64),
        result.filter(|r| r.is_object()),
    ) {
        let count = result
            .get("sources")
            .and_then(Value::as_array)
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        if count < min {
            violations.push(format!("insufficient_sources: need {min}"));
        }
    }

    if let (Some(threshold), Some(result)) = (
        criteria.get("confidence_threshold").and_then(Value::as_f64),
        result.filter(|r| r.is_object()),
    ) {
        if let Some(confidence) = result.get("confidence").and_then(Value::as_f64) {
            if confidence < threshold {
                violations.push(format!("low_confidence: {confidence} < {threshold}"));
            }
        }
    }

    violations
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
