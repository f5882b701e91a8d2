//! Stock processors for the sample `string_queue` and `math_queue` workloads.

use std::sync::Arc;

use serde_json::Value;
use taskrelay_models::errors::{RuntimeError, SendableError};

use crate::TaskProcessor;

pub const UPPERCASE_TEXT: &str = "uppercase-text";
pub const DOUBLE_VALUE: &str = "double-value";

/// Replaces the `text` field with its upper-case form.
pub fn uppercase_text(mut task: Value) -> Result<Value, SendableError> {
    let text = task
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RuntimeError::boxed(
                "processor.uppercase_text.missing_text",
                "task has no string 'text' field",
            )
        })?
        .to_uppercase();
    task["text"] = Value::String(text);
    Ok(task)
}

/// Doubles the numeric `value` field.
pub fn double_value(mut task: Value) -> Result<Value, SendableError> {
    let doubled = match task.get("value") {
        Some(value) => match value.as_i64() {
            Some(n) => n.checked_mul(2).map(Value::from),
            None => value.as_f64().map(|n| Value::from(n * 2.0)),
        },
        None => None,
    }
    .ok_or_else(|| {
        RuntimeError::boxed(
            "processor.double_value.invalid_value",
            "task has no numeric 'value' field that can be doubled",
        )
    })?;
    task["value"] = doubled;
    Ok(task)
}

pub fn by_name(name: &str) -> Result<Arc<dyn TaskProcessor>, SendableError> {
    match name {
        UPPERCASE_TEXT => Ok(Arc::new(uppercase_text)),
        DOUBLE_VALUE => Ok(Arc::new(double_value)),
        other => Err(RuntimeError::boxed(
            "worker.processor.unknown",
            format!("Unknown processor '{other}'"),
        )),
    }
}
