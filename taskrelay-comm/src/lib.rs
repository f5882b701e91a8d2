//! JSON envelope for tasks and results as they travel through a broker.
//!
//! Object payloads go on the wire as the object itself with `task_id`
//! stamped in. Any other JSON value is wrapped as `{ "task_id", "payload" }`.

use serde_json::{Map, Value};
use taskrelay_models::core::{Task, TaskResult};
use thiserror::Error;

pub const TASK_ID_FIELD: &str = "task_id";
pub const WRAPPED_PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task message must be a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("task message carries no task_id")]
    MissingTaskId,
}

/// Serialize a task for the queue, stamping its id into the body.
pub fn encode_task(task: &Task) -> Result<Vec<u8>, CodecError> {
    let body = stamp_task_id(task.payload.clone(), &task.task_id);
    Ok(serde_json::to_vec(&body)?)
}

/// Decode a queued task body.
///
/// The id is read from the body and falls back to the transport message id.
/// The decoded payload is the whole object, `task_id` included.
pub fn decode_task(
    body: &[u8],
    message_id: Option<&str>,
    queue_name: &str,
) -> Result<Task, CodecError> {
    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(object) = value else {
        return Err(CodecError::NotAnObject(kind_of(&value)));
    };

    let task_id = match object.get(TASK_ID_FIELD).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => message_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(CodecError::MissingTaskId)?,
    };

    let payload = stamp_task_id(Value::Object(object), &task_id);
    Ok(Task::new(task_id, payload, queue_name))
}

/// Place `task_id` into an object payload, or wrap a non-object payload.
pub fn stamp_task_id(payload: Value, task_id: &str) -> Value {
    match payload {
        Value::Object(mut object) => {
            object.insert(TASK_ID_FIELD.into(), Value::String(task_id.to_string()));
            Value::Object(object)
        }
        other => {
            let mut object = Map::new();
            object.insert(TASK_ID_FIELD.into(), Value::String(task_id.to_string()));
            object.insert(WRAPPED_PAYLOAD_FIELD.into(), other);
            Value::Object(object)
        }
    }
}

pub fn task_id_of(value: &Value) -> Option<&str> {
    value.get(TASK_ID_FIELD).and_then(Value::as_str)
}

pub fn encode_result(result: &TaskResult) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(result)?)
}

pub fn decode_result(body: &[u8]) -> Result<TaskResult, CodecError> {
    Ok(serde_json::from_slice(body)?)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_payload_is_stamped_in_place() {
        let task = Task::new("abc", json!({"text": "hello"}), "string_queue");
        let body = encode_task(&task).unwrap();
        let wire: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(wire, json!({"text": "hello", "task_id": "abc"}));
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let task = Task::new("n1", json!(5), "math_queue");
        let wire: Value = serde_json::from_slice(&encode_task(&task).unwrap()).unwrap();
        assert_eq!(wire, json!({"task_id": "n1", "payload": 5}));
    }

    #[test]
    fn decode_keeps_nested_structure() {
        let body = br#"{"task_id":"t","items":[3,1,2],"meta":{"z":1,"a":2}}"#;
        let task = decode_task(body, None, "q").unwrap();
        assert_eq!(task.task_id, "t");
        assert_eq!(task.queue_name, "q");
        assert_eq!(task.payload["items"], json!([3, 1, 2]));
        assert_eq!(task.payload["meta"]["a"], json!(2));
    }

    #[test]
    fn decode_falls_back_to_message_id() {
        let task = decode_task(br#"{"value":5}"#, Some("from-header"), "math_queue").unwrap();
        assert_eq!(task.task_id, "from-header");
        assert_eq!(task_id_of(&task.payload), Some("from-header"));
    }

    #[test]
    fn decode_rejects_missing_id_and_non_objects() {
        assert!(matches!(
            decode_task(br#"{"value":5}"#, None, "q"),
            Err(CodecError::MissingTaskId)
        ));
        assert!(matches!(
            decode_task(b"[1,2]", Some("id"), "q"),
            Err(CodecError::NotAnObject("array"))
        ));
        assert!(matches!(
            decode_task(b"{not json", Some("id"), "q"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn result_survives_the_wire() {
        let result = TaskResult::new("abc", json!({"text": "HELLO", "task_id": "abc"}));
        let decoded = decode_result(&encode_result(&result).unwrap()).unwrap();
        assert_eq!(decoded, result);
    }
}
