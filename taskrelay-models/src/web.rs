use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::DEFAULT_QUEUE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub payload: Value,
}

impl SubmitTaskRequest {
    /// Read a submit body in either accepted shape.
    ///
    /// An object holding only `queue` and `payload` carries the task under
    /// `payload`, which may be any JSON value but null. Any other object is
    /// the task itself, minus `queue`, and must keep at least one field.
    /// Returns `None` for anything else, or when `queue` is not a string.
    pub fn from_body(body: Value) -> Option<Self> {
        let Value::Object(mut fields) = body else {
            return None;
        };
        let queue = match fields.remove("queue") {
            None => default_queue(),
            Some(Value::String(queue)) => queue,
            Some(_) => return None,
        };
        let payload = match fields.remove("payload") {
            Some(payload) if fields.is_empty() => payload,
            Some(payload) => {
                fields.insert("payload".to_string(), payload);
                Value::Object(fields)
            }
            None if fields.is_empty() => Value::Null,
            None => Value::Object(fields),
        };
        if payload.is_null() {
            None
        } else {
            Some(Self { queue, payload })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub task_id: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_request_defaults_queue_and_payload() {
        let request: SubmitTaskRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.queue, DEFAULT_QUEUE);
        assert!(request.payload.is_null());
    }

    #[test]
    fn wrapped_body_carries_the_task_under_payload() {
        let request =
            SubmitTaskRequest::from_body(json!({"queue": "math_queue", "payload": {"value": 2}}))
                .unwrap();
        assert_eq!(request.queue, "math_queue");
        assert_eq!(request.payload, json!({"value": 2}));

        let scalar = SubmitTaskRequest::from_body(json!({"payload": "text"})).unwrap();
        assert_eq!(scalar.payload, json!("text"));
    }

    #[test]
    fn flat_body_is_the_task_without_its_queue() {
        let request =
            SubmitTaskRequest::from_body(json!({"text": "hello", "queue": "string_queue"}))
                .unwrap();
        assert_eq!(request.queue, "string_queue");
        assert_eq!(request.payload, json!({"text": "hello"}));

        let defaulted = SubmitTaskRequest::from_body(json!({"value": 3})).unwrap();
        assert_eq!(defaulted.queue, DEFAULT_QUEUE);

        let with_payload_field =
            SubmitTaskRequest::from_body(json!({"payload": 1, "value": 3})).unwrap();
        assert_eq!(with_payload_field.payload, json!({"payload": 1, "value": 3}));
    }

    #[test]
    fn bodies_without_a_task_are_rejected() {
        assert!(SubmitTaskRequest::from_body(json!({"queue": "string_queue"})).is_none());
        assert!(SubmitTaskRequest::from_body(json!({"payload": null})).is_none());
        assert!(SubmitTaskRequest::from_body(json!([1, 2])).is_none());
        assert!(SubmitTaskRequest::from_body(json!({"queue": 7, "value": 1})).is_none());
    }
}
