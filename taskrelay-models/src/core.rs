use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue used when a submission does not name one.
pub const DEFAULT_QUEUE: &str = "default_queue";

/// A unit of work addressed to a named queue. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub payload: Value,
    pub queue_name: String,
}

impl Task {
    pub fn new(task_id: impl Into<String>, payload: Value, queue_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
            queue_name: queue_name.into(),
        }
    }
}

/// Output of a successful processing run, stored under its task id.
///
/// At most one live result exists per task id; a later write replaces an
/// earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, value: Value) -> Self {
        Self {
            task_id: task_id.into(),
            value,
            created_at: Utc::now(),
        }
    }
}
