use async_trait::async_trait;
use serde_json::Value;
use taskrelay_models::errors::SendableError;

/// The work a worker performs on each decoded task.
///
/// Receives the task object (with its `task_id`) and returns the value that is
/// published as the task's result. An error or a panic makes the worker nack
/// the delivery.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, task: Value) -> Result<Value, SendableError>;
}

#[async_trait]
impl<F> TaskProcessor for F
where
    F: Fn(Value) -> Result<Value, SendableError> + Send + Sync + 'static,
{
    async fn process(&self, task: Value) -> Result<Value, SendableError> {
        (self)(task)
    }
}
