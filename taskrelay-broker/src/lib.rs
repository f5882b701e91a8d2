pub mod adapters;
pub mod backend;
mod errors;
pub mod http;
pub mod in_memory;
pub mod in_memory_list;
mod result_store;
mod types;

pub use errors::BrokerError;
pub use result_store::{ResultStore, MIN_RESULT_TTL};
pub use types::{
    BrokerKind, Delivery, DeliveryTag, DEFAULT_RESULT_TTL, LIST_POLL_FALLBACK, RESULTS_QUEUE,
};

use std::time::Duration;

use async_trait::async_trait;
use taskrelay_models::core::{Task, TaskResult};

/// Shared handle to a queue backend.
///
/// Producers enqueue through it and readers look up results. Each worker
/// opens its own [`BrokerConnection`] with [`Broker::connect`]; connections
/// are never shared between workers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn kind(&self) -> BrokerKind;

    /// Open an exclusive consumer session on `queue_name`.
    ///
    /// Durable-queue backends declare the queue durable, non-exclusive and
    /// non-auto-delete, and limit the session to one unacknowledged delivery.
    async fn connect(&self, queue_name: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;

    async fn enqueue(&self, task: &Task) -> Result<(), BrokerError>;

    /// Read-only lookup of a live result. Never blocks waiting for one.
    async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>, BrokerError>;

    /// Start moving results published to [`RESULTS_QUEUE`] into the store
    /// that [`Broker::fetch_result`] reads. Backends whose results are
    /// readable where workers write them have nothing to collect.
    fn spawn_result_collector(&self) -> Option<tokio::task::JoinHandle<()>> {
        None
    }
}

/// A worker's consumer session.
///
/// Every delivery handed out must be settled exactly once with [`ack`] or
/// [`nack`]; a second settlement fails with [`BrokerError::AlreadySettled`].
///
/// [`ack`]: BrokerConnection::ack
/// [`nack`]: BrokerConnection::nack
#[async_trait]
pub trait BrokerConnection: Send {
    fn kind(&self) -> BrokerKind;

    async fn is_alive(&mut self) -> bool;

    /// Wait up to `wait` for the next delivery.
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Permanently remove the delivered task from the queue.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery. Only durable queues accept `requeue = true`; list
    /// stores have already removed the task and can only drop it.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn publish_result(&mut self, result: &TaskResult) -> Result<(), BrokerError>;

    /// Release the session. Dropping a connection releases it as well.
    async fn close(&mut self);
}
