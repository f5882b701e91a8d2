use std::time::Duration;

use crate::BrokerError;

pub type DeliveryTag = u64;

/// Destination that durable-queue workers publish results to.
pub const RESULTS_QUEUE: &str = "results";

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86_400);

/// Fallback sleep of the list-based consumer when its list is empty.
pub const LIST_POLL_FALLBACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// At-least-once queue with ack/nack; failed deliveries are requeued.
    DurableQueue,
    /// List plus key-value store; a popped task is gone, failures drop it.
    ListStore,
}

impl BrokerKind {
    pub fn requeues_on_failure(self) -> bool {
        matches!(self, BrokerKind::DurableQueue)
    }
}

/// One in-flight dequeue of a task. Must be acked or nacked exactly once.
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue_name: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Prefetch window of one: tracks the single unsettled delivery of a connection.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    tag: Option<DeliveryTag>,
}

impl InFlight {
    pub(crate) fn ensure_free(&self) -> Result<(), BrokerError> {
        match self.tag {
            Some(tag) => Err(BrokerError::PrefetchExceeded(tag)),
            None => Ok(()),
        }
    }

    pub(crate) fn begin(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_free()?;
        self.tag = Some(tag);
        Ok(())
    }

    pub(crate) fn settle(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        if self.tag == Some(tag) {
            self.tag = None;
            Ok(())
        } else {
            Err(BrokerError::AlreadySettled(tag))
        }
    }

    pub(crate) fn current(&self) -> Option<DeliveryTag> {
        self.tag
    }
}
