//! In-process list plus key-value store.
//!
//! Tasks are pushed onto named lists and popped from the left. A popped task
//! exists only in the worker that popped it: there is no requeue path, so a
//! processing failure loses the task. Results are written into a TTL store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use taskrelay_comm::{decode_result, encode_result, encode_task};
use taskrelay_models::core::{Task, TaskResult};
use tokio::time::Instant;

use crate::types::InFlight;
use crate::{
    Broker, BrokerConnection, BrokerError, BrokerKind, Delivery, DeliveryTag, ResultStore,
    LIST_POLL_FALLBACK,
};

#[derive(Default)]
struct ListState {
    lists: HashMap<String, VecDeque<String>>,
    next_tag: DeliveryTag,
}

#[derive(Clone)]
pub struct InMemoryListBroker {
    state: Arc<Mutex<ListState>>,
    results: ResultStore,
}

impl InMemoryListBroker {
    pub fn new(result_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ListState::default())),
            results: ResultStore::new(result_ttl),
        }
    }

    /// Push an arbitrary string onto a list, bypassing the task codec.
    pub fn publish_raw(&self, queue_name: &str, body: impl Into<String>) {
        self.state
            .lock()
            .lists
            .entry(queue_name.to_string())
            .or_default()
            .push_back(body.into());
    }

    pub fn pending(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .lists
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }
}

impl Default for InMemoryListBroker {
    fn default() -> Self {
        Self::new(crate::DEFAULT_RESULT_TTL)
    }
}

#[async_trait]
impl Broker for InMemoryListBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ListStore
    }

    async fn connect(&self, queue_name: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        Ok(Box::new(InMemoryListConnection {
            queue_name: queue_name.to_string(),
            state: Arc::clone(&self.state),
            results: self.results.clone(),
            in_flight: InFlight::default(),
            closed: false,
        }))
    }

    async fn enqueue(&self, task: &Task) -> Result<(), BrokerError> {
        let body = String::from_utf8(encode_task(task)?)
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        self.state
            .lock()
            .lists
            .entry(task.queue_name.clone())
            .or_default()
            .push_back(body);
        Ok(())
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>, BrokerError> {
        match self.results.get(task_id) {
            Some(raw) => Ok(Some(decode_result(raw.as_bytes())?)),
            None => Ok(None),
        }
    }
}

pub struct InMemoryListConnection {
    queue_name: String,
    state: Arc<Mutex<ListState>>,
    results: ResultStore,
    in_flight: InFlight,
    closed: bool,
}

impl InMemoryListConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::ConnectionLost("list connection was closed".into()))
        } else {
            Ok(())
        }
    }

    fn pop(&mut self) -> Option<(DeliveryTag, String)> {
        let mut guard = self.state.lock();
        let raw = guard.lists.get_mut(&self.queue_name)?.pop_front()?;
        guard.next_tag += 1;
        Some((guard.next_tag, raw))
    }
}

#[async_trait]
impl BrokerConnection for InMemoryListConnection {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ListStore
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        self.in_flight.ensure_free()?;
        let deadline = Instant::now() + wait;

        loop {
            if let Some((tag, raw)) = self.pop() {
                self.in_flight.begin(tag)?;
                return Ok(Some(Delivery {
                    tag,
                    queue_name: self.queue_name.clone(),
                    message_id: None,
                    body: raw.into_bytes(),
                    redelivered: false,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LIST_POLL_FALLBACK.min(deadline - now)).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.in_flight.settle(delivery.tag)
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if requeue {
            return Err(BrokerError::NotSupported(
                "list stores cannot requeue a popped task",
            ));
        }
        self.in_flight.settle(delivery.tag)?;
        warn!(
            "Dropped delivery {} from {}; list stores keep no copy",
            delivery.tag, self.queue_name
        );
        Ok(())
    }

    async fn publish_result(&mut self, result: &TaskResult) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let raw = String::from_utf8(encode_result(result)?)
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        self.results.set(result.task_id.clone(), raw);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
