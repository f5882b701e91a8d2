//! In-process durable queue with at-least-once delivery.
//!
//! Mirrors how an AMQP broker treats a consumer with prefetch 1: a delivery
//! stays unacknowledged until it is acked, nacked, or its connection goes
//! away, in which case it returns to the head of its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use taskrelay_comm::{decode_result, encode_result, encode_task};
use taskrelay_models::core::{Task, TaskResult};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::InFlight;
use crate::{
    Broker, BrokerConnection, BrokerError, BrokerKind, Delivery, DeliveryTag, ResultStore,
    RESULTS_QUEUE,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: Option<String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    connection_id: u64,
    queue_name: String,
    message: QueuedMessage,
}

struct QueueState {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    unacked: HashMap<DeliveryTag, Unacked>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    available: bool,
    next_tag: DeliveryTag,
    next_connection: u64,
}

impl QueueState {
    fn requeue(&mut self, tag: DeliveryTag) -> bool {
        match self.unacked.remove(&tag) {
            Some(mut unacked) => {
                unacked.message.redelivered = true;
                self.queues
                    .entry(unacked.queue_name)
                    .or_default()
                    .push_front(unacked.message);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    results: ResultStore,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_result_store(ResultStore::default())
    }

    pub fn with_result_store(results: ResultStore) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                queues: HashMap::new(),
                unacked: HashMap::new(),
                connections: HashMap::new(),
                available: true,
                next_tag: 1,
                next_connection: 1,
            })),
            notify: Arc::new(Notify::new()),
            results,
        }
    }

    /// Toggle whether new connections and enqueues are accepted.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Drop every live connection, returning their unacked deliveries to
    /// the head of their queues.
    pub fn sever_connections(&self) -> usize {
        let mut guard = self.state.lock();
        let severed: Vec<(u64, Arc<AtomicBool>)> = guard.connections.drain().collect();
        for (_, alive) in &severed {
            alive.store(false, Ordering::SeqCst);
        }
        let orphaned: Vec<DeliveryTag> = guard.unacked.keys().copied().collect();
        for tag in orphaned {
            guard.requeue(tag);
        }
        drop(guard);
        self.notify.notify_waiters();
        warn!("Severed {} in-memory broker connection(s)", severed.len());
        severed.len()
    }

    /// Push an arbitrary body onto a queue, bypassing the task codec.
    pub fn publish_raw(&self, queue_name: &str, body: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(QueuedMessage {
                message_id: None,
                body: body.into(),
                redelivered: false,
            });
        self.notify.notify_waiters();
    }

    pub fn pending(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Messages sitting on the results destination, not yet collected.
    pub fn uncollected_results(&self) -> usize {
        self.pending(RESULTS_QUEUE)
    }

    fn collect_results(&self) {
        let drained: Vec<QueuedMessage> = {
            let mut guard = self.state.lock();
            match guard.queues.get_mut(RESULTS_QUEUE) {
                Some(queue) => queue.drain(..).collect(),
                None => return,
            }
        };
        for message in drained {
            self.results.absorb(&message.body);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::DurableQueue
    }

    async fn connect(&self, queue_name: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut guard = self.state.lock();
        if !guard.available {
            return Err(BrokerError::Unavailable(
                "in-memory broker is refusing connections".into(),
            ));
        }
        guard.queues.entry(queue_name.to_string()).or_default();
        guard.queues.entry(RESULTS_QUEUE.to_string()).or_default();

        let id = guard.next_connection;
        guard.next_connection += 1;
        let alive = Arc::new(AtomicBool::new(true));
        guard.connections.insert(id, Arc::clone(&alive));
        drop(guard);

        debug!("Opened in-memory connection {} on {}", id, queue_name);
        Ok(Box::new(InMemoryConnection {
            id,
            queue_name: queue_name.to_string(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            alive,
            in_flight: InFlight::default(),
        }))
    }

    async fn enqueue(&self, task: &Task) -> Result<(), BrokerError> {
        let body = encode_task(task)?;
        let mut guard = self.state.lock();
        if !guard.available {
            return Err(BrokerError::Unavailable(
                "in-memory broker is refusing publishes".into(),
            ));
        }
        guard
            .queues
            .entry(task.queue_name.clone())
            .or_default()
            .push_back(QueuedMessage {
                message_id: Some(task.task_id.clone()),
                body,
                redelivered: false,
            });
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>, BrokerError> {
        self.collect_results();
        match self.results.get(task_id) {
            Some(raw) => Ok(Some(decode_result(raw.as_bytes())?)),
            None => Ok(None),
        }
    }
}

pub struct InMemoryConnection {
    id: u64,
    queue_name: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    alive: Arc<AtomicBool>,
    in_flight: InFlight,
}

impl InMemoryConnection {
    fn ensure_alive(&self) -> Result<(), BrokerError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost(format!(
                "in-memory connection {} was closed",
                self.id
            )))
        }
    }

    fn release(&mut self) {
        let mut guard = self.state.lock();
        let requeued = match self.in_flight.current() {
            Some(tag) => guard.requeue(tag),
            None => false,
        };
        guard.connections.remove(&self.id);
        drop(guard);
        self.alive.store(false, Ordering::SeqCst);
        if requeued {
            info!(
                "Connection {} released with an unacked delivery; requeued it on {}",
                self.id, self.queue_name
            );
            self.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn kind(&self) -> BrokerKind {
        BrokerKind::DurableQueue
    }

    async fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.in_flight.ensure_free()?;
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_alive()?;
            {
                let mut guard = self.state.lock();
                let next = guard
                    .queues
                    .get_mut(&self.queue_name)
                    .and_then(VecDeque::pop_front);
                if let Some(message) = next {
                    let tag = guard.next_tag;
                    guard.next_tag += 1;
                    guard.unacked.insert(
                        tag,
                        Unacked {
                            connection_id: self.id,
                            queue_name: self.queue_name.clone(),
                            message: message.clone(),
                        },
                    );
                    self.in_flight.begin(tag)?;
                    return Ok(Some(Delivery {
                        tag,
                        queue_name: self.queue_name.clone(),
                        message_id: message.message_id,
                        body: message.body,
                        redelivered: message.redelivered,
                    }));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    // Liveness is checked under the state lock: severing flips it under the
    // same lock, so a settle never sees a severed connection as alive.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        self.ensure_alive()?;
        self.in_flight.settle(delivery.tag)?;
        match guard.unacked.remove(&delivery.tag) {
            Some(unacked) if unacked.connection_id == self.id => Ok(()),
            _ => Err(BrokerError::AlreadySettled(delivery.tag)),
        }
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        self.ensure_alive()?;
        self.in_flight.settle(delivery.tag)?;
        if requeue {
            if !guard.requeue(delivery.tag) {
                return Err(BrokerError::AlreadySettled(delivery.tag));
            }
            drop(guard);
            self.notify.notify_waiters();
        } else if guard.unacked.remove(&delivery.tag).is_none() {
            return Err(BrokerError::AlreadySettled(delivery.tag));
        }
        Ok(())
    }

    async fn publish_result(&mut self, result: &TaskResult) -> Result<(), BrokerError> {
        self.ensure_alive()?;
        let body = encode_result(result)?;
        self.state
            .lock()
            .queues
            .entry(RESULTS_QUEUE.to_string())
            .or_default()
            .push_back(QueuedMessage {
                message_id: Some(result.task_id.clone()),
                body,
                redelivered: false,
            });
        Ok(())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}
