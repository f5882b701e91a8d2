use std::{any::Any, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde_json::Value;
use taskrelay_broker::{Broker, BrokerConnection, BrokerError, Delivery};
use taskrelay_comm::decode_task;
use taskrelay_models::{
    core::TaskResult,
    errors::{RuntimeError, SendableError},
};
use taskrelay_utilities::retry::FixedBackoff;
use tokio::sync::watch;

use crate::{
    errors::WorkerError,
    processor::TaskProcessor,
    supervisor::{LoopPhase, StopSignal, WorkerHandle, WorkerStatus},
};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct WorkerSettings {
    pub queue_name: String,
    /// Pause between connection attempts while the broker is unreachable.
    pub reconnect_backoff: FixedBackoff,
    /// Longest a single wait for a delivery may take; liveness and the stop
    /// flag are re-checked at least this often.
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            reconnect_backoff: FixedBackoff::new(DEFAULT_RECONNECT_INTERVAL),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_reconnect_backoff(mut self, backoff: FixedBackoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// How a connected session ended without a fatal error.
pub(crate) enum SessionEnd {
    Stopped,
    Lost(BrokerError),
}

/// A long-running consumer of one queue.
///
/// Call [`Worker::run`] to start it; stop it through a [`WorkerHandle`].
pub struct Worker {
    pub(crate) broker: Arc<dyn Broker>,
    processor: Arc<dyn TaskProcessor>,
    pub(crate) settings: WorkerSettings,
    pub(crate) stop: Arc<StopSignal>,
    status: watch::Sender<WorkerStatus>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<dyn TaskProcessor>,
        settings: WorkerSettings,
    ) -> Self {
        let (status, _) = watch::channel(WorkerStatus::default());
        Self {
            broker,
            processor,
            settings,
            stop: Arc::new(StopSignal::default()),
            status,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.queue_name
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle::new(Arc::clone(&self.stop), self.status.subscribe())
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Request a graceful stop. A task already being processed is finished
    /// and settled first.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub(crate) fn update_status(&self, change: impl FnOnce(&mut WorkerStatus)) {
        self.status.send_modify(change);
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.update_status(|status| status.phase = phase);
    }

    /// Consume deliveries one at a time until the stop flag is raised or the
    /// connection is lost.
    pub(crate) async fn run_session(
        &self,
        connection: &mut dyn BrokerConnection,
    ) -> Result<SessionEnd, WorkerError> {
        loop {
            self.set_phase(LoopPhase::Idle);
            if self.stop.is_triggered() {
                return Ok(SessionEnd::Stopped);
            }
            if !connection.is_alive().await {
                return Ok(SessionEnd::Lost(BrokerError::ConnectionLost(
                    "liveness check failed".into(),
                )));
            }

            self.set_phase(LoopPhase::AwaitDelivery);
            let delivery = match connection.next_delivery(self.settings.poll_interval).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => return session_failure("next_delivery", err),
            };

            if let Err((context, err)) = self.handle_delivery(connection, delivery).await {
                return session_failure(context, err);
            }
            // A requeued delivery comes straight back; give the runtime a turn.
            tokio::task::yield_now().await;
        }
    }

    async fn handle_delivery(
        &self,
        connection: &mut dyn BrokerConnection,
        delivery: Delivery,
    ) -> Result<(), (&'static str, BrokerError)> {
        self.set_phase(LoopPhase::Processing);
        let processed = self.process(&delivery).await;

        match processed {
            Ok(result) => {
                // The result must be durable before the task leaves the queue.
                self.set_phase(LoopPhase::Publishing);
                connection
                    .publish_result(&result)
                    .await
                    .map_err(|err| ("publish_result", err))?;

                self.set_phase(LoopPhase::Acking);
                connection
                    .ack(&delivery)
                    .await
                    .map_err(|err| ("ack", err))?;

                self.update_status(|status| status.completed += 1);
                info!("Task {} completed and acknowledged", result.task_id);
            }
            Err(err) => {
                let requeue = connection.kind().requeues_on_failure();
                if requeue {
                    warn!(
                        "Delivery {} from {} failed: {}. Returning it to the queue",
                        delivery.tag, delivery.queue_name, err
                    );
                } else {
                    error!(
                        "Delivery {} from {} failed: {}. The task is dropped",
                        delivery.tag, delivery.queue_name, err
                    );
                }

                self.set_phase(LoopPhase::Acking);
                connection
                    .nack(&delivery, requeue)
                    .await
                    .map_err(|err| ("nack", err))?;
                self.update_status(|status| status.failed += 1);
            }
        }
        Ok(())
    }

    async fn process(&self, delivery: &Delivery) -> Result<TaskResult, SendableError> {
        let task = decode_task(
            &delivery.body,
            delivery.message_id.as_deref(),
            &delivery.queue_name,
        )?;
        if delivery.redelivered {
            info!("Received redelivered task {}", task.task_id);
        } else {
            info!("Received task {}", task.task_id);
        }
        debug!("Task {} payload: {}", task.task_id, task.payload);

        let value = self.run_processor(task.payload).await?;
        Ok(TaskResult::new(task.task_id, value))
    }

    /// The processor runs on its own task so a panic inside it is reported
    /// like any other processing failure.
    async fn run_processor(&self, payload: Value) -> Result<Value, SendableError> {
        let processor = Arc::clone(&self.processor);
        match tokio::spawn(async move { processor.process(payload).await }).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(RuntimeError::boxed(
                "worker.processor.panicked",
                panic_message(err.into_panic()),
            )),
            Err(err) => Err(RuntimeError::boxed(
                "worker.processor.cancelled",
                err.to_string(),
            )),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "processor panicked".to_string()
    }
}

fn session_failure(context: &'static str, err: BrokerError) -> Result<SessionEnd, WorkerError> {
    if err.is_connection_fault() {
        Ok(SessionEnd::Lost(err))
    } else {
        Err(WorkerError::classify(context, err))
    }
}
