use std::{future::Future, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use log::{debug, info, warn};
use taskrelay_comm::{decode_result, encode_result, encode_task};
use taskrelay_models::core::{Task, TaskResult};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    Broker, BrokerConnection, BrokerError, BrokerKind, Delivery, ResultStore, RESULTS_QUEUE,
};

const JSON_CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COLLECTOR_RETRY_INTERVAL: Duration = Duration::from_secs(5);

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    async fn open(uri: &str) -> Result<Self, BrokerError> {
        within(CONNECT_TIMEOUT, uri, Self::connect(uri)).await
    }

    async fn connect(uri: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare(&self, queue_name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(connection_lost)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn publish(
        &self,
        routing_key: &str,
        message_id: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_message_id(message_id.to_string().into())
            .with_content_type(JSON_CONTENT_TYPE.to_string().into())
            .with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(connection_lost)?
            .await
            .map_err(connection_lost)?;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!("Error closing AMQP channel: {}", err);
        }
        if let Err(err) = self.connection.close(200, "closing").await {
            debug!("Error closing AMQP connection: {}", err);
        }
    }
}

fn connection_lost(err: lapin::Error) -> BrokerError {
    BrokerError::ConnectionLost(err.to_string())
}

async fn within<T, F>(limit: Duration, uri: &str, attempt: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(BrokerError::Unavailable(format!(
            "no answer from {uri} within {limit:?}"
        ))),
    }
}

/// Consume the results destination for the life of the process, storing
/// every result and acking it once stored.
async fn collect_results(uri: String, results: ResultStore) {
    loop {
        match consume_results(&uri, &results).await {
            Ok(()) => warn!("Result consumer on {} was cancelled", RESULTS_QUEUE),
            Err(err) => warn!("Collecting results from {} failed: {}", uri, err),
        }
        tokio::time::sleep(COLLECTOR_RETRY_INTERVAL).await;
    }
}

async fn consume_results(uri: &str, results: &ResultStore) -> Result<(), BrokerError> {
    let session = Session::open(uri).await?;
    session.declare(RESULTS_QUEUE).await?;
    let mut consumer = session
        .channel
        .basic_consume(
            RESULTS_QUEUE,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(connection_lost)?;
    info!("Collecting results from {} on {}", RESULTS_QUEUE, uri);

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.map_err(connection_lost)?;
        results.absorb(&delivery.data);
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(connection_lost)?;
    }
    Ok(())
}

/// Durable-queue backend on an AMQP 0-9-1 broker.
pub struct RabbitMqBroker {
    uri: String,
    publisher: Mutex<Option<Session>>,
    results: ResultStore,
}

impl RabbitMqBroker {
    pub fn new(uri: impl Into<String>, results: ResultStore) -> Self {
        Self {
            uri: uri.into(),
            publisher: Mutex::new(None),
            results,
        }
    }

    pub fn from_host(host: &str, port: u16, results: ResultStore) -> Self {
        Self::new(format!("amqp://{host}:{port}/%2f"), results)
    }

    async fn with_publisher<'a>(
        &self,
        guard: &'a mut Option<Session>,
    ) -> Result<&'a Session, BrokerError> {
        if guard.as_ref().is_some_and(|session| !session.is_open()) {
            warn!("Publisher session to {} is closed; reconnecting", self.uri);
            *guard = None;
        }
        if guard.is_none() {
            let session = Session::open(&self.uri).await?;
            session.declare(RESULTS_QUEUE).await?;
            *guard = Some(session);
        }
        guard
            .as_ref()
            .ok_or_else(|| BrokerError::Internal("publisher session missing".into()))
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::DurableQueue
    }

    async fn connect(&self, queue_name: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let session = Session::open(&self.uri).await?;
        session.declare(queue_name).await?;
        session.declare(RESULTS_QUEUE).await?;
        session
            .channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(connection_lost)?;
        let consumer = session
            .channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(connection_lost)?;
        info!("Consuming {} on {}", queue_name, self.uri);

        Ok(Box::new(RabbitMqConnection {
            queue_name: queue_name.to_string(),
            session,
            consumer,
            pending: None,
        }))
    }

    async fn enqueue(&self, task: &Task) -> Result<(), BrokerError> {
        let body = encode_task(task)?;
        let mut guard = self.publisher.lock().await;
        let outcome = async {
            let session = self.with_publisher(&mut guard).await?;
            session.declare(&task.queue_name).await?;
            session.publish(&task.queue_name, &task.task_id, &body).await
        }
        .await;
        if outcome.as_ref().is_err_and(BrokerError::is_connection_fault) {
            *guard = None;
        }
        outcome
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>, BrokerError> {
        match self.results.get(task_id) {
            Some(raw) => Ok(Some(decode_result(raw.as_bytes())?)),
            None => Ok(None),
        }
    }

    fn spawn_result_collector(&self) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(collect_results(
            self.uri.clone(),
            self.results.clone(),
        )))
    }
}

pub struct RabbitMqConnection {
    queue_name: String,
    session: Session,
    consumer: Consumer,
    pending: Option<AmqpDelivery>,
}

impl RabbitMqConnection {
    fn take_pending(&mut self, delivery: &Delivery) -> Result<AmqpDelivery, BrokerError> {
        match self.pending.take() {
            Some(pending) if pending.delivery_tag == delivery.tag => Ok(pending),
            other => {
                self.pending = other;
                Err(BrokerError::AlreadySettled(delivery.tag))
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn kind(&self) -> BrokerKind {
        BrokerKind::DurableQueue
    }

    async fn is_alive(&mut self) -> bool {
        self.session.is_open()
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        if let Some(pending) = &self.pending {
            return Err(BrokerError::PrefetchExceeded(pending.delivery_tag));
        }

        let delivery = match tokio::time::timeout(wait, self.consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(BrokerError::ConnectionLost(format!(
                    "consumer on {} was cancelled",
                    self.queue_name
                )))
            }
            Ok(Some(Err(err))) => return Err(connection_lost(err)),
            Ok(Some(Ok(delivery))) => delivery,
        };

        let message = Delivery {
            tag: delivery.delivery_tag,
            queue_name: self.queue_name.clone(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            body: delivery.data.clone(),
            redelivered: delivery.redelivered,
        };
        self.pending = Some(delivery);
        Ok(Some(message))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let pending = self.take_pending(delivery)?;
        pending
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(connection_lost)
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let pending = self.take_pending(delivery)?;
        pending
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(connection_lost)
    }

    async fn publish_result(&mut self, result: &TaskResult) -> Result<(), BrokerError> {
        let body = encode_result(result)?;
        self.session
            .publish(RESULTS_QUEUE, &result.task_id, &body)
            .await
    }

    async fn close(&mut self) {
        // Unacked deliveries return to the queue when the channel closes.
        self.pending = None;
        self.session.shutdown().await;
    }
}
