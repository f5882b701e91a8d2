use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use redis::{aio::MultiplexedConnection, Client, ErrorKind, RedisError};
use taskrelay_comm::{decode_result, encode_result, encode_task};
use taskrelay_models::core::{Task, TaskResult};
use tokio::time::Instant;

use crate::result_store::MIN_RESULT_TTL;
use crate::types::InFlight;
use crate::{
    Broker, BrokerConnection, BrokerError, BrokerKind, Delivery, DeliveryTag, LIST_POLL_FALLBACK,
};

/// Replies a server sends while failing over, loading or busy. The command
/// can succeed again later, on this connection or a new one.
fn is_transient(err: &RedisError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ReadOnly
            | ErrorKind::BusyLoadingError
            | ErrorKind::TryAgain
            | ErrorKind::MasterDown
            | ErrorKind::ClusterDown
    ) || err.code() == Some("BUSY")
}

fn map_redis_error(err: RedisError) -> BrokerError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || is_transient(&err)
    {
        BrokerError::ConnectionLost(err.to_string())
    } else {
        BrokerError::Internal(err.to_string())
    }
}

/// List-plus-key-value backend on Redis: `RPUSH`/`LPOP` for tasks, `SET .. EX`
/// for results.
pub struct RedisListBroker {
    client: Client,
    result_ttl: Duration,
}

impl RedisListBroker {
    pub fn new(url: &str, result_ttl: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|err| BrokerError::Internal(err.to_string()))?;
        Ok(Self { client, result_ttl })
    }

    pub fn from_host(host: &str, port: u16, result_ttl: Duration) -> Result<Self, BrokerError> {
        Self::new(&format!("redis://{host}:{port}/0"), result_ttl)
    }

    async fn open(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisListBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ListStore
    }

    async fn connect(&self, queue_name: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = self.open().await?;
        info!("Polling Redis list {}", queue_name);
        Ok(Box::new(RedisListConnection {
            conn,
            queue_name: queue_name.to_string(),
            result_ttl: self.result_ttl,
            in_flight: InFlight::default(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn enqueue(&self, task: &Task) -> Result<(), BrokerError> {
        let body = encode_task(task)?;
        let mut conn = self.open().await?;
        redis::cmd("RPUSH")
            .arg(&task.queue_name)
            .arg(body)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>, BrokerError> {
        let mut conn = self.open().await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(task_id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match raw {
            Some(body) => Ok(Some(decode_result(&body)?)),
            None => Ok(None),
        }
    }
}

pub struct RedisListConnection {
    conn: MultiplexedConnection,
    queue_name: String,
    result_ttl: Duration,
    in_flight: InFlight,
    next_tag: DeliveryTag,
    closed: bool,
}

impl RedisListConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::ConnectionLost("redis connection was closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for RedisListConnection {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ListStore
    }

    async fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn)
            .await
            .is_ok()
    }

    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        self.in_flight.ensure_free()?;
        let deadline = Instant::now() + wait;

        loop {
            let popped: Option<Vec<u8>> = redis::cmd("LPOP")
                .arg(&self.queue_name)
                .query_async(&mut self.conn)
                .await
                .map_err(map_redis_error)?;

            if let Some(body) = popped {
                self.next_tag += 1;
                let tag = self.next_tag;
                self.in_flight.begin(tag)?;
                return Ok(Some(Delivery {
                    tag,
                    queue_name: self.queue_name.clone(),
                    message_id: None,
                    body,
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
            "Dropped delivery {} from {}; Redis keeps no copy",
            delivery.tag, self.queue_name
        );
        Ok(())
    }

    async fn publish_result(&mut self, result: &TaskResult) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let body = encode_result(result)?;
        redis::cmd("SET")
            .arg(&result.task_id)
            .arg(body)
            .arg("EX")
            .arg(self.result_ttl.max(MIN_RESULT_TTL).as_secs())
            .query_async::<_, ()>(&mut self.conn)
            .await
            .map_err(map_redis_error)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_and_loading_replies_are_connection_faults() {
        for (kind, reply) in [
            (ErrorKind::ReadOnly, "READONLY"),
            (ErrorKind::BusyLoadingError, "LOADING"),
            (ErrorKind::TryAgain, "TRYAGAIN"),
            (ErrorKind::MasterDown, "MASTERDOWN"),
            (ErrorKind::ClusterDown, "CLUSTERDOWN"),
        ] {
            let err = map_redis_error(RedisError::from((kind, reply)));
            assert!(err.is_connection_fault(), "{reply} mapped to {err:?}");
        }
    }

    #[test]
    fn dropped_sockets_are_connection_faults() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(map_redis_error(RedisError::from(io)).is_connection_fault());
    }

    #[test]
    fn command_errors_stay_internal() {
        let err = map_redis_error(RedisError::from((ErrorKind::TypeError, "WRONGTYPE")));
        assert!(matches!(err, BrokerError::Internal(_)));
    }
}
