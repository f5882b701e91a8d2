use std::{sync::Arc, time::Duration};

use clap::Args;
use log::info;
use taskrelay_models::errors::{RuntimeError, SendableError};

use crate::{in_memory::InMemoryBroker, in_memory_list::InMemoryListBroker, Broker, ResultStore};

const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Args, Debug, Clone)]
pub struct BackendConfig {
    /// rabbitmq | redis | in-memory | in-memory-list
    #[arg(long, env = "TASKRELAY_BROKER_BACKEND", default_value = "rabbitmq")]
    pub broker_backend: String,

    #[arg(long, env = "TASKRELAY_BROKER_HOST", default_value = "localhost")]
    pub broker_host: String,

    #[arg(long, env = "TASKRELAY_BROKER_PORT")]
    pub broker_port: Option<u16>,

    /// Seconds a published result stays readable; at least 1.
    #[arg(
        long,
        env = "TASKRELAY_RESULT_TTL_SECONDS",
        default_value_t = 86_400,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub result_ttl_seconds: u64,
}

impl BackendConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_seconds)
    }

    fn port_or(&self, default: u16) -> u16 {
        self.broker_port.unwrap_or(default)
    }
}

pub fn build_broker(config: &BackendConfig) -> Result<Arc<dyn Broker>, SendableError> {
    info!(
        "Using '{}' broker backend at {}",
        config.broker_backend, config.broker_host
    );
    match config.broker_backend.as_str() {
        "rabbitmq" => build_rabbitmq(config),
        "redis" => build_redis(config),
        "in-memory" => Ok(Arc::new(InMemoryBroker::with_result_store(
            ResultStore::new(config.result_ttl()),
        ))),
        "in-memory-list" => Ok(Arc::new(InMemoryListBroker::new(config.result_ttl()))),
        other => Err(RuntimeError::boxed(
            "broker.backend.unknown",
            format!("Unknown broker backend '{other}'"),
        )),
    }
}

#[cfg(feature = "rabbitmq")]
fn build_rabbitmq(config: &BackendConfig) -> Result<Arc<dyn Broker>, SendableError> {
    Ok(Arc::new(crate::adapters::rabbitmq::RabbitMqBroker::from_host(
        &config.broker_host,
        config.port_or(DEFAULT_AMQP_PORT),
        ResultStore::new(config.result_ttl()),
    )))
}

#[cfg(not(feature = "rabbitmq"))]
fn build_rabbitmq(config: &BackendConfig) -> Result<Arc<dyn Broker>, SendableError> {
    Err(not_compiled(config, DEFAULT_AMQP_PORT, "rabbitmq"))
}

#[cfg(feature = "redis")]
fn build_redis(config: &BackendConfig) -> Result<Arc<dyn Broker>, SendableError> {
    let broker = crate::adapters::redis::RedisListBroker::from_host(
        &config.broker_host,
        config.port_or(DEFAULT_REDIS_PORT),
        config.result_ttl(),
    )?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
fn build_redis(config: &BackendConfig) -> Result<Arc<dyn Broker>, SendableError> {
    Err(not_compiled(config, DEFAULT_REDIS_PORT, "redis"))
}

#[allow(dead_code)]
fn not_compiled(config: &BackendConfig, default_port: u16, feature: &str) -> SendableError {
    RuntimeError::boxed(
        "broker.backend.not_compiled",
        format!(
            "Broker backend '{}' ({}:{}) needs the '{}' cargo feature",
            config.broker_backend,
            config.broker_host,
            config.port_or(default_port),
            feature
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrokerKind;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        backend: BackendConfig,
    }

    fn config(backend: &str) -> BackendConfig {
        BackendConfig {
            broker_backend: backend.into(),
            broker_host: "localhost".into(),
            broker_port: None,
            result_ttl_seconds: 60,
        }
    }

    #[test]
    fn in_process_backends_report_their_kind() {
        let durable = build_broker(&config("in-memory")).unwrap();
        assert_eq!(durable.kind(), BrokerKind::DurableQueue);
        let list = build_broker(&config("in-memory-list")).unwrap();
        assert_eq!(list.kind(), BrokerKind::ListStore);
    }

    #[test]
    fn unknown_backend_is_a_configuration_error() {
        let err = build_broker(&config("kafka")).err().unwrap();
        assert!(err.to_string().starts_with("broker.backend.unknown"));
    }

    #[test]
    fn result_ttl_must_be_at_least_one_second() {
        assert!(Cli::try_parse_from(["test", "--result-ttl-seconds", "0"]).is_err());
        let cli = Cli::try_parse_from(["test", "--result-ttl-seconds", "1"]).unwrap();
        assert_eq!(cli.backend.result_ttl(), Duration::from_secs(1));
    }
}
