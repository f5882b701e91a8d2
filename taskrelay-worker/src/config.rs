use std::time::Duration;

use clap::Parser;
use taskrelay_broker::backend::BackendConfig;
use taskrelay_models::{core::DEFAULT_QUEUE, errors::SendableError};
use taskrelay_utilities::retry::FixedBackoff;

use crate::{demo::UPPERCASE_TEXT, WorkerSettings};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub backend: BackendConfig,

    #[arg(long, env = "TASKRELAY_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    #[arg(long, env = "TASKRELAY_RECONNECT_INTERVAL_SECONDS", default_value_t = 5)]
    pub reconnect_interval_seconds: u64,

    #[arg(long, env = "TASKRELAY_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// uppercase-text | double-value
    #[arg(long, env = "TASKRELAY_PROCESSOR", default_value = UPPERCASE_TEXT)]
    pub processor: String,
}

impl Config {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::new(self.queue.clone())
            .with_reconnect_backoff(FixedBackoff::new(Duration::from_secs(
                self.reconnect_interval_seconds,
            )))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
    }
}

pub fn parse_config() -> Result<Config, SendableError> {
    Ok(Config::try_parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "taskrelay-worker",
            "--broker-backend",
            "in-memory-list",
            "--queue",
            "math_queue",
            "--poll-interval-ms",
            "250",
            "--processor",
            "double-value",
        ])
        .unwrap();

        assert_eq!(config.backend.broker_backend, "in-memory-list");
        let settings = config.worker_settings();
        assert_eq!(settings.queue_name, "math_queue");
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.reconnect_backoff.interval(), Duration::from_secs(5));
        assert_eq!(config.processor, "double-value");
    }
}
