use log::info;
use taskrelay_broker::backend::build_broker;
use taskrelay_models::errors::SendableError;
use taskrelay_utilities::startup;
use taskrelay_worker::{config::parse_config, demo, Worker};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    startup::startup("TaskRelay Worker")?;

    let config = parse_config()?;
    info!(
        "Worker for queue {} using processor {}",
        config.queue, config.processor
    );

    let broker = build_broker(&config.backend)?;
    let processor = demo::by_name(&config.processor)?;
    let worker = Worker::new(broker, processor, config.worker_settings());
    let handle = worker.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Stopping worker...");
            handle.stop();
        }
    });

    worker.run_spawned().await
}
