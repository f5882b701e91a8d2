#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use taskrelay_broker::Broker;
use taskrelay_models::core::TaskResult;
use taskrelay_worker::{Worker, WorkerError, WorkerHandle, WorkerSettings, WorkerStatus};
use tokio::task::JoinHandle;

pub const POLL: Duration = Duration::from_millis(20);
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn settings(queue: &str) -> WorkerSettings {
    WorkerSettings::new(queue).with_poll_interval(POLL)
}

pub fn spawn(worker: Worker) -> (WorkerHandle, JoinHandle<Result<(), WorkerError>>) {
    let handle = worker.handle();
    let task = tokio::spawn(async move { worker.run().await });
    (handle, task)
}

pub async fn wait_for_result(broker: &dyn Broker, task_id: &str) -> TaskResult {
    tokio::time::timeout(PATIENCE, async {
        loop {
            if let Some(result) = broker.fetch_result(task_id).await.expect("fetch_result") {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("result never arrived")
}

pub async fn wait_until<F>(handle: &mut WorkerHandle, predicate: F) -> WorkerStatus
where
    F: FnMut(&WorkerStatus) -> bool,
{
    tokio::time::timeout(PATIENCE, handle.wait_until(predicate))
        .await
        .expect("worker never reached the expected status")
        .expect("worker dropped")
}

pub async fn stop(handle: &WorkerHandle, task: JoinHandle<Result<(), WorkerError>>) {
    handle.stop();
    tokio::time::timeout(PATIENCE, task)
        .await
        .expect("worker did not stop")
        .expect("worker panicked")
        .expect("worker failed");
}

pub fn shared<B: Broker>(broker: &B) -> Arc<dyn Broker>
where
    B: Clone,
{
    Arc::new(broker.clone())
}
