//! Connection lifecycle around the worker loop: connect, run a session,
//! reconnect on connection loss, and stop on request.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{error, info, warn};
use taskrelay_models::errors::SendableError;
use tokio::sync::{watch, Notify};

use crate::{
    errors::WorkerError,
    worker::{SessionEnd, Worker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Idle,
    AwaitDelivery,
    Processing,
    Publishing,
    Acking,
    Stopped,
}

/// Snapshot of a worker, published after every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStatus {
    pub connection: ConnectionState,
    pub phase: LoopPhase,
    /// Connection attempts refused by the broker.
    pub connect_failures: u64,
    /// Sessions successfully established.
    pub sessions: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub(crate) fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Cloneable control surface of a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    stop: Arc<StopSignal>,
    status: watch::Receiver<WorkerStatus>,
}

impl WorkerHandle {
    pub(crate) fn new(stop: Arc<StopSignal>, status: watch::Receiver<WorkerStatus>) -> Self {
        Self { stop, status }
    }

    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_triggered()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Wait until the published status satisfies `predicate`. Returns the
    /// matching status, or `None` once the worker has been dropped.
    pub async fn wait_until<F>(&mut self, predicate: F) -> Option<WorkerStatus>
    where
        F: FnMut(&WorkerStatus) -> bool,
    {
        self.status.wait_for(predicate).await.ok().map(|status| *status)
    }
}

impl Worker {
    /// Run until stopped. Broker outages are ridden out by reconnecting at
    /// the configured interval; only protocol violations and non-connection
    /// broker failures end the run with an error.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!("Worker starting on queue {}", self.queue_name());
        let outcome = self.supervise().await;
        self.update_status(|status| {
            status.connection = ConnectionState::Disconnected;
            status.phase = LoopPhase::Stopped;
        });
        match &outcome {
            Ok(()) => info!("Worker on {} stopped", self.queue_name()),
            Err(err) => error!("Worker on {} terminated: {}", self.queue_name(), err),
        }
        outcome
    }

    /// Run on a spawned task and hand back the outcome boxed, the shape a
    /// binary returns from `main`. A panicked run task becomes an error too.
    pub async fn run_spawned(self) -> Result<(), SendableError> {
        let worker_task = tokio::spawn(async move { self.run().await });
        match worker_task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Box::new(err) as SendableError),
            Err(err) => {
                error!("Worker task join error: {}", err);
                Err(Box::new(err) as SendableError)
            }
        }
    }

    async fn supervise(&self) -> Result<(), WorkerError> {
        while !self.stop.is_triggered() {
            self.update_status(|status| status.connection = ConnectionState::Connecting);

            let mut connection = match self.broker.connect(self.queue_name()).await {
                Ok(connection) => connection,
                Err(err) if err.is_connection_fault() => {
                    self.update_status(|status| {
                        status.connection = ConnectionState::Disconnected;
                        status.connect_failures += 1;
                    });
                    warn!(
                        "Could not connect to broker: {}. Retrying in {:?}",
                        err,
                        self.settings.reconnect_backoff.interval()
                    );
                    self.pause_before_reconnect().await;
                    continue;
                }
                Err(err) => return Err(WorkerError::classify("connect", err)),
            };

            self.update_status(|status| {
                status.connection = ConnectionState::Connected;
                status.sessions += 1;
            });
            info!(
                "Connected; waiting for tasks on {}",
                self.settings.queue_name
            );

            let session = self.run_session(connection.as_mut()).await;
            connection.close().await;
            drop(connection);
            self.update_status(|status| status.connection = ConnectionState::Disconnected);

            match session? {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(err) => {
                    warn!("Connection lost: {}. Reconnecting", err);
                }
            }
        }
        Ok(())
    }

    async fn pause_before_reconnect(&self) {
        tokio::select! {
            _ = self.settings.reconnect_backoff.wait() => {}
            _ = self.stop.triggered() => {}
        }
    }
}
