use taskrelay_broker::BrokerError;
use thiserror::Error;

/// Conditions that end a worker run. Connection faults never surface here:
/// the supervisor absorbs them and reconnects.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("delivery protocol violated: {0}")]
    Protocol(#[source] BrokerError),

    #[error("broker operation '{context}' failed: {source}")]
    Broker {
        context: &'static str,
        #[source]
        source: BrokerError,
    },
}

impl WorkerError {
    pub(crate) fn classify(context: &'static str, err: BrokerError) -> Self {
        if err.is_protocol_violation() {
            WorkerError::Protocol(err)
        } else {
            WorkerError::Broker {
                context,
                source: err,
            }
        }
    }
}
