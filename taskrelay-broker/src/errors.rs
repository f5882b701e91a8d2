use taskrelay_comm::CodecError;
use thiserror::Error;

use crate::types::DeliveryTag;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("delivery {0} is already settled")]
    AlreadySettled(DeliveryTag),
    #[error("prefetch limit reached: delivery {0} is still unsettled")]
    PrefetchExceeded(DeliveryTag),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Transport faults. The reconnection supervisor retries these forever.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::ConnectionLost(_)
        )
    }

    /// Misuse of the delivery protocol. These indicate a bug in the caller.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BrokerError::AlreadySettled(_)
                | BrokerError::PrefetchExceeded(_)
                | BrokerError::NotSupported(_)
        )
    }
}
