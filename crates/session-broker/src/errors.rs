//! Broker error types.
//!
//! `BrokerError` is the internal vocabulary; it converts into the wire
//! [`SignalError`] at the connection boundary. Internal detail (engine
//! failures, channel breakage) is logged broker-side and replaced with a
//! generic client message so nothing about the engine leaks to peers.

use media_engine::EngineError;
use signal_protocol::{
    ConsumerId, ErrorKind, ProducerId, RoomId, SignalError, TransportDirection, TransportId,
};

/// Errors raised by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No room with this id is joined or addressable.
    #[error("room '{0}' not found")]
    RoomNotFound(RoomId),

    /// The transport id is unknown or not owned by the caller.
    #[error("transport {0} not found")]
    TransportNotFound(TransportId),

    /// The producer id resolves to no live producer in the room.
    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    /// The consumer id is unknown or not owned by the caller.
    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    /// The peer already holds a transport for this direction.
    #[error("{0} transport already exists")]
    TransportAlreadyExists(TransportDirection),

    /// The subscriber's capabilities cannot receive the producer.
    #[error("capabilities cannot consume producer {0}")]
    CapabilityMismatch(ProducerId),

    /// Operation issued outside its lifecycle window.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The room emptied and is being torn down; joining again creates a
    /// fresh room.
    #[error("room is closed")]
    RoomClosed,

    /// An engine operation failed.
    #[error("engine operation failed: {0}")]
    Engine(#[from] EngineError),

    /// The broker is draining and takes no new work.
    #[error("broker is shutting down")]
    ShuttingDown,

    /// Actor plumbing failure (channel closed, reply dropped).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Wire error kind for this failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_) => ErrorKind::RoomNotFound,
            Self::TransportNotFound(_) => ErrorKind::TransportNotFound,
            Self::ProducerNotFound(_) => ErrorKind::ProducerNotFound,
            Self::ConsumerNotFound(_) => ErrorKind::ConsumerNotFound,
            Self::TransportAlreadyExists(_) => ErrorKind::TransportAlreadyExists,
            Self::CapabilityMismatch(_) => ErrorKind::CapabilityMismatch,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::RoomClosed => ErrorKind::RoomClosed,
            Self::Engine(EngineError::ProducerMissing(_)) => ErrorKind::ProducerNotFound,
            Self::Engine(EngineError::ConsumeRejected(_)) => ErrorKind::CapabilityMismatch,
            Self::Engine(EngineError::ConnectRejected(..)) => ErrorKind::InvalidState,
            Self::Engine(_) => ErrorKind::EngineFailure,
            Self::ShuttingDown => ErrorKind::ChannelClosed,
            Self::Internal(_) => ErrorKind::EngineFailure,
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::TransportNotFound(_) => "transport_not_found",
            Self::ProducerNotFound(_) => "producer_not_found",
            Self::ConsumerNotFound(_) => "consumer_not_found",
            Self::TransportAlreadyExists(_) => "transport_already_exists",
            Self::CapabilityMismatch(_) => "capability_mismatch",
            Self::InvalidState(_) => "invalid_state",
            Self::RoomClosed => "room_closed",
            Self::Engine(_) => "engine",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to return to clients. Internal detail stays in logs.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Engine(EngineError::ProducerMissing(id)) => format!("producer {id} not found"),
            Self::Engine(EngineError::ConsumeRejected(id)) => {
                format!("capabilities cannot consume producer {id}")
            }
            Self::Engine(EngineError::ConnectRejected(id, _)) => {
                format!("transport {id} rejected connect")
            }
            Self::Engine(_) | Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<BrokerError> for SignalError {
    fn from(error: BrokerError) -> Self {
        SignalError::new(error.kind(), error.client_message())
    }
}
