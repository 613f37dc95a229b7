//! Engine-side failures.

use signal_protocol::{ConsumerId, ProducerId, TransportId};

/// Errors raised by engine operations.
///
/// The broker translates these into wire errors; clients never see the
/// engine's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The worker hosting the router has died.
    #[error("engine worker is dead")]
    WorkerDead,

    /// The router was closed, usually because its room emptied.
    #[error("router is closed")]
    RouterClosed,

    /// The transport was closed or its handshake failed earlier.
    #[error("transport {0} is closed")]
    TransportClosed(TransportId),

    /// The DTLS handshake could not be completed.
    #[error("transport {0} rejected connect: {1}")]
    ConnectRejected(TransportId, String),

    /// No producer with this id exists in the router.
    #[error("producer {0} not found in router")]
    ProducerMissing(ProducerId),

    /// The subscriber's capabilities cannot receive this producer.
    #[error("consume of producer {0} rejected: incompatible capabilities")]
    ConsumeRejected(ProducerId),

    /// Operation on a consumer that was already closed.
    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),
}
