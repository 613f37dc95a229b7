//! Capability traits the broker drives the engine through.

use crate::errors::EngineError;
use signal_protocol::{
    CodecCapability, ConsumerId, DtlsParameters, MediaCapabilities, MediaKind, MediaParams,
    ProducerId, TransportDescriptor, TransportDirection, TransportId,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Settings applied when a worker is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Lowest RTC port the worker may bind.
    pub rtc_min_port: u16,
    /// Highest RTC port the worker may bind (inclusive).
    pub rtc_max_port: u16,
}

/// Settings applied when a transport is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Local address the transport listens on.
    pub listen_ip: String,
    /// Address advertised in ICE candidates.
    pub announced_ip: String,
    /// Initial outgoing bitrate estimate in bits per second.
    pub initial_bitrate: u32,
    /// Cap on the remote side's sending rate in bits per second.
    pub max_incoming_bitrate: u32,
}

/// Entry point: creates workers.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError>;
}

/// One engine compute unit. Hosts routers.
#[async_trait::async_trait]
pub trait EngineWorker: Send + Sync {
    /// Create a router with the given receive codec set.
    async fn create_router(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<Arc<dyn EngineRouter>, EngineError>;

    /// Token cancelled when the worker dies. An engine worker death is
    /// unrecoverable for the rooms it hosts.
    fn death_watch(&self) -> CancellationToken;
}

/// Per-room media hub. All of a room's transports share one router.
#[async_trait::async_trait]
pub trait EngineRouter: std::fmt::Debug + Send + Sync {
    /// Receive capabilities clients must load their device with.
    fn capabilities(&self) -> MediaCapabilities;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Whether a subscriber with `capabilities` could receive this
    /// producer. `false` for unknown producers.
    async fn can_consume(
        &self,
        producer_id: ProducerId,
        capabilities: &MediaCapabilities,
    ) -> bool;

    /// Close the router and cascade-close everything it hosts.
    async fn close(&self);
}

/// One ICE/DTLS association with a peer.
#[async_trait::async_trait]
pub trait EngineTransport: std::fmt::Debug + Send + Sync {
    fn id(&self) -> TransportId;

    fn direction(&self) -> TransportDirection;

    /// Connection parameters the remote side dials with.
    fn descriptor(&self) -> TransportDescriptor;

    /// Complete the DTLS handshake with the remote side's parameters.
    async fn connect(&self, dtls_parameters: &DtlsParameters) -> Result<(), EngineError>;

    /// Start forwarding a track published by the remote side.
    async fn produce(
        &self,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    /// Start delivering `producer_id` to the remote side. The consumer
    /// starts paused; media flows after [`EngineConsumer::resume`].
    ///
    /// Allowed before [`connect`](Self::connect): clients complete the
    /// recv handshake lazily, on their first consume.
    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &MediaCapabilities,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Close the transport and cascade-close its producers and consumers.
    async fn close(&self);
}

/// A track being received from a peer.
#[async_trait::async_trait]
pub trait EngineProducer: std::fmt::Debug + Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self);
}

/// A track being delivered to a peer.
#[async_trait::async_trait]
pub trait EngineConsumer: std::fmt::Debug + Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Parameters the subscribing client attaches its decoder with.
    fn media_params(&self) -> MediaParams;

    fn paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}
