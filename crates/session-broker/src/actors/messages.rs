//! Message types exchanged between broker actors.

use crate::errors::BrokerError;
use crate::events::EventSink;

use super::room::RoomActorHandle;

use signal_protocol::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, MediaCapabilities, MediaKind, MediaParams,
    PeerId, ProducerId, ProducerSummary, RoomId, SignalError, SignalRequest, SignalResponse,
    TransportDescriptor, TransportDirection, TransportId,
};
use tokio::sync::oneshot;

/// Messages handled by the registry actor.
pub enum RegistryMessage {
    /// Look up the room for `room_id`, creating it if absent.
    GetOrCreateRoom {
        room_id: RoomId,
        /// Epoch of a room the caller just saw refuse with `RoomClosed`.
        /// An entry still carrying this epoch is removed before lookup,
        /// so the retry is guaranteed a fresh room.
        stale_epoch: Option<u64>,
        respond_to: oneshot::Sender<Result<RoomActorHandle, BrokerError>>,
    },

    /// A room's last peer left; its router is already closed.
    ///
    /// Ignored if the registry entry for `room_id` carries a different
    /// epoch (a fresh room has already replaced the sender).
    RoomEmptied { room_id: RoomId, epoch: u64 },

    /// Snapshot of registry state.
    GetStatus {
        respond_to: oneshot::Sender<BrokerStatus>,
    },

    /// Stop accepting rooms and cancel the actor tree.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Messages handled by a room actor. Every request variant carries the
/// issuing peer so ownership checks happen inside the room.
pub enum RoomMessage {
    Join {
        peer_id: PeerId,
        username: String,
        sink: EventSink,
        respond_to: oneshot::Sender<Result<MediaCapabilities, BrokerError>>,
    },

    CreateTransport {
        peer_id: PeerId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportDescriptor, BrokerError>>,
    },

    ConnectTransport {
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    Produce {
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        media_params: MediaParams,
        respond_to: oneshot::Sender<Result<ProducerId, BrokerError>>,
    },

    Consume {
        peer_id: PeerId,
        producer_id: ProducerId,
        media_capabilities: MediaCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerDescriptor, BrokerError>>,
    },

    ResumeConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    GetProducers {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<Vec<ProducerSummary>, BrokerError>>,
    },

    /// Remove the peer and everything it owns. Idempotent.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<()>,
    },
}

/// Messages handled by a connection actor.
pub enum ConnectionMessage {
    /// One signaling request from the peer.
    Request {
        request: SignalRequest,
        respond_to: oneshot::Sender<Result<SignalResponse, SignalError>>,
    },

    /// Explicit disconnect. The peer leaves its room before the ack.
    Close { respond_to: oneshot::Sender<()> },
}

/// Snapshot of broker state.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    /// Whether new rooms may still be created.
    pub accepting_new: bool,
    /// Number of engine workers in the pool.
    pub workers: usize,
    /// Currently live rooms.
    pub rooms: Vec<RoomInfo>,
}

/// One live room as reported by [`BrokerStatus`].
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: RoomId,
    /// Distinguishes reincarnations of the same room id.
    pub epoch: u64,
    /// Pool index of the worker hosting the room's router.
    pub worker_index: usize,
    /// Creation timestamp (UTC seconds).
    pub created_at: i64,
}
