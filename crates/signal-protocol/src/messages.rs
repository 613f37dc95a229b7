//! Wire messages exchanged over the signaling channel.
//!
//! Requests and responses travel as correlated pairs; room events are
//! pushed independently. All three enums are externally tagged with
//! kebab-case names so the wire format matches the event names the
//! JavaScript clients already use (`join-room`, `new-producer`, ...).

use crate::types::{
    ConsumerId, DtlsParameters, MediaCapabilities, MediaKind, MediaParams, PeerId, ProducerId,
    RoomId, TransportDescriptor, TransportDirection, TransportId,
};
use serde::{Deserialize, Serialize};

/// Requests a client sends to the broker.
///
/// Each request expects exactly one [`SignalResponse`] or
/// [`crate::errors::SignalError`] in reply. All state mutations are
/// all-or-nothing: a request that errors leaves no partial state behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", content = "data", rename_all = "kebab-case")]
pub enum SignalRequest {
    /// Enter a room, creating it if it does not exist yet.
    #[serde(rename = "join-room")]
    Join { room_id: RoomId, username: String },

    /// Create the send or recv transport for the joined room.
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },

    /// Finish the DTLS handshake for a previously created transport.
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Publish a track on the send transport.
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        media_params: MediaParams,
    },

    /// Subscribe to a remote producer. The new consumer starts paused.
    Consume {
        media_capabilities: MediaCapabilities,
        producer_id: ProducerId,
    },

    /// Unpause a consumer created by [`SignalRequest::Consume`].
    ResumeConsumer { consumer_id: ConsumerId },

    /// Snapshot of every other peer's producers in the room.
    GetProducers { room_id: RoomId },
}

/// Successful replies, one variant per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", content = "data", rename_all = "kebab-case")]
pub enum SignalResponse {
    /// Reply to `join-room`: the room router's receive capabilities.
    Joined { media_capabilities: MediaCapabilities },

    /// Reply to `create-transport`.
    TransportCreated { transport: TransportDescriptor },

    /// Reply to `connect-transport`.
    TransportConnected,

    /// Reply to `produce`.
    Produced { producer_id: ProducerId },

    /// Reply to `consume`.
    Consumed(ConsumerDescriptor),

    /// Reply to `resume-consumer`.
    ConsumerResumed,

    /// Reply to `get-producers`.
    Producers { producers: Vec<ProducerSummary> },
}

/// Everything a client needs to attach a new consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerDescriptor {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    /// Peer that owns the producer, resolved from live room membership.
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub media_params: MediaParams,
}

/// One remote producer as reported by the `get-producers` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSummary {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

/// Broadcasts pushed from the broker to room members.
///
/// Delivery is at-most-once per subscriber and ordered per connection.
/// Events about a peer's own actions are never echoed back to it, except
/// `consumer-closed`, which goes only to the consumer's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// Another peer entered the room.
    PeerJoined { peer_id: PeerId, username: String },

    /// A peer left the room; its producers are gone.
    PeerLeft { peer_id: PeerId },

    /// Another peer published a track.
    NewProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// One of the recipient's own consumers was closed server-side.
    ConsumerClosed { consumer_id: ConsumerId },
}
