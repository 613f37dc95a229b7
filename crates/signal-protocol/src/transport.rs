//! Transport seam between the client session and the broker.
//!
//! The client never talks to broker actors directly; it goes through
//! [`SignalTransport`], which the broker implements in-process and a
//! network layer can implement over a socket.

use crate::errors::SignalError;
use crate::messages::{RoomEvent, SignalRequest, SignalResponse};
use crate::types::PeerId;
use tokio::sync::mpsc;

/// Ordered stream of room events for one connection.
pub type EventStream = mpsc::Receiver<RoomEvent>;

/// One signaling connection from a client's point of view.
///
/// Requests are serialized per connection: the next request is not
/// dispatched until the previous one has been answered.
#[async_trait::async_trait]
pub trait SignalTransport: Send + Sync {
    /// Identity assigned to this connection by the broker.
    fn peer_id(&self) -> PeerId;

    /// Send one request and wait for its reply.
    async fn request(&self, request: SignalRequest) -> Result<SignalResponse, SignalError>;

    /// Open the event stream for this connection.
    ///
    /// Calling `subscribe` again replaces the previous stream; events
    /// are delivered to at most one subscriber at a time. Events that
    /// arrive while no subscriber is attached are dropped.
    async fn subscribe(&self) -> EventStream;

    /// Tear the connection down. The peer leaves its room and further
    /// requests fail with [`crate::errors::ErrorKind::ChannelClosed`].
    async fn close(&self);
}
