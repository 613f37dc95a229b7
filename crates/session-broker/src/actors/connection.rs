//! `ConnectionActor` - per-peer actor that serializes signaling requests.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one signaling connection (one peer identity)
//! - Runs the server-side peer state machine `connected → joined → left`
//! - Forwards requests to the joined room actor, one at a time, so a
//!   peer's own operations are causally ordered
//! - Owns the peer's [`EventSink`] and hands the room a clone on join
//!
//! # Lifecycle
//!
//! Created by [`crate::broker::SessionBroker::connect`]. Runs until the
//! peer closes, every [`crate::connection::PeerConnection`] handle is
//! dropped, or the broker cancels it. All three paths leave the joined
//! room first, so the peer-left cascade always runs.

use crate::errors::BrokerError;
use crate::events::EventSink;
use crate::metrics::{ActorType, BrokerMetrics, MailboxMonitor};

use super::messages::ConnectionMessage;
use super::registry::RegistryActorHandle;
use super::room::RoomActorHandle;

use crate::connection::PeerConnection;
use signal_protocol::{
    PeerId, RoomId, SignalError, SignalRequest, SignalResponse, TransportDirection,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Attempts at the join/registry race before giving up.
///
/// One retry is enough in principle (the stale epoch is evicted on the
/// second pass); the extra attempt covers a room that empties again
/// between the retry's create and join.
const JOIN_ATTEMPTS: usize = 3;

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Identity assigned to this connection.
    peer_id: PeerId,
    /// Message receiver.
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Cancellation token (child of the broker root).
    cancel_token: CancellationToken,
    /// Registry for room lookup and creation.
    registry: RegistryActorHandle,
    /// Event sink shared with the joined room.
    sink: EventSink,
    /// Room this peer has joined, if any.
    joined: Option<RoomActorHandle>,
    /// Shared metrics.
    metrics: Arc<BrokerMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns the peer-facing [`PeerConnection`] handle and the task
    /// join handle.
    pub fn spawn(
        peer_id: PeerId,
        registry: RegistryActorHandle,
        sink: EventSink,
        cancel_token: CancellationToken,
        metrics: Arc<BrokerMetrics>,
    ) -> (PeerConnection, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        metrics.connection_created();

        let actor = Self {
            peer_id,
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            sink: sink.clone(),
            joined: None,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, peer_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = PeerConnection::new(peer_id, sender, sink, cancel_token);

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "broker.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "broker.connection",
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "broker.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            // Every PeerConnection handle is gone; treat
                            // it as a disconnect.
                            debug!(
                                target: "broker.connection",
                                peer_id = %self.peer_id,
                                "ConnectionActor channel closed, disconnecting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.disconnect().await;
        self.sink.close().await;
        self.metrics.connection_closed();

        info!(
            target: "broker.connection",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Request {
                request,
                respond_to,
            } => {
                let result = self.handle_request(request).await;
                if let Err(error) = &result {
                    self.metrics.request_failed();
                    debug!(
                        target: "broker.connection",
                        peer_id = %self.peer_id,
                        error_kind = error.kind.as_str(),
                        "Request failed"
                    );
                }
                let _ = respond_to.send(result);
                false
            }

            ConnectionMessage::Close { respond_to } => {
                self.disconnect().await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    /// Dispatch one signaling request.
    async fn handle_request(
        &mut self,
        request: SignalRequest,
    ) -> Result<SignalResponse, SignalError> {
        match request {
            SignalRequest::Join { room_id, username } => self
                .handle_join(room_id, username)
                .await
                .map(|media_capabilities| SignalResponse::Joined { media_capabilities })
                .map_err(Into::into),

            SignalRequest::CreateTransport { room_id, direction } => self
                .handle_create_transport(&room_id, direction)
                .await
                .map(|transport| SignalResponse::TransportCreated { transport })
                .map_err(Into::into),

            SignalRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room = self.joined_room()?;
                room.connect_transport(self.peer_id, transport_id, dtls_parameters)
                    .await
                    .map(|()| SignalResponse::TransportConnected)
                    .map_err(Into::into)
            }

            SignalRequest::Produce {
                transport_id,
                kind,
                media_params,
            } => {
                let room = self.joined_room()?;
                room.produce(self.peer_id, transport_id, kind, media_params)
                    .await
                    .map(|producer_id| SignalResponse::Produced { producer_id })
                    .map_err(Into::into)
            }

            SignalRequest::Consume {
                media_capabilities,
                producer_id,
            } => {
                let room = self.joined_room()?;
                room.consume(self.peer_id, producer_id, media_capabilities)
                    .await
                    .map(SignalResponse::Consumed)
                    .map_err(Into::into)
            }

            SignalRequest::ResumeConsumer { consumer_id } => {
                let room = self.joined_room()?;
                room.resume_consumer(self.peer_id, consumer_id)
                    .await
                    .map(|()| SignalResponse::ConsumerResumed)
                    .map_err(Into::into)
            }

            SignalRequest::GetProducers { room_id } => {
                let room = self.joined_room()?;
                if room.room_id() != &room_id {
                    return Err(BrokerError::RoomNotFound(room_id).into());
                }
                room.get_producers(self.peer_id)
                    .await
                    .map(|producers| SignalResponse::Producers { producers })
                    .map_err(Into::into)
            }
        }
    }

    /// Join a room, creating it if absent.
    ///
    /// A join can reach a room actor in the window after its last peer
    /// left; that answers `RoomClosed` and we retry through the registry
    /// quoting the stale epoch, which guarantees a fresh room.
    async fn handle_join(
        &mut self,
        room_id: RoomId,
        username: String,
    ) -> Result<signal_protocol::MediaCapabilities, BrokerError> {
        if self.joined.is_some() {
            return Err(BrokerError::InvalidState("already joined".to_string()));
        }

        let mut stale_epoch = None;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self
                .registry
                .get_or_create_room(room_id.clone(), stale_epoch)
                .await?;

            match room
                .join(self.peer_id, username.clone(), self.sink.clone())
                .await
            {
                Ok(capabilities) => {
                    self.joined = Some(room);
                    return Ok(capabilities);
                }
                Err(BrokerError::RoomClosed) => {
                    warn!(
                        target: "broker.connection",
                        peer_id = %self.peer_id,
                        room_id = %room_id,
                        epoch = room.epoch(),
                        "Joined a room that just emptied, retrying"
                    );
                    stale_epoch = Some(room.epoch());
                }
                Err(other) => return Err(other),
            }
        }

        Err(BrokerError::RoomClosed)
    }

    async fn handle_create_transport(
        &mut self,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<signal_protocol::TransportDescriptor, BrokerError> {
        let room = self.joined_room()?;
        if room.room_id() != room_id {
            return Err(BrokerError::RoomNotFound(room_id.clone()));
        }
        room.create_transport(self.peer_id, direction).await
    }

    /// The joined room, or the invalid-state rejection every
    /// post-join operation shares.
    fn joined_room(&self) -> Result<&RoomActorHandle, BrokerError> {
        self.joined
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidState("join a room first".to_string()))
    }

    /// Leave the joined room, if any. Idempotent.
    async fn disconnect(&mut self) {
        if let Some(room) = self.joined.take() {
            // An error only means the room is already gone.
            let _ = room.leave(self.peer_id).await;
            debug!(
                target: "broker.connection",
                peer_id = %self.peer_id,
                room_id = %room.room_id(),
                "Peer disconnected from room"
            );
        }
    }
}
