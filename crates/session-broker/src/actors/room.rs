//! `RoomActor` - per-room actor that owns all room state.
//!
//! Each `RoomActor`:
//! - Owns one engine router and every transport, producer and consumer
//!   created within the room
//! - Serializes all membership and media mutations through its mailbox
//! - Fans lifecycle events out to member event sinks, at most once each
//!
//! # Emptying
//!
//! A room never removes itself. When its last peer leaves it closes the
//! router, reports `RoomEmptied { room_id, epoch }` to the registry and
//! rejects every further request with `RoomClosed` until the registry
//! cancels it. A joiner that hits the `RoomClosed` window retries through
//! the registry, quoting the stale epoch.

use crate::errors::BrokerError;
use crate::events::EventSink;
use crate::metrics::{ActorType, BrokerMetrics, MailboxMonitor};

use super::messages::{RegistryMessage, RoomMessage};

use media_engine::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, TransportOptions,
};
use signal_protocol::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, MediaCapabilities, MediaKind, MediaParams,
    PeerId, ProducerId, ProducerSummary, RoomEvent, RoomId, TransportDescriptor,
    TransportDirection, TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
///
/// Channel failures surface as [`BrokerError::RoomClosed`]: the actor is
/// gone, which to callers is indistinguishable from a room that emptied.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    epoch: u64,
}

impl RoomActorHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Get the room epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Add a peer to the room.
    ///
    /// Returns the router's receive capabilities and broadcasts
    /// `peer-joined` to the other members.
    pub async fn join(
        &self,
        peer_id: PeerId,
        username: String,
        sink: EventSink,
    ) -> Result<MediaCapabilities, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                peer_id,
                username,
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Create the peer's transport for one direction.
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Finish the DTLS handshake for one of the peer's transports.
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Publish a track on the peer's connected send transport.
    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<ProducerId, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                media_params,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Subscribe the peer to a producer. The new consumer starts paused.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        media_capabilities: MediaCapabilities,
    ) -> Result<ConsumerDescriptor, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Consume {
                peer_id,
                producer_id,
                media_capabilities,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Unpause one of the peer's consumers. Idempotent.
    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Snapshot of every other member's producers.
    pub async fn get_producers(&self, peer_id: PeerId) -> Result<Vec<ProducerSummary>, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::GetProducers {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Remove the peer and everything it owns. Idempotent; an error only
    /// means the room is already gone, which callers may ignore.
    pub async fn leave(&self, peer_id: PeerId) -> Result<(), BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;

        rx.await.map_err(|_| BrokerError::RoomClosed)
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One transport owned by a peer.
struct TransportSeat {
    transport: Arc<dyn EngineTransport>,
    /// Set after a successful DTLS connect.
    connected: bool,
}

/// One producer owned by a peer.
struct ProducerSeat {
    producer: Arc<dyn EngineProducer>,
    kind: MediaKind,
}

/// One consumer owned by a peer.
struct ConsumerSeat {
    consumer: Arc<dyn EngineConsumer>,
    /// Source producer, used for the cascade when its owner leaves.
    producer_id: ProducerId,
}

/// Per-peer state within a room.
struct PeerSession {
    username: String,
    sink: EventSink,
    send_transport: Option<TransportSeat>,
    recv_transport: Option<TransportSeat>,
    producers: HashMap<ProducerId, ProducerSeat>,
    consumers: HashMap<ConsumerId, ConsumerSeat>,
}

impl PeerSession {
    fn new(username: String, sink: EventSink) -> Self {
        Self {
            username,
            sink,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn transport_seat_mut(&mut self, transport_id: TransportId) -> Option<&mut TransportSeat> {
        self.send_transport
            .as_mut()
            .filter(|seat| seat.transport.id() == transport_id)
            .or_else(|| {
                self.recv_transport
                    .as_mut()
                    .filter(|seat| seat.transport.id() == transport_id)
            })
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    /// Room ID.
    room_id: RoomId,
    /// Distinguishes this room from later rooms with the same id.
    epoch: u64,
    /// Message receiver.
    receiver: mpsc::Receiver<RoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Engine router hosting the room's media.
    router: Arc<dyn EngineRouter>,
    /// Options for every transport created in this room.
    transport_options: TransportOptions,
    /// Member state by peer.
    peers: HashMap<PeerId, PeerSession>,
    /// Set once the last peer has left and the router is closed.
    emptied: bool,
    /// Channel back to the registry for the emptied notice.
    registry: mpsc::Sender<RegistryMessage>,
    /// Shared metrics.
    metrics: Arc<BrokerMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        epoch: u64,
        router: Arc<dyn EngineRouter>,
        transport_options: TransportOptions,
        registry: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<BrokerMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            epoch,
            receiver,
            cancel_token: cancel_token.clone(),
            router,
            transport_options,
            peers: HashMap::new(),
            emptied: false,
            registry,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            epoch,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "broker.room", fields(room_id = %self.room_id, epoch = self.epoch))]
    async fn run(mut self) {
        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "broker.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "broker.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "broker.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                username,
                sink,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, username, sink).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(peer_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(peer_id, transport_id, &dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                media_params,
                respond_to,
            } => {
                let result = self
                    .handle_produce(peer_id, transport_id, kind, media_params)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                peer_id,
                producer_id,
                media_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(peer_id, producer_id, &media_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_resume_consumer(peer_id, consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetProducers {
                peer_id,
                respond_to,
            } => {
                let result = self.handle_get_producers(peer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                self.handle_leave(peer_id).await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_join(
        &mut self,
        peer_id: PeerId,
        username: String,
        sink: EventSink,
    ) -> Result<MediaCapabilities, BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        if self.peers.contains_key(&peer_id) {
            return Err(BrokerError::InvalidState("peer already joined".to_string()));
        }

        self.peers
            .insert(peer_id, PeerSession::new(username.clone(), sink));
        self.metrics.peer_joined();

        info!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            username = %username,
            total_peers = self.peers.len(),
            "Peer joined room"
        );

        self.broadcast(RoomEvent::PeerJoined { peer_id, username }, Some(peer_id))
            .await;

        Ok(self.router.capabilities())
    }

    async fn handle_create_transport(
        &mut self,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        let session = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| BrokerError::InvalidState("peer not in room".to_string()))?;

        let occupied = match direction {
            TransportDirection::Send => session.send_transport.is_some(),
            TransportDirection::Recv => session.recv_transport.is_some(),
        };
        if occupied {
            return Err(BrokerError::TransportAlreadyExists(direction));
        }

        let transport = self
            .router
            .create_transport(direction, &self.transport_options)
            .await?;
        let descriptor = transport.descriptor();

        if let Some(session) = self.peers.get_mut(&peer_id) {
            let seat = TransportSeat {
                transport,
                connected: false,
            };
            match direction {
                TransportDirection::Send => session.send_transport = Some(seat),
                TransportDirection::Recv => session.recv_transport = Some(seat),
            }
        }

        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %descriptor.id,
            direction = direction.as_str(),
            "Transport created"
        );

        Ok(descriptor)
    }

    async fn handle_connect_transport(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        let session = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| BrokerError::InvalidState("peer not in room".to_string()))?;

        let transport = {
            let seat = session
                .transport_seat_mut(transport_id)
                .ok_or(BrokerError::TransportNotFound(transport_id))?;
            if seat.connected {
                return Err(BrokerError::InvalidState(
                    "transport already connected".to_string(),
                ));
            }
            Arc::clone(&seat.transport)
        };

        transport.connect(dtls_parameters).await?;

        if let Some(seat) = self
            .peers
            .get_mut(&peer_id)
            .and_then(|session| session.transport_seat_mut(transport_id))
        {
            seat.connected = true;
        }

        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            "Transport connected"
        );

        Ok(())
    }

    async fn handle_produce(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<ProducerId, BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        let session = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| BrokerError::InvalidState("peer not in room".to_string()))?;

        let seat = session
            .send_transport
            .as_ref()
            .filter(|seat| seat.transport.id() == transport_id)
            .ok_or_else(|| {
                let is_recv = session
                    .recv_transport
                    .as_ref()
                    .is_some_and(|seat| seat.transport.id() == transport_id);
                if is_recv {
                    BrokerError::InvalidState("produce requires the send transport".to_string())
                } else {
                    BrokerError::TransportNotFound(transport_id)
                }
            })?;
        if !seat.connected {
            return Err(BrokerError::InvalidState(
                "send transport not connected".to_string(),
            ));
        }
        let transport = Arc::clone(&seat.transport);

        let producer = transport.produce(kind, media_params).await?;
        let producer_id = producer.id();

        if let Some(session) = self.peers.get_mut(&peer_id) {
            session
                .producers
                .insert(producer_id, ProducerSeat { producer, kind });
        }
        self.metrics.producer_created();

        info!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        self.broadcast(
            RoomEvent::NewProducer {
                peer_id,
                producer_id,
                kind,
            },
            Some(peer_id),
        )
        .await;

        Ok(producer_id)
    }

    async fn handle_consume(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
        media_capabilities: &MediaCapabilities,
    ) -> Result<ConsumerDescriptor, BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        if !self.peers.contains_key(&peer_id) {
            return Err(BrokerError::InvalidState("peer not in room".to_string()));
        }

        // The room membership map is the source of truth for who owns
        // the producer; the engine only knows ids.
        let source_peer = self
            .peers
            .iter()
            .find(|(_, session)| session.producers.contains_key(&producer_id))
            .map(|(id, _)| *id)
            .ok_or(BrokerError::ProducerNotFound(producer_id))?;

        let transport = {
            let session = self
                .peers
                .get(&peer_id)
                .ok_or_else(|| BrokerError::InvalidState("peer not in room".to_string()))?;
            let seat = session
                .recv_transport
                .as_ref()
                .ok_or_else(|| BrokerError::InvalidState("no receive transport".to_string()))?;
            Arc::clone(&seat.transport)
        };

        if !self.router.can_consume(producer_id, media_capabilities).await {
            return Err(BrokerError::CapabilityMismatch(producer_id));
        }

        let consumer = transport.consume(producer_id, media_capabilities).await?;
        let consumer_id = consumer.id();
        let kind = consumer.kind();
        let media_params = consumer.media_params();

        if let Some(session) = self.peers.get_mut(&peer_id) {
            session.consumers.insert(
                consumer_id,
                ConsumerSeat {
                    consumer,
                    producer_id,
                },
            );
        }
        self.metrics.consumer_created();

        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            source_peer = %source_peer,
            "Consumer created"
        );

        Ok(ConsumerDescriptor {
            consumer_id,
            producer_id,
            peer_id: source_peer,
            kind,
            media_params,
        })
    }

    async fn handle_resume_consumer(
        &mut self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        let session = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| BrokerError::InvalidState("peer not in room".to_string()))?;

        // Only the owner can resume; anything else is not found.
        let seat = session
            .consumers
            .get(&consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;

        if !seat.consumer.paused() {
            return Ok(());
        }

        let consumer = Arc::clone(&seat.consumer);
        consumer.resume().await?;

        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );

        Ok(())
    }

    fn handle_get_producers(&self, peer_id: PeerId) -> Result<Vec<ProducerSummary>, BrokerError> {
        if self.emptied {
            return Err(BrokerError::RoomClosed);
        }
        if !self.peers.contains_key(&peer_id) {
            return Err(BrokerError::InvalidState("peer not in room".to_string()));
        }

        Ok(self
            .peers
            .iter()
            .filter(|(id, _)| **id != peer_id)
            .flat_map(|(owner, session)| {
                session
                    .producers
                    .iter()
                    .map(move |(producer_id, seat)| ProducerSummary {
                        peer_id: *owner,
                        producer_id: *producer_id,
                        kind: seat.kind,
                    })
            })
            .collect())
    }

    /// Remove a peer, cascading over everything it owns.
    ///
    /// Ordering is part of the protocol: affected subscribers see their
    /// `consumer-closed` events before anyone sees `peer-left`, so no
    /// recipient ever observes the peer gone while holding an open
    /// consumer record of it.
    async fn handle_leave(&mut self, peer_id: PeerId) {
        let Some(mut session) = self.peers.remove(&peer_id) else {
            return;
        };

        if let Some(seat) = session.send_transport.take() {
            seat.transport.close().await;
        }
        if let Some(seat) = session.recv_transport.take() {
            seat.transport.close().await;
        }

        let dead_producers: HashSet<ProducerId> = session.producers.keys().copied().collect();

        for other in self.peers.values_mut() {
            let doomed: Vec<ConsumerId> = other
                .consumers
                .iter()
                .filter(|(_, seat)| dead_producers.contains(&seat.producer_id))
                .map(|(id, _)| *id)
                .collect();
            for consumer_id in doomed {
                if let Some(seat) = other.consumers.remove(&consumer_id) {
                    seat.consumer.close().await;
                    other
                        .sink
                        .deliver(RoomEvent::ConsumerClosed { consumer_id })
                        .await;
                }
            }
        }

        info!(
            target: "broker.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            username = %session.username,
            remaining_peers = self.peers.len(),
            "Peer left room"
        );

        self.broadcast(RoomEvent::PeerLeft { peer_id }, None).await;

        if self.peers.is_empty() && !self.emptied {
            self.emptied = true;
            self.router.close().await;

            // Fire-and-forget: if the registry is full or gone it is
            // shutting down and will cancel this actor anyway.
            let _ = self.registry.try_send(RegistryMessage::RoomEmptied {
                room_id: self.room_id.clone(),
                epoch: self.epoch,
            });

            info!(
                target: "broker.room",
                room_id = %self.room_id,
                epoch = self.epoch,
                "Room emptied, router closed"
            );
        }
    }

    /// Push an event to every member except `except`.
    async fn broadcast(&self, event: RoomEvent, except: Option<PeerId>) {
        for (peer_id, session) in &self.peers {
            if Some(*peer_id) == except {
                continue;
            }
            session.sink.deliver(event.clone()).await;
        }
    }

    /// Tear down on cancellation.
    async fn graceful_shutdown(&mut self) {
        if !self.emptied {
            self.router.close().await;
        }
        self.peers.clear();

        debug!(
            target: "broker.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            "Room shut down"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::default_codecs;
    use media_engine::{LocalEngine, MediaEngine, WorkerSettings};
    use signal_protocol::{DtlsFingerprint, DtlsRole, EncodingParams};

    const SETTINGS: WorkerSettings = WorkerSettings {
        rtc_min_port: 40_000,
        rtc_max_port: 40_099,
    };

    fn test_options() -> TransportOptions {
        TransportOptions {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            initial_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
        }
    }

    fn full_caps() -> MediaCapabilities {
        MediaCapabilities {
            codecs: default_codecs(),
        }
    }

    fn audio_params() -> MediaParams {
        MediaParams {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            encodings: Vec::new(),
        }
    }

    fn video_params() -> MediaParams {
        MediaParams {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            encodings: vec![EncodingParams {
                max_bitrate: Some(500_000),
            }],
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        }
    }

    async fn spawn_room() -> (
        RoomActorHandle,
        mpsc::Receiver<RegistryMessage>,
        Arc<BrokerMetrics>,
    ) {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&SETTINGS)
            .await
            .expect("Worker should be created");
        let router = worker
            .create_router(&default_codecs())
            .await
            .expect("Router should be created");

        let (registry_tx, registry_rx) = mpsc::channel(16);
        let metrics = BrokerMetrics::new();
        let (handle, _task) = RoomActor::spawn(
            RoomId::from("room-1"),
            1,
            router,
            test_options(),
            registry_tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, registry_rx, metrics)
    }

    /// Join a peer with a live event subscription.
    async fn join_peer(
        room: &RoomActorHandle,
        metrics: &Arc<BrokerMetrics>,
        username: &str,
    ) -> (PeerId, mpsc::Receiver<RoomEvent>) {
        let peer_id = PeerId::new();
        let sink = EventSink::new(peer_id, Arc::clone(metrics));
        let events = sink.subscribe().await;
        room.join(peer_id, username.to_string(), sink)
            .await
            .expect("Join should succeed");
        (peer_id, events)
    }

    /// Create and connect both transports, returning the send transport id.
    async fn set_up_media(room: &RoomActorHandle, peer_id: PeerId) -> (TransportId, TransportId) {
        let send = room
            .create_transport(peer_id, TransportDirection::Send)
            .await
            .expect("Send transport should be created");
        let recv = room
            .create_transport(peer_id, TransportDirection::Recv)
            .await
            .expect("Recv transport should be created");
        room.connect_transport(peer_id, send.id, dtls())
            .await
            .expect("Send transport should connect");
        room.connect_transport(peer_id, recv.id, dtls())
            .await
            .expect("Recv transport should connect");
        (send.id, recv.id)
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_existing_members_only() {
        let (room, _registry, metrics) = spawn_room().await;

        let (_first, mut first_events) = join_peer(&room, &metrics, "alice").await;
        let (second, _second_events) = join_peer(&room, &metrics, "bob").await;

        let event = first_events.recv().await.expect("Event should arrive");
        match event {
            RoomEvent::PeerJoined { peer_id, username } => {
                assert_eq!(peer_id, second);
                assert_eq!(username, "bob");
            }
            other => panic!("Expected peer-joined, got {other:?}"),
        }

        // The joiner does not see its own event.
        assert!(first_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_transport_direction_rejected() {
        let (room, _registry, metrics) = spawn_room().await;
        let (peer, _events) = join_peer(&room, &metrics, "alice").await;

        room.create_transport(peer, TransportDirection::Send)
            .await
            .expect("First send transport should be created");

        let result = room.create_transport(peer, TransportDirection::Send).await;
        assert!(matches!(
            result,
            Err(BrokerError::TransportAlreadyExists(TransportDirection::Send))
        ));

        // The other direction is still free.
        room.create_transport(peer, TransportDirection::Recv)
            .await
            .expect("Recv transport should be created");
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let (room, _registry, metrics) = spawn_room().await;
        let (peer, _events) = join_peer(&room, &metrics, "alice").await;

        let send = room
            .create_transport(peer, TransportDirection::Send)
            .await
            .expect("Send transport should be created");

        let result = room
            .produce(peer, send.id, MediaKind::Audio, audio_params())
            .await;
        assert!(matches!(result, Err(BrokerError::InvalidState(_))));

        room.connect_transport(peer, send.id, dtls())
            .await
            .expect("Transport should connect");
        room.produce(peer, send.id, MediaKind::Audio, audio_params())
            .await
            .expect("Produce should succeed once connected");
    }

    #[tokio::test]
    async fn test_produce_on_recv_transport_rejected() {
        let (room, _registry, metrics) = spawn_room().await;
        let (peer, _events) = join_peer(&room, &metrics, "alice").await;
        let (_send_id, recv_id) = set_up_media(&room, peer).await;

        let result = room
            .produce(peer, recv_id, MediaKind::Audio, audio_params())
            .await;
        assert!(matches!(result, Err(BrokerError::InvalidState(_))));

        let result = room
            .produce(peer, TransportId::new(), MediaKind::Audio, audio_params())
            .await;
        assert!(matches!(result, Err(BrokerError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn test_produce_broadcasts_new_producer() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (_bob, mut bob_events) = join_peer(&room, &metrics, "bob").await;
        let (send_id, _recv_id) = set_up_media(&room, alice).await;

        let producer_id = room
            .produce(alice, send_id, MediaKind::Video, video_params())
            .await
            .expect("Produce should succeed");

        let event = bob_events.recv().await.expect("Event should arrive");
        assert_eq!(
            event,
            RoomEvent::NewProducer {
                peer_id: alice,
                producer_id,
                kind: MediaKind::Video,
            }
        );
    }

    #[tokio::test]
    async fn test_consume_resolves_source_peer() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (bob, _bob_events) = join_peer(&room, &metrics, "bob").await;
        let (alice_send, _alice_recv) = set_up_media(&room, alice).await;
        set_up_media(&room, bob).await;

        let producer_id = room
            .produce(alice, alice_send, MediaKind::Audio, audio_params())
            .await
            .expect("Produce should succeed");

        let descriptor = room
            .consume(bob, producer_id, full_caps())
            .await
            .expect("Consume should succeed");

        assert_eq!(descriptor.producer_id, producer_id);
        assert_eq!(descriptor.peer_id, alice);
        assert_eq!(descriptor.kind, MediaKind::Audio);
        assert_eq!(descriptor.media_params.mime_type, "audio/opus");

        // Resume twice: second call is a no-op, not an error.
        room.resume_consumer(bob, descriptor.consumer_id)
            .await
            .expect("Resume should succeed");
        room.resume_consumer(bob, descriptor.consumer_id)
            .await
            .expect("Repeated resume should be a no-op");
    }

    #[tokio::test]
    async fn test_consume_error_paths() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (bob, _bob_events) = join_peer(&room, &metrics, "bob").await;
        let (alice_send, _alice_recv) = set_up_media(&room, alice).await;

        let producer_id = room
            .produce(alice, alice_send, MediaKind::Video, video_params())
            .await
            .expect("Produce should succeed");

        // Bob has no recv transport yet.
        let result = room.consume(bob, producer_id, full_caps()).await;
        assert!(matches!(result, Err(BrokerError::InvalidState(_))));

        set_up_media(&room, bob).await;

        // Unknown producer.
        let result = room.consume(bob, ProducerId::new(), full_caps()).await;
        assert!(matches!(result, Err(BrokerError::ProducerNotFound(_))));

        // Audio-only subscriber cannot receive video.
        let audio_only = MediaCapabilities {
            codecs: default_codecs()
                .into_iter()
                .filter(|codec| codec.kind == MediaKind::Audio)
                .collect(),
        };
        let result = room.consume(bob, producer_id, audio_only).await;
        assert!(matches!(result, Err(BrokerError::CapabilityMismatch(_))));

        // Resuming someone else's consumer id is not found.
        let descriptor = room
            .consume(bob, producer_id, full_caps())
            .await
            .expect("Consume should succeed");
        let result = room.resume_consumer(alice, descriptor.consumer_id).await;
        assert!(matches!(result, Err(BrokerError::ConsumerNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_producers_excludes_own() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (bob, _bob_events) = join_peer(&room, &metrics, "bob").await;
        let (alice_send, _alice_recv) = set_up_media(&room, alice).await;
        let (bob_send, _bob_recv) = set_up_media(&room, bob).await;

        let alice_producer = room
            .produce(alice, alice_send, MediaKind::Audio, audio_params())
            .await
            .expect("Produce should succeed");
        let bob_producer = room
            .produce(bob, bob_send, MediaKind::Video, video_params())
            .await
            .expect("Produce should succeed");

        let seen_by_bob = room
            .get_producers(bob)
            .await
            .expect("Snapshot should succeed");
        assert_eq!(seen_by_bob.len(), 1);
        let entry = seen_by_bob.first().unwrap();
        assert_eq!(entry.producer_id, alice_producer);
        assert_eq!(entry.peer_id, alice);

        let seen_by_alice = room
            .get_producers(alice)
            .await
            .expect("Snapshot should succeed");
        assert_eq!(seen_by_alice.len(), 1);
        assert_eq!(seen_by_alice.first().unwrap().producer_id, bob_producer);
    }

    #[tokio::test]
    async fn test_leave_cascade_orders_consumer_closed_before_peer_left() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (bob, mut bob_events) = join_peer(&room, &metrics, "bob").await;
        let (alice_send, _alice_recv) = set_up_media(&room, alice).await;
        set_up_media(&room, bob).await;

        let audio = room
            .produce(alice, alice_send, MediaKind::Audio, audio_params())
            .await
            .expect("Produce should succeed");
        let video = room
            .produce(alice, alice_send, MediaKind::Video, video_params())
            .await
            .expect("Produce should succeed");

        let audio_consumer = room
            .consume(bob, audio, full_caps())
            .await
            .expect("Consume should succeed");
        let video_consumer = room
            .consume(bob, video, full_caps())
            .await
            .expect("Consume should succeed");

        // Drain bob's new-producer events.
        let mut drained = 0;
        while drained < 2 {
            match bob_events.recv().await {
                Some(RoomEvent::NewProducer { .. }) => drained += 1,
                other => panic!("Expected new-producer, got {other:?}"),
            }
        }

        room.leave(alice).await.expect("Leave should succeed");

        let mut closed = Vec::new();
        for _ in 0..2 {
            match bob_events.recv().await {
                Some(RoomEvent::ConsumerClosed { consumer_id }) => closed.push(consumer_id),
                other => panic!("Expected consumer-closed before peer-left, got {other:?}"),
            }
        }
        assert!(closed.contains(&audio_consumer.consumer_id));
        assert!(closed.contains(&video_consumer.consumer_id));

        match bob_events.recv().await {
            Some(RoomEvent::PeerLeft { peer_id }) => assert_eq!(peer_id, alice),
            other => panic!("Expected peer-left, got {other:?}"),
        }

        // The closed consumer is gone from bob's seat map.
        let result = room.resume_consumer(bob, audio_consumer.consumer_id).await;
        assert!(matches!(result, Err(BrokerError::ConsumerNotFound(_))));
    }

    #[tokio::test]
    async fn test_last_leave_empties_room() {
        let (room, mut registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;

        room.leave(alice).await.expect("Leave should succeed");

        match registry.recv().await {
            Some(RegistryMessage::RoomEmptied { room_id, epoch }) => {
                assert_eq!(room_id, RoomId::from("room-1"));
                assert_eq!(epoch, 1);
            }
            _ => panic!("Expected room-emptied notice"),
        }

        // Every request now gets the retry signal.
        let late = PeerId::new();
        let sink = EventSink::new(late, Arc::clone(&metrics));
        let result = room.join(late, "carol".to_string(), sink).await;
        assert!(matches!(result, Err(BrokerError::RoomClosed)));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (room, _registry, metrics) = spawn_room().await;
        let (alice, _alice_events) = join_peer(&room, &metrics, "alice").await;
        let (_bob, _bob_events) = join_peer(&room, &metrics, "bob").await;

        room.leave(alice).await.expect("Leave should succeed");
        room.leave(alice)
            .await
            .expect("Repeated leave should be a no-op");
    }
}
