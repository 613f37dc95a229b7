//! Client session actor.
//!
//! One [`SessionActor`] owns all client-local state: the lifecycle state
//! machine, the producer→peer identity map, the idempotent consume
//! registry, the username directory and the local publish bookkeeping.
//! Everything is mutated from the actor's own task, which is what makes
//! the consume check-and-insert atomic; the network call itself runs on
//! a spawned task so consumes for different producers overlap.
//!
//! # Reconciliation
//!
//! Three asynchronous sources describe the same fact ("peer P publishes
//! producer X"): the join-time `get-producers` snapshot, the live
//! `new-producer` broadcast, and the consume response. The actor treats
//! them uniformly: identity is recorded eagerly from whichever arrives
//! first, the consume registry suppresses every duplicate trigger, and
//! the consume response's resolved peer-id is the authoritative fallback
//! because it derives from live room membership.

use crate::device::MediaDevice;
use crate::errors::ClientError;
use crate::events::SessionEvents;

use signal_protocol::{
    ConsumerDescriptor, ConsumerId, EventStream, MediaCapabilities, MediaKind, MediaParams,
    PeerId, ProducerId, RoomEvent, RoomId, SignalRequest, SignalResponse, SignalTransport,
    TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 200;

/// Client session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live signaling channel.
    Idle,
    /// Channel handed over, event stream not yet attached.
    Connecting,
    /// Channel live, not in a room.
    Connected,
    /// In a room; media flows.
    Joined,
    /// Teardown in progress.
    Leaving,
}

impl SessionState {
    /// Returns the state as a string for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Joined => "joined",
            SessionState::Leaving => "leaving",
        }
    }
}

/// Counters the session keeps about protocol anomalies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// `record_producer` calls that reported a different peer for a
    /// known producer. The first mapping is kept.
    pub identity_conflicts: u64,
    /// Consume triggers suppressed by the registry.
    pub consumes_suppressed: u64,
    /// Broadcasts ignored because their subject was this session.
    pub self_events_ignored: u64,
}

/// One entry in the consume registry.
///
/// `Pending` reserves the producer-id the moment a trigger wins the
/// check-and-insert; `Active` holds the settled descriptor.
enum ConsumeEntry {
    Pending,
    Active(ConsumerDescriptor),
}

/// One track this session publishes.
struct LocalProducer {
    kind: MediaKind,
    paused: bool,
}

/// Running event-pump task feeding broadcasts into the mailbox.
struct PumpHandle {
    token: CancellationToken,
    _task: JoinHandle<()>,
}

/// Messages handled by the session actor.
enum SessionMessage {
    /// (Re)attach the event stream, replacing any previous pump.
    Resubscribe {
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Join {
        room_id: RoomId,
        username: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Publish {
        kind: MediaKind,
        media_params: MediaParams,
        respond_to: oneshot::Sender<Result<ProducerId, ClientError>>,
    },
    Toggle {
        kind: MediaKind,
        respond_to: oneshot::Sender<bool>,
    },
    ResolvePeer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Option<PeerId>>,
    },
    UsernameOf {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<String>>,
    },
    Consumers {
        respond_to: oneshot::Sender<Vec<ConsumerDescriptor>>,
    },
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
    GetStats {
        respond_to: oneshot::Sender<SessionStats>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },

    /// One broadcast from the event pump.
    Event(RoomEvent),
    /// A spawned consume call finished.
    ConsumeSettled {
        producer_id: ProducerId,
        result: Result<ConsumerDescriptor, ClientError>,
    },
    /// The event stream ended without an explicit leave.
    PumpEnded,
}

/// Handle to a client session.
///
/// Cloning shares the session; dropping the last clone stops the actor.
#[derive(Clone)]
pub struct ClientSession {
    peer_id: PeerId,
    sender: mpsc::Sender<SessionMessage>,
}

impl ClientSession {
    /// Attach a session to an established signaling connection.
    ///
    /// Subscribes to the event stream before returning, so no broadcast
    /// delivered after this call can be missed.
    pub async fn connect(
        transport: Arc<dyn SignalTransport>,
        device: Arc<dyn MediaDevice>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self, ClientError> {
        let peer_id = transport.peer_id();
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = SessionActor::new(transport, device, events, receiver, sender.downgrade());
        tokio::spawn(actor.run());

        let session = Self { peer_id, sender };
        session.resubscribe().await?;
        Ok(session)
    }

    /// Identity assigned by the broker to this connection.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Replace the event subscription and pump.
    ///
    /// Safe to call repeatedly; each call first tears down the previous
    /// pump and stream so reconnects never double-deliver events.
    pub async fn resubscribe(&self) -> Result<(), ClientError> {
        self.call(|respond_to| SessionMessage::Resubscribe { respond_to })
            .await?
    }

    /// Join a room, creating it broker-side if absent.
    ///
    /// Runs the whole entry sequence: join, device load, transport
    /// setup, and subscription to every existing remote producer.
    pub async fn join(&self, room_id: RoomId, username: impl Into<String>) -> Result<(), ClientError> {
        let username = username.into();
        self.call(|respond_to| SessionMessage::Join {
            room_id,
            username,
            respond_to,
        })
        .await?
    }

    /// Publish a local track on the send transport.
    pub async fn publish(
        &self,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<ProducerId, ClientError> {
        self.call(|respond_to| SessionMessage::Publish {
            kind,
            media_params,
            respond_to,
        })
        .await?
    }

    /// Toggle local audio. Returns the new enabled flag.
    pub async fn toggle_audio(&self) -> Result<bool, ClientError> {
        self.call(|respond_to| SessionMessage::Toggle {
            kind: MediaKind::Audio,
            respond_to,
        })
        .await
    }

    /// Toggle local video. Returns the new enabled flag.
    pub async fn toggle_video(&self) -> Result<bool, ClientError> {
        self.call(|respond_to| SessionMessage::Toggle {
            kind: MediaKind::Video,
            respond_to,
        })
        .await
    }

    /// The peer currently known to publish `producer_id`.
    pub async fn resolve_peer(&self, producer_id: ProducerId) -> Result<Option<PeerId>, ClientError> {
        self.call(|respond_to| SessionMessage::ResolvePeer {
            producer_id,
            respond_to,
        })
        .await
    }

    /// Display name of a peer, if one was announced.
    pub async fn username_of(&self, peer_id: PeerId) -> Result<Option<String>, ClientError> {
        self.call(|respond_to| SessionMessage::UsernameOf {
            peer_id,
            respond_to,
        })
        .await
    }

    /// Snapshot of the active consumers.
    pub async fn consumers(&self) -> Result<Vec<ConsumerDescriptor>, ClientError> {
        self.call(|respond_to| SessionMessage::Consumers { respond_to })
            .await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> Result<SessionState, ClientError> {
        self.call(|respond_to| SessionMessage::GetState { respond_to })
            .await
    }

    /// Protocol anomaly counters.
    pub async fn stats(&self) -> Result<SessionStats, ClientError> {
        self.call(|respond_to| SessionMessage::GetStats { respond_to })
            .await
    }

    /// Leave the room and close the signaling channel.
    pub async fn leave(&self) -> Result<(), ClientError> {
        self.call(|respond_to| SessionMessage::Leave { respond_to })
            .await?
    }

    /// Send one message and await its reply.
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }
}

/// The session actor implementation.
struct SessionActor {
    /// Identity assigned by the broker.
    peer_id: PeerId,
    /// Signaling channel to the broker.
    transport: Arc<dyn SignalTransport>,
    /// Local media stack.
    device: Arc<dyn MediaDevice>,
    /// Presentation callbacks.
    events: Arc<dyn SessionEvents>,
    /// Message receiver.
    receiver: mpsc::Receiver<SessionMessage>,
    /// Weak mailbox sender handed to pump and consume tasks. Weak so
    /// the actor exits once every [`ClientSession`] clone is dropped.
    self_sender: mpsc::WeakSender<SessionMessage>,
    /// Lifecycle state.
    state: SessionState,
    /// Joined room, if any.
    room_id: Option<RoomId>,
    /// Send transport created during join.
    send_transport: Option<TransportId>,
    /// Recv transport created during join.
    recv_transport: Option<TransportId>,
    /// Consume registry: the at-most-once guard.
    consumers: HashMap<ProducerId, ConsumeEntry>,
    /// Producer → publishing peer identity map.
    identity: HashMap<ProducerId, PeerId>,
    /// Peer → display name directory.
    usernames: HashMap<PeerId, String>,
    /// Tracks this session publishes.
    local_producers: HashMap<ProducerId, LocalProducer>,
    /// Local audio enable flag.
    audio_enabled: bool,
    /// Local video enable flag.
    video_enabled: bool,
    /// Anomaly counters.
    stats: SessionStats,
    /// Running event pump, if any.
    pump: Option<PumpHandle>,
}

impl SessionActor {
    fn new(
        transport: Arc<dyn SignalTransport>,
        device: Arc<dyn MediaDevice>,
        events: Arc<dyn SessionEvents>,
        receiver: mpsc::Receiver<SessionMessage>,
        self_sender: mpsc::WeakSender<SessionMessage>,
    ) -> Self {
        Self {
            peer_id: transport.peer_id(),
            transport,
            device,
            events,
            receiver,
            self_sender,
            state: SessionState::Connecting,
            room_id: None,
            send_transport: None,
            recv_transport: None,
            consumers: HashMap::new(),
            identity: HashMap::new(),
            usernames: HashMap::new(),
            local_producers: HashMap::new(),
            audio_enabled: true,
            video_enabled: true,
            stats: SessionStats::default(),
            pump: None,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "client.session", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "client.session",
            peer_id = %self.peer_id,
            "Session actor started"
        );

        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message).await;
        }

        self.stop_pump();

        // Every handle is gone. Close the channel if the embedder never
        // called leave, so the broker sees the departure promptly.
        if self.state != SessionState::Idle {
            self.transport.close().await;
        }

        info!(
            target: "client.session",
            peer_id = %self.peer_id,
            state = self.state.as_str(),
            "Session actor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Resubscribe { respond_to } => {
                let result = self.handle_resubscribe().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Join {
                room_id,
                username,
                respond_to,
            } => {
                let result = self.handle_join(room_id, username).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Publish {
                kind,
                media_params,
                respond_to,
            } => {
                let result = self.handle_publish(kind, media_params).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Toggle { kind, respond_to } => {
                let _ = respond_to.send(self.handle_toggle(kind));
            }

            SessionMessage::ResolvePeer {
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.identity.get(&producer_id).copied());
            }

            SessionMessage::UsernameOf {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.usernames.get(&peer_id).cloned());
            }

            SessionMessage::Consumers { respond_to } => {
                let active = self
                    .consumers
                    .values()
                    .filter_map(|entry| match entry {
                        ConsumeEntry::Active(descriptor) => Some(descriptor.clone()),
                        ConsumeEntry::Pending => None,
                    })
                    .collect();
                let _ = respond_to.send(active);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state);
            }

            SessionMessage::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats);
            }

            SessionMessage::Leave { respond_to } => {
                let result = self.handle_leave().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Event(event) => self.handle_event(event),

            SessionMessage::ConsumeSettled {
                producer_id,
                result,
            } => self.handle_consume_settled(producer_id, result),

            SessionMessage::PumpEnded => self.handle_pump_ended(),
        }
    }

    /// Replace the event subscription and pump.
    async fn handle_resubscribe(&mut self) -> Result<(), ClientError> {
        if self.state == SessionState::Idle || self.state == SessionState::Leaving {
            return Err(ClientError::InvalidState(
                "session is closed".to_string(),
            ));
        }

        // Old pump first, so the new stream cannot race a duplicate.
        self.stop_pump();
        let stream = self.transport.subscribe().await;
        self.pump = Some(self.spawn_pump(stream));

        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }

        debug!(
            target: "client.session",
            peer_id = %self.peer_id,
            "Event stream attached"
        );
        Ok(())
    }

    /// Spawn a task forwarding broadcasts into the mailbox.
    fn spawn_pump(&self, mut stream: EventStream) -> PumpHandle {
        let token = CancellationToken::new();
        let sender = self.self_sender.clone();
        let pump_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pump_token.cancelled() => break,
                    event = stream.recv() => {
                        let (message, done) = match event {
                            Some(event) => (SessionMessage::Event(event), false),
                            None => (SessionMessage::PumpEnded, true),
                        };
                        let Some(sender) = sender.upgrade() else { break };
                        if sender.send(message).await.is_err() || done {
                            break;
                        }
                    }
                }
            }
        });
        PumpHandle { token, _task: task }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.token.cancel();
        }
    }

    /// Run the join sequence; roll local state back on any failure.
    async fn handle_join(
        &mut self,
        room_id: RoomId,
        username: String,
    ) -> Result<(), ClientError> {
        if self.state != SessionState::Connected {
            return Err(ClientError::InvalidState(format!(
                "cannot join from state '{}'",
                self.state.as_str()
            )));
        }

        let result = self.join_sequence(room_id.clone(), username).await;
        if result.is_err() {
            // The broker cleans its side up on disconnect; locally we
            // only need to fall back to a joinable state.
            self.teardown_local();
            self.state = SessionState::Connected;
        }
        result
    }

    async fn join_sequence(&mut self, room_id: RoomId, username: String) -> Result<(), ClientError> {
        let response = self
            .transport
            .request(SignalRequest::Join {
                room_id: room_id.clone(),
                username,
            })
            .await?;
        let SignalResponse::Joined { media_capabilities } = response else {
            return Err(ClientError::UnexpectedResponse("join"));
        };

        self.device.load(&media_capabilities).await?;

        let send = self
            .create_and_connect_transport(&room_id, TransportDirection::Send)
            .await?;
        let recv = self
            .create_and_connect_transport(&room_id, TransportDirection::Recv)
            .await?;
        self.send_transport = Some(send);
        self.recv_transport = Some(recv);
        self.room_id = Some(room_id.clone());
        self.state = SessionState::Joined;

        info!(
            target: "client.session",
            peer_id = %self.peer_id,
            room_id = %room_id,
            "Joined room"
        );

        // Bulk snapshot: record identity before consuming, exactly as
        // the live broadcast path does.
        let response = self
            .transport
            .request(SignalRequest::GetProducers { room_id })
            .await?;
        let SignalResponse::Producers { producers } = response else {
            return Err(ClientError::UnexpectedResponse("get-producers"));
        };
        for producer in producers {
            self.record_producer(producer.producer_id, producer.peer_id);
            self.ensure_consumer(producer.producer_id);
        }

        Ok(())
    }

    async fn create_and_connect_transport(
        &self,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<TransportId, ClientError> {
        let response = self
            .transport
            .request(SignalRequest::CreateTransport {
                room_id: room_id.clone(),
                direction,
            })
            .await?;
        let SignalResponse::TransportCreated { transport } = response else {
            return Err(ClientError::UnexpectedResponse("create-transport"));
        };

        let response = self
            .transport
            .request(SignalRequest::ConnectTransport {
                transport_id: transport.id,
                dtls_parameters: self.device.dtls_parameters(),
            })
            .await?;
        let SignalResponse::TransportConnected = response else {
            return Err(ClientError::UnexpectedResponse("connect-transport"));
        };

        Ok(transport.id)
    }

    async fn handle_publish(
        &mut self,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<ProducerId, ClientError> {
        if self.state != SessionState::Joined {
            return Err(ClientError::InvalidState("join a room first".to_string()));
        }
        let transport_id = self
            .send_transport
            .ok_or_else(|| ClientError::InvalidState("no send transport".to_string()))?;

        let response = self
            .transport
            .request(SignalRequest::Produce {
                transport_id,
                kind,
                media_params,
            })
            .await?;
        let SignalResponse::Produced { producer_id } = response else {
            return Err(ClientError::UnexpectedResponse("produce"));
        };

        let paused = match kind {
            MediaKind::Audio => !self.audio_enabled,
            MediaKind::Video => !self.video_enabled,
        };
        self.local_producers
            .insert(producer_id, LocalProducer { kind, paused });

        info!(
            target: "client.session",
            peer_id = %self.peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Published local track"
        );

        Ok(producer_id)
    }

    /// Flip the local enable flag for one kind. Pausing is client-side
    /// only; the track keeps its producer.
    fn handle_toggle(&mut self, kind: MediaKind) -> bool {
        let enabled = match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        };
        let has_producer = self.local_producers.values().any(|p| p.kind == kind);
        if !has_producer {
            return enabled;
        }

        let enabled = !enabled;
        for producer in self
            .local_producers
            .values_mut()
            .filter(|p| p.kind == kind)
        {
            producer.paused = !enabled;
        }
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
        enabled
    }

    /// Reconcile one broadcast against local state.
    fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::PeerJoined { peer_id, username } => {
                if peer_id == self.peer_id {
                    self.stats.self_events_ignored += 1;
                    return;
                }
                self.usernames.insert(peer_id, username.clone());
                self.events.on_peer_joined(peer_id, &username);
            }

            RoomEvent::NewProducer {
                peer_id,
                producer_id,
                kind,
            } => {
                // Identity first, self-check second: even an echoed own
                // event carries a mapping worth keeping.
                self.record_producer(producer_id, peer_id);
                if peer_id == self.peer_id {
                    self.stats.self_events_ignored += 1;
                    return;
                }
                debug!(
                    target: "client.session",
                    peer_id = %self.peer_id,
                    source_peer = %peer_id,
                    producer_id = %producer_id,
                    kind = kind.as_str(),
                    "Remote producer announced"
                );
                self.ensure_consumer(producer_id);
            }

            RoomEvent::PeerLeft { peer_id } => {
                if peer_id == self.peer_id {
                    self.stats.self_events_ignored += 1;
                    return;
                }
                self.handle_peer_left(peer_id);
            }

            RoomEvent::ConsumerClosed { consumer_id } => {
                self.handle_consumer_closed(consumer_id);
            }
        }
    }

    /// Idempotent identity upsert.
    ///
    /// A conflicting peer for a known producer is a protocol anomaly;
    /// the first mapping wins so an active consumer's grouping cannot
    /// flip mid-session.
    fn record_producer(&mut self, producer_id: ProducerId, peer_id: PeerId) {
        match self.identity.get(&producer_id) {
            Some(existing) if *existing != peer_id => {
                self.stats.identity_conflicts += 1;
                warn!(
                    target: "client.session",
                    producer_id = %producer_id,
                    existing_peer = %existing,
                    reported_peer = %peer_id,
                    "Conflicting producer identity, keeping first mapping"
                );
            }
            Some(_) => {}
            None => {
                self.identity.insert(producer_id, peer_id);
            }
        }
    }

    /// The at-most-once consume guard.
    ///
    /// Check-and-insert happens here, atomically with respect to every
    /// other trigger; only the winner spawns the network call.
    fn ensure_consumer(&mut self, producer_id: ProducerId) {
        if self.state != SessionState::Joined {
            return;
        }
        if self.consumers.contains_key(&producer_id) {
            self.stats.consumes_suppressed += 1;
            debug!(
                target: "client.session",
                producer_id = %producer_id,
                "Consume suppressed, already pending or active"
            );
            return;
        }
        self.consumers.insert(producer_id, ConsumeEntry::Pending);

        let transport = Arc::clone(&self.transport);
        let capabilities = self.device.capabilities();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = consume_and_resume(transport, capabilities, producer_id).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(SessionMessage::ConsumeSettled {
                        producer_id,
                        result,
                    })
                    .await;
            }
        });
    }

    fn handle_consume_settled(
        &mut self,
        producer_id: ProducerId,
        result: Result<ConsumerDescriptor, ClientError>,
    ) {
        match result {
            Ok(descriptor) => {
                if !self.consumers.contains_key(&producer_id) {
                    // Torn down while the call was in flight (peer left
                    // or session left); the broker has already cascaded.
                    debug!(
                        target: "client.session",
                        producer_id = %producer_id,
                        "Consume settled after teardown, dropping"
                    );
                    return;
                }
                // Authoritative fallback: the response's peer-id derives
                // from live membership.
                self.record_producer(producer_id, descriptor.peer_id);
                self.consumers
                    .insert(producer_id, ConsumeEntry::Active(descriptor.clone()));
                self.events.on_consumer_created(&descriptor);
            }
            Err(error) => {
                // Roll the reservation back so a retry is not suppressed.
                if matches!(
                    self.consumers.get(&producer_id),
                    Some(ConsumeEntry::Pending)
                ) {
                    self.consumers.remove(&producer_id);
                }
                warn!(
                    target: "client.session",
                    producer_id = %producer_id,
                    error = %error,
                    "Consume failed, registry entry rolled back"
                );
            }
        }
    }

    /// Tear down everything resolved to a departed peer.
    ///
    /// Consumer-level teardown per track, presentation release exactly
    /// once per peer regardless of how many producers mapped to it.
    fn handle_peer_left(&mut self, peer_id: PeerId) {
        let doomed: Vec<(ProducerId, Option<ConsumerId>)> = self
            .consumers
            .iter()
            .filter_map(|(producer_id, entry)| {
                let owner = match entry {
                    ConsumeEntry::Active(descriptor) => Some(descriptor.peer_id),
                    ConsumeEntry::Pending => self.identity.get(producer_id).copied(),
                };
                if owner == Some(peer_id) {
                    let consumer_id = match entry {
                        ConsumeEntry::Active(descriptor) => Some(descriptor.consumer_id),
                        ConsumeEntry::Pending => None,
                    };
                    Some((*producer_id, consumer_id))
                } else {
                    None
                }
            })
            .collect();

        for (producer_id, consumer_id) in doomed {
            self.consumers.remove(&producer_id);
            if let Some(consumer_id) = consumer_id {
                self.events.on_consumer_closed(consumer_id);
            }
        }

        self.identity.retain(|_, owner| *owner != peer_id);
        self.usernames.remove(&peer_id);

        info!(
            target: "client.session",
            peer_id = %self.peer_id,
            departed_peer = %peer_id,
            "Peer left, local state purged"
        );
        self.events.on_peer_left(peer_id);
    }

    fn handle_consumer_closed(&mut self, consumer_id: ConsumerId) {
        let found = self.consumers.iter().find_map(|(producer_id, entry)| {
            match entry {
                ConsumeEntry::Active(descriptor) if descriptor.consumer_id == consumer_id => {
                    Some(*producer_id)
                }
                _ => None,
            }
        });

        if let Some(producer_id) = found {
            self.consumers.remove(&producer_id);
            self.events.on_consumer_closed(consumer_id);
        }
    }

    async fn handle_leave(&mut self) -> Result<(), ClientError> {
        if self.state != SessionState::Joined {
            return Err(ClientError::InvalidState(format!(
                "cannot leave from state '{}'",
                self.state.as_str()
            )));
        }

        self.state = SessionState::Leaving;
        self.stop_pump();
        self.teardown_local();
        self.transport.close().await;
        self.state = SessionState::Idle;

        info!(
            target: "client.session",
            peer_id = %self.peer_id,
            "Left room and closed channel"
        );
        Ok(())
    }

    /// The channel ended underneath us: same teardown as leave, plus
    /// the closed callback.
    fn handle_pump_ended(&mut self) {
        if self.state == SessionState::Idle || self.state == SessionState::Leaving {
            return;
        }

        warn!(
            target: "client.session",
            peer_id = %self.peer_id,
            state = self.state.as_str(),
            "Signaling channel ended"
        );
        self.stop_pump();
        self.teardown_local();
        self.state = SessionState::Idle;
        self.events.on_session_closed();
    }

    fn teardown_local(&mut self) {
        self.consumers.clear();
        self.identity.clear();
        self.usernames.clear();
        self.local_producers.clear();
        self.send_transport = None;
        self.recv_transport = None;
        self.room_id = None;
    }
}

/// Consume then resume, as one spawned unit.
///
/// A resume failure is logged and the consumer kept; the subscriber can
/// retry resuming later, and the broker-side consumer is live either way.
async fn consume_and_resume(
    transport: Arc<dyn SignalTransport>,
    capabilities: MediaCapabilities,
    producer_id: ProducerId,
) -> Result<ConsumerDescriptor, ClientError> {
    let response = transport
        .request(SignalRequest::Consume {
            media_capabilities: capabilities,
            producer_id,
        })
        .await?;
    let SignalResponse::Consumed(descriptor) = response else {
        return Err(ClientError::UnexpectedResponse("consume"));
    };

    match transport
        .request(SignalRequest::ResumeConsumer {
            consumer_id: descriptor.consumer_id,
        })
        .await
    {
        Ok(SignalResponse::ConsumerResumed) => {}
        Ok(_) | Err(_) => {
            warn!(
                target: "client.session",
                consumer_id = %descriptor.consumer_id,
                "Resume failed, keeping consumer"
            );
        }
    }

    Ok(descriptor)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::events::mock::{RecordedEvent, RecordingEvents};
    use signal_protocol::{ErrorKind, SignalError};

    /// Transport stub for exercising actor internals directly. Requests
    /// always fail; these tests never reach the network.
    struct DeadTransport {
        peer_id: PeerId,
    }

    #[async_trait::async_trait]
    impl SignalTransport for DeadTransport {
        fn peer_id(&self) -> PeerId {
            self.peer_id
        }

        async fn request(&self, _request: SignalRequest) -> Result<SignalResponse, SignalError> {
            Err(SignalError::new(ErrorKind::ChannelClosed, "dead transport"))
        }

        async fn subscribe(&self) -> EventStream {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }

        async fn close(&self) {}
    }

    fn test_actor() -> (SessionActor, Arc<RecordingEvents>, PeerId) {
        let peer_id = PeerId::new();
        let events = Arc::new(RecordingEvents::new());
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let actor = SessionActor::new(
            Arc::new(DeadTransport { peer_id }),
            Arc::new(MockDevice::new()),
            events.clone(),
            receiver,
            sender.downgrade(),
        );
        drop(sender);
        (actor, events, peer_id)
    }

    fn descriptor(producer_id: ProducerId, peer_id: PeerId) -> ConsumerDescriptor {
        ConsumerDescriptor {
            consumer_id: ConsumerId::new(),
            producer_id,
            peer_id,
            kind: MediaKind::Audio,
            media_params: MediaParams {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                encodings: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_record_producer_keeps_first_mapping_on_conflict() {
        let (mut actor, _events, _peer) = test_actor();
        let producer = ProducerId::new();
        let first = PeerId::new();
        let second = PeerId::new();

        actor.record_producer(producer, first);
        actor.record_producer(producer, first);
        assert_eq!(actor.stats.identity_conflicts, 0);

        actor.record_producer(producer, second);
        assert_eq!(actor.stats.identity_conflicts, 1);
        assert_eq!(actor.identity.get(&producer), Some(&first));
    }

    #[tokio::test]
    async fn test_duplicate_trigger_suppressed_by_registry() {
        let (mut actor, _events, _peer) = test_actor();
        actor.state = SessionState::Joined;
        let producer = ProducerId::new();

        actor.ensure_consumer(producer);
        assert!(matches!(
            actor.consumers.get(&producer),
            Some(ConsumeEntry::Pending)
        ));

        actor.ensure_consumer(producer);
        actor.ensure_consumer(producer);
        assert_eq!(actor.stats.consumes_suppressed, 2);
        assert_eq!(actor.consumers.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_consume_rolls_back_pending_entry() {
        let (mut actor, _events, _peer) = test_actor();
        actor.state = SessionState::Joined;
        let producer = ProducerId::new();

        actor.ensure_consumer(producer);
        actor.handle_consume_settled(
            producer,
            Err(ClientError::Signal(SignalError::new(
                ErrorKind::EngineFailure,
                "boom",
            ))),
        );

        assert!(!actor.consumers.contains_key(&producer));

        // A retry wins the check-and-insert again.
        actor.ensure_consumer(producer);
        assert!(actor.consumers.contains_key(&producer));
    }

    #[tokio::test]
    async fn test_self_events_ignored() {
        let (mut actor, events, peer_id) = test_actor();
        actor.state = SessionState::Joined;

        actor.handle_event(RoomEvent::PeerJoined {
            peer_id,
            username: "me".to_string(),
        });
        actor.handle_event(RoomEvent::PeerLeft { peer_id });

        let own_producer = ProducerId::new();
        actor.handle_event(RoomEvent::NewProducer {
            peer_id,
            producer_id: own_producer,
            kind: MediaKind::Video,
        });

        assert_eq!(actor.stats.self_events_ignored, 3);
        assert!(events.recorded().is_empty());
        // No consume was triggered for the own producer...
        assert!(!actor.consumers.contains_key(&own_producer));
        // ...but the identity mapping was still recorded.
        assert_eq!(actor.identity.get(&own_producer), Some(&peer_id));
    }

    #[tokio::test]
    async fn test_peer_left_releases_presentation_once_for_two_tracks() {
        let (mut actor, events, _peer) = test_actor();
        actor.state = SessionState::Joined;

        let remote = PeerId::new();
        let audio = ProducerId::new();
        let video = ProducerId::new();
        actor.record_producer(audio, remote);
        actor.record_producer(video, remote);
        actor
            .consumers
            .insert(audio, ConsumeEntry::Active(descriptor(audio, remote)));
        actor
            .consumers
            .insert(video, ConsumeEntry::Active(descriptor(video, remote)));
        actor.usernames.insert(remote, "bob".to_string());

        actor.handle_event(RoomEvent::PeerLeft { peer_id: remote });

        assert!(actor.consumers.is_empty());
        assert!(actor.identity.is_empty());
        assert!(actor.usernames.is_empty());
        assert_eq!(events.peer_left_count(remote), 1);

        let closed = events
            .recorded()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::ConsumerClosed(_)))
            .count();
        assert_eq!(closed, 2);

        // A second peer-left for the same peer finds nothing to close
        // but still reports the departure.
        actor.handle_event(RoomEvent::PeerLeft { peer_id: remote });
        let closed = events
            .recorded()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::ConsumerClosed(_)))
            .count();
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn test_consumer_closed_removes_matching_entry_only() {
        let (mut actor, events, _peer) = test_actor();
        actor.state = SessionState::Joined;

        let remote = PeerId::new();
        let producer = ProducerId::new();
        let kept = ProducerId::new();
        let doomed = descriptor(producer, remote);
        actor
            .consumers
            .insert(producer, ConsumeEntry::Active(doomed.clone()));
        actor
            .consumers
            .insert(kept, ConsumeEntry::Active(descriptor(kept, remote)));

        actor.handle_event(RoomEvent::ConsumerClosed {
            consumer_id: doomed.consumer_id,
        });

        assert!(!actor.consumers.contains_key(&producer));
        assert!(actor.consumers.contains_key(&kept));
        assert_eq!(
            events.recorded(),
            vec![RecordedEvent::ConsumerClosed(doomed.consumer_id)]
        );

        // Unknown consumer id is a no-op.
        actor.handle_event(RoomEvent::ConsumerClosed {
            consumer_id: ConsumerId::new(),
        });
        assert_eq!(events.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_after_teardown_is_dropped() {
        let (mut actor, events, _peer) = test_actor();
        actor.state = SessionState::Joined;

        let remote = PeerId::new();
        let producer = ProducerId::new();
        actor.record_producer(producer, remote);
        actor.consumers.insert(producer, ConsumeEntry::Pending);

        // Peer leaves while the consume is in flight.
        actor.handle_event(RoomEvent::PeerLeft { peer_id: remote });
        assert!(actor.consumers.is_empty());

        actor.handle_consume_settled(producer, Ok(descriptor(producer, remote)));
        assert!(actor.consumers.is_empty());
        assert_eq!(events.consumer_created_count(producer), 0);
    }

    #[tokio::test]
    async fn test_toggle_without_producer_keeps_flag() {
        let (mut actor, _events, _peer) = test_actor();

        assert!(actor.handle_toggle(MediaKind::Audio));
        assert!(actor.audio_enabled);

        actor.local_producers.insert(
            ProducerId::new(),
            LocalProducer {
                kind: MediaKind::Audio,
                paused: false,
            },
        );
        assert!(!actor.handle_toggle(MediaKind::Audio));
        assert!(actor
            .local_producers
            .values()
            .all(|p| p.kind != MediaKind::Audio || p.paused));
        assert!(actor.handle_toggle(MediaKind::Audio));
    }

    #[tokio::test]
    async fn test_join_rejected_outside_connected() {
        let (mut actor, _events, _peer) = test_actor();
        actor.state = SessionState::Joined;

        let result = actor.handle_join(RoomId::from("r1"), "alice".to_string()).await;
        assert!(matches!(result, Err(ClientError::InvalidState(_))));
    }
}
