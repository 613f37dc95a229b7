//! Presentation callbacks.
//!
//! The session reports lifecycle changes through [`SessionEvents`]; the
//! embedder's UI layer implements it. Callbacks run on the session
//! actor's task and must not block.

use signal_protocol::{ConsumerDescriptor, ConsumerId, PeerId};

/// Lifecycle callbacks for one client session.
///
/// Grouping is per peer: a remote participant publishing audio and video
/// triggers one `on_peer_joined` and one `on_peer_left`, with a
/// consumer-level callback per track in between.
pub trait SessionEvents: Send + Sync {
    /// Another peer entered the room.
    fn on_peer_joined(&self, peer_id: PeerId, username: &str) {
        let _ = (peer_id, username);
    }

    /// Another peer left; all its consumers are already closed.
    fn on_peer_left(&self, peer_id: PeerId) {
        let _ = peer_id;
    }

    /// A subscription to a remote producer became active.
    fn on_consumer_created(&self, consumer: &ConsumerDescriptor) {
        let _ = consumer;
    }

    /// A previously reported consumer was closed.
    fn on_consumer_closed(&self, consumer_id: ConsumerId) {
        let _ = consumer_id;
    }

    /// The signaling channel ended without an explicit leave.
    fn on_session_closed(&self) {}
}

/// Events implementation that ignores everything, for embedders that
/// only poll session state.
pub struct NoopEvents;

impl SessionEvents for NoopEvents {}

/// Recording implementation for tests.
pub mod mock {
    use super::{ConsumerDescriptor, ConsumerId, PeerId, SessionEvents};
    use std::sync::Mutex;

    /// One recorded callback invocation.
    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedEvent {
        PeerJoined(PeerId, String),
        PeerLeft(PeerId),
        ConsumerCreated(ConsumerDescriptor),
        ConsumerClosed(ConsumerId),
        SessionClosed,
    }

    /// Records every callback in order.
    #[derive(Default)]
    pub struct RecordingEvents {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEvents {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of everything recorded so far.
        pub fn recorded(&self) -> Vec<RecordedEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        /// Count of `on_peer_left` calls for one peer.
        pub fn peer_left_count(&self, peer_id: PeerId) -> usize {
            self.recorded()
                .iter()
                .filter(|event| matches!(event, RecordedEvent::PeerLeft(id) if *id == peer_id))
                .count()
        }

        /// Count of `on_consumer_created` calls for one producer.
        pub fn consumer_created_count(&self, producer_id: signal_protocol::ProducerId) -> usize {
            self.recorded()
                .iter()
                .filter(|event| {
                    matches!(event, RecordedEvent::ConsumerCreated(desc)
                        if desc.producer_id == producer_id)
                })
                .count()
        }

        fn push(&self, event: RecordedEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }

    impl SessionEvents for RecordingEvents {
        fn on_peer_joined(&self, peer_id: PeerId, username: &str) {
            self.push(RecordedEvent::PeerJoined(peer_id, username.to_string()));
        }

        fn on_peer_left(&self, peer_id: PeerId) {
            self.push(RecordedEvent::PeerLeft(peer_id));
        }

        fn on_consumer_created(&self, consumer: &ConsumerDescriptor) {
            self.push(RecordedEvent::ConsumerCreated(consumer.clone()));
        }

        fn on_consumer_closed(&self, consumer_id: ConsumerId) {
            self.push(RecordedEvent::ConsumerClosed(consumer_id));
        }

        fn on_session_closed(&self) {
            self.push(RecordedEvent::SessionClosed);
        }
    }
}
