//! Event delivery from rooms to connection subscribers.
//!
//! Each connection owns one [`EventSink`]. The room holds a clone and
//! pushes events into it; the connection's owner pulls them from the
//! receiver handed out by [`EventSink::subscribe`]. Delivery is
//! best-effort: events sent while no subscriber exists, or while the
//! channel is full, are counted and dropped rather than blocking the
//! room.

use crate::metrics::BrokerMetrics;
use signal_protocol::{PeerId, RoomEvent};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Buffered events per subscriber before drops begin.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Best-effort event channel between a room and one connection.
#[derive(Clone)]
pub struct EventSink {
    peer_id: PeerId,
    sender: Arc<Mutex<Option<mpsc::Sender<RoomEvent>>>>,
    metrics: Arc<BrokerMetrics>,
}

impl EventSink {
    /// Create a sink with no subscriber yet.
    #[must_use]
    pub fn new(peer_id: PeerId, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            peer_id,
            sender: Arc::new(Mutex::new(None)),
            metrics,
        }
    }

    /// Start (or restart) a subscription.
    ///
    /// Replaces any previous subscriber; the old receiver's channel is
    /// closed and events flow to the new receiver from this point on.
    pub async fn subscribe(&self) -> mpsc::Receiver<RoomEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut slot = self.sender.lock().await;
        *slot = Some(tx);
        rx
    }

    /// Drop the subscriber slot so the current receiver's stream ends.
    ///
    /// Called when the connection is torn down; the subscriber observes
    /// end-of-stream instead of a silently dead channel.
    pub async fn close(&self) {
        let mut slot = self.sender.lock().await;
        *slot = None;
    }

    /// Push an event toward the subscriber, dropping it on overflow.
    pub async fn deliver(&self, event: RoomEvent) {
        let mut slot = self.sender.lock().await;
        let Some(sender) = slot.as_ref() else {
            self.metrics.event_dropped();
            return;
        };

        match sender.try_send(event) {
            Ok(()) => self.metrics.event_delivered(),
            Err(TrySendError::Full(_)) => {
                self.metrics.event_dropped();
                warn!(
                    target: "broker.events",
                    peer_id = %self.peer_id,
                    capacity = EVENT_CHANNEL_CAPACITY,
                    "Event dropped, subscriber channel full"
                );
            }
            Err(TrySendError::Closed(_)) => {
                // Receiver went away; stop holding a dead sender.
                *slot = None;
                self.metrics.event_dropped();
            }
        }
    }
}
