//! In-process [`SignalTransport`] implementation.
//!
//! [`PeerConnection`] is what [`crate::broker::SessionBroker::connect`]
//! hands out: the client side of one signaling connection, backed by a
//! [`crate::actors::connection::ConnectionActor`] mailbox. A network
//! layer would implement the same trait over a socket; client code never
//! sees the difference.

use crate::actors::messages::ConnectionMessage;
use crate::events::EventSink;

use signal_protocol::{
    ErrorKind, EventStream, PeerId, SignalError, SignalRequest, SignalResponse, SignalTransport,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One peer's signaling connection to an in-process broker.
///
/// Cloning shares the connection; dropping the last clone disconnects
/// the peer (the connection actor observes its mailbox closing).
#[derive(Clone)]
pub struct PeerConnection {
    peer_id: PeerId,
    sender: mpsc::Sender<ConnectionMessage>,
    sink: EventSink,
    cancel_token: CancellationToken,
}

impl PeerConnection {
    pub(crate) fn new(
        peer_id: PeerId,
        sender: mpsc::Sender<ConnectionMessage>,
        sink: EventSink,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            peer_id,
            sender,
            sink,
            cancel_token,
        }
    }

    /// Whether the broker has torn this connection down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }

    fn channel_closed() -> SignalError {
        SignalError::new(ErrorKind::ChannelClosed, "connection closed")
    }
}

#[async_trait::async_trait]
impl SignalTransport for PeerConnection {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request(&self, request: SignalRequest) -> Result<SignalResponse, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Request {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| Self::channel_closed())?;

        rx.await.map_err(|_| Self::channel_closed())?
    }

    async fn subscribe(&self) -> EventStream {
        self.sink.subscribe().await
    }

    async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectionMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            // Disconnect has completed once the ack arrives; a dropped
            // ack means the actor is already gone.
            let _ = rx.await;
        }
    }
}
