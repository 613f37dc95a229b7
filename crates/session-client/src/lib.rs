//! Conclave client session.
//!
//! A [`ClientSession`] drives one signaling connection through its
//! lifecycle: join a room, publish local tracks, and subscribe to every
//! remote producer exactly once. It owns the client-side half of the
//! session protocol:
//!
//! - the lifecycle state machine (idle, connecting, connected, joined,
//!   leaving)
//! - the producer→peer identity map that groups tracks per participant
//! - the idempotent consume registry that collapses the snapshot, the
//!   live broadcast, and any retry into at most one consume per producer
//! - the username directory and peer teardown on departure
//!
//! The session is generic over its seams: [`SignalTransport`] for the
//! channel (in-process against a broker, or a socket), [`MediaDevice`]
//! for the local media stack, and [`SessionEvents`] for presentation
//! callbacks.
//!
//! # Usage
//!
//! ```no_run
//! use session_client::{ClientSession, NoopEvents};
//! use session_client::device::mock::MockDevice;
//! use signal_protocol::RoomId;
//! use std::sync::Arc;
//! # async fn example(transport: Arc<dyn signal_protocol::SignalTransport>)
//! # -> Result<(), session_client::ClientError> {
//! let session = ClientSession::connect(
//!     transport,
//!     Arc::new(MockDevice::new()),
//!     Arc::new(NoopEvents),
//! )
//! .await?;
//!
//! session.join(RoomId::from("standup-42"), "alice").await?;
//! let consumers = session.consumers().await?;
//! session.leave().await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod errors;
pub mod events;
pub mod session;

pub use device::MediaDevice;
pub use errors::ClientError;
pub use events::{NoopEvents, SessionEvents};
pub use session::{ClientSession, SessionState, SessionStats};

pub use signal_protocol::SignalTransport;
