//! Conclave session broker.
//!
//! The server side of the coordination core: owns rooms, peers,
//! transports, producers and consumers on top of an opaque media engine,
//! and relays lifecycle events so clients converge on one subscription
//! per remote producer.
//!
//! # Architecture
//!
//! ```text
//! SessionBroker
//!   ├── WorkerPool            (engine workers, round-robin, death watch)
//!   ├── RegistryActor         (room map, serialized creation, epochs)
//!   │     └── RoomActor…      (one per room: members, media, broadcast)
//!   └── ConnectionActor…      (one per peer: request serialization)
//!         └── PeerConnection  (the SignalTransport handed to clients)
//! ```
//!
//! Requests from one peer are serialized by its connection actor;
//! different peers and rooms run concurrently. All shared state is owned
//! by exactly one actor and mutated through its mailbox.
//!
//! # Usage
//!
//! ```no_run
//! use media_engine::LocalEngine;
//! use session_broker::{BrokerConfig, SessionBroker};
//!
//! # async fn run() -> Result<(), session_broker::BrokerError> {
//! let engine = LocalEngine::new();
//! let broker = SessionBroker::start(&BrokerConfig::default(), &engine).await?;
//! let connection = broker.connect()?;
//! // hand `connection` to a client session
//! # Ok(())
//! # }
//! ```

pub mod actors;
pub mod broker;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod pool;

pub use actors::messages::{BrokerStatus, RoomInfo};
pub use broker::SessionBroker;
pub use config::{BrokerConfig, ConfigError};
pub use connection::PeerConnection;
pub use errors::BrokerError;
pub use metrics::BrokerMetrics;
pub use pool::WorkerPool;
