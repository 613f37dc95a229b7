//! Media engine seam.
//!
//! The broker never forwards a media packet itself; it orchestrates an
//! engine that does (ICE/DTLS/SRTP, RTP routing). This crate defines the
//! capability traits the broker drives the engine through, and ships
//! [`local::LocalEngine`], a deterministic in-process implementation used
//! by tests and demos.
//!
//! # Hierarchy
//!
//! ```text
//! MediaEngine
//!   └── EngineWorker          (compute unit, death watch)
//!         └── EngineRouter    (one per room, codec capabilities)
//!               └── EngineTransport
//!                     ├── EngineProducer
//!                     └── EngineConsumer
//! ```
//!
//! The traits are intentionally dumb: lifecycle windows (who may produce
//! when, which peer owns which transport) are the broker's business. The
//! engine only refuses operations on closed resources and capability
//! mismatches it can detect itself.

pub mod errors;
pub mod local;
pub mod traits;

pub use errors::EngineError;
pub use local::LocalEngine;
pub use traits::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, EngineWorker, MediaEngine,
    TransportOptions, WorkerSettings,
};
