//! Shared signaling contracts for Conclave.
//!
//! This crate defines everything both sides of the signaling channel must
//! agree on: identifier newtypes, media capability descriptions, the
//! request/response envelopes, room broadcast events, and the error
//! taxonomy. It also defines [`SignalTransport`], the seam through which a
//! client session talks to a broker without caring whether the channel is
//! in-process or a real socket.
//!
//! # Modules
//!
//! - [`types`] - identifiers and media descriptions
//! - [`messages`] - request/response/broadcast wire messages
//! - [`errors`] - the `SignalError` envelope and its `ErrorKind` taxonomy
//! - [`transport`] - the `SignalTransport` channel seam

pub mod errors;
pub mod messages;
pub mod transport;
pub mod types;

pub use errors::{ErrorKind, SignalError};
pub use messages::{
    ConsumerDescriptor, ProducerSummary, RoomEvent, SignalRequest, SignalResponse,
};
pub use transport::{EventStream, SignalTransport};
pub use types::{
    CodecCapability, ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, EncodingParams,
    IceCandidate, IceParameters, MediaCapabilities, MediaKind, MediaParams, PeerId, ProducerId,
    RoomId, TransportDescriptor, TransportDirection, TransportId,
};
