//! Error envelope returned for failed signaling requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable failure categories for signaling requests.
///
/// Numeric codes are part of the wire contract and stable across
/// releases; labels are bounded for use as metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    RoomNotFound,
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    TransportAlreadyExists,
    CapabilityMismatch,
    InvalidState,
    RoomClosed,
    EngineFailure,
    ChannelClosed,
}

impl ErrorKind {
    /// Numeric code carried on the wire alongside the kind.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::CapabilityMismatch => 2,
            Self::RoomNotFound
            | Self::TransportNotFound
            | Self::ProducerNotFound
            | Self::ConsumerNotFound => 4,
            Self::TransportAlreadyExists | Self::InvalidState => 5,
            Self::EngineFailure | Self::ChannelClosed => 6,
            Self::RoomClosed => 7,
        }
    }

    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::TransportNotFound => "transport_not_found",
            Self::ProducerNotFound => "producer_not_found",
            Self::ConsumerNotFound => "consumer_not_found",
            Self::TransportAlreadyExists => "transport_already_exists",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::InvalidState => "invalid_state",
            Self::RoomClosed => "room_closed",
            Self::EngineFailure => "engine_failure",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed signaling request.
///
/// The message is safe to forward to clients; internal detail stays in
/// broker logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SignalError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Numeric wire code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.kind.code()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorKind::CapabilityMismatch.code(), 2);
        assert_eq!(ErrorKind::RoomNotFound.code(), 4);
        assert_eq!(ErrorKind::TransportNotFound.code(), 4);
        assert_eq!(ErrorKind::ProducerNotFound.code(), 4);
        assert_eq!(ErrorKind::ConsumerNotFound.code(), 4);
        assert_eq!(ErrorKind::TransportAlreadyExists.code(), 5);
        assert_eq!(ErrorKind::InvalidState.code(), 5);
        assert_eq!(ErrorKind::EngineFailure.code(), 6);
        assert_eq!(ErrorKind::ChannelClosed.code(), 6);
        assert_eq!(ErrorKind::RoomClosed.code(), 7);
    }

    #[test]
    fn test_labels_are_snake_case() {
        let kinds = [
            ErrorKind::RoomNotFound,
            ErrorKind::TransportNotFound,
            ErrorKind::ProducerNotFound,
            ErrorKind::ConsumerNotFound,
            ErrorKind::TransportAlreadyExists,
            ErrorKind::CapabilityMismatch,
            ErrorKind::InvalidState,
            ErrorKind::RoomClosed,
            ErrorKind::EngineFailure,
            ErrorKind::ChannelClosed,
        ];
        for kind in kinds {
            let label = kind.as_str();
            assert!(
                label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c == '_'),
                "label {label} must be lowercase snake_case"
            );
        }
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let error = SignalError::new(ErrorKind::RoomNotFound, "room gone");
        assert_eq!(error.to_string(), "room_not_found: room gone");
    }

    #[test]
    fn test_wire_round_trip() {
        let error = SignalError::new(ErrorKind::TransportAlreadyExists, "send transport exists");
        let json = serde_json::to_string(&error).unwrap();
        let decoded: SignalError = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, error);
        assert_eq!(decoded.code(), 5);
    }
}
