//! Client-side error types.

use signal_protocol::SignalError;

/// Errors raised by client session operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The broker rejected a signaling request.
    #[error("signaling request failed: {0}")]
    Signal(#[from] SignalError),

    /// Operation issued outside its lifecycle window.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The broker answered a request with the wrong response variant.
    /// Indicates a protocol bug, not a user error.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    /// The local media device failed.
    #[error("media device failed: {0}")]
    Device(String),

    /// The session actor is gone (left, or the channel died).
    #[error("session closed")]
    SessionClosed,
}
