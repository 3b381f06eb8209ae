use thiserror::Error;

/// Failure classes surfaced by the session core.
///
/// Precondition violations (`NotConnected`, `AlreadyActive`) are returned
/// synchronously and never change session state. Everything else aborts or
/// degrades the session and is also published on the event bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("peer transport failed: {0}")]
    TransportFailed(String),

    #[error("no active session")]
    NotConnected,

    #[error("a session is already connecting or connected")]
    AlreadyActive,

    #[error("connect attempt superseded by disconnect")]
    Cancelled,
}
