//! Published state vocabulary and the event bus fed to the UI layer.

use crate::peer::types::RemoteTrackInfo;

/// Connection lifecycle as the UI sees it.
///
/// `Failed` and `Disconnected` are both valid starting points for a fresh
/// `connect()`; nothing survives into the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Disconnected
    }
}

/// Events emitted by the session core to the application / UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session state machine moved.
    StateChanged(SessionState),
    /// A failure was surfaced; the same text lands in the error slot.
    Error(String),
    /// The remote peer's media track became available. The rendering surface
    /// waits on this to start playback.
    RemoteTrack(RemoteTrackInfo),
    /// The transport reported a transient loss; the grace period is running.
    TransportDegraded,
    /// The transport came back within the grace period.
    TransportRecovered,
}
