//! Peer-session signaling and connection-lifecycle core for real-time
//! talking-avatar clients.
//!
//! The [`SessionCoordinator`] owns a WebSocket signaling channel, a local
//! microphone capture, and a WebRTC peer session, sequences them through the
//! connect/disconnect lifecycle, and publishes connection state, typed
//! events, and a live input-level metric for the UI to consume.
//!
//! ```no_run
//! use avatarlink::{SessionConfig, SessionCoordinator};
//!
//! # async fn demo() -> Result<(), avatarlink::SessionError> {
//! let coordinator = SessionCoordinator::new(SessionConfig::from_env("ws://localhost:8000/ws/rtc"));
//! let mut events = coordinator.events();
//! coordinator.connect().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! coordinator.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod level;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{IceServerConfig, IceServerKind, MediaConstraints, SessionConfig};
pub use error::SessionError;
pub use events::{SessionEvent, SessionState};
pub use level::AudioLevelMonitor;
pub use media::LocalMediaHandle;
pub use peer::{
    IceCandidate, NegotiationState, PeerEvent, PeerTransport, RemoteTrackInfo, RtcPeer,
    SessionDescription, TransportState,
};
pub use session::{RtcBackend, SessionBackend, SessionCoordinator};
pub use signaling::{SignalMessage, SignalingHandle, SignalingSender};
