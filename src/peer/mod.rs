pub mod connection;
pub mod ice;
pub mod types;

pub use connection::{PeerTransport, RtcPeer};
pub use types::{
    IceCandidate, NegotiationState, PeerEvent, RemoteTrackInfo, SdpKind, SessionDescription,
    TransportState,
};
