//! ICE candidate plumbing: the early-arrival buffer and server configuration.

use std::sync::Mutex;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::IceServerConfig;
use crate::peer::types::IceCandidate;
use crate::utils::add_ice_url_scheme;

/// Candidates received before the remote description is set are held here and
/// applied once it lands, never dropped for arriving early.
#[derive(Default)]
pub struct CandidateBuffer {
    pending: Mutex<Vec<IceCandidate>>,
}

impl CandidateBuffer {
    pub fn push(&self, candidate: IceCandidate) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidate);
    }

    pub fn drain(&self) -> Vec<IceCandidate> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

/// Applies every buffered candidate after the remote description was set.
/// Individual failures are logged and dropped; candidates are best-effort.
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, buffer: &CandidateBuffer) {
    for candidate in buffer.drain() {
        debug!(candidate = %candidate.candidate, "applying buffered remote candidate");
        if let Err(err) = pc.add_ice_candidate(candidate_init(candidate)).await {
            warn!(%err, "failed to apply buffered candidate, dropping");
        }
    }
}

pub fn ice_servers_from(configs: &[IceServerConfig]) -> Vec<RTCIceServer> {
    configs
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2130706431 192.168.1.{n} 8189 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn buffer_preserves_arrival_order() {
        let buffer = CandidateBuffer::default();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        buffer.push(candidate(3));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained[0].candidate.contains("192.168.1.1"));
        assert!(drained[2].candidate.contains("192.168.1.3"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_on_empty_buffer_is_fine() {
        let buffer = CandidateBuffer::default();
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn server_mapping_normalizes_schemes() {
        let servers = ice_servers_from(&[
            IceServerConfig::stun("stun.l.google.com:19302"),
            IceServerConfig::turn("turn.example.org:3478", "user", "secret"),
        ]);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }
}
