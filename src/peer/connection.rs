//! The peer session: WebRTC transport negotiation and maintenance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::media::{resample_linear, AudioFrame, LocalMediaHandle};
use crate::peer::ice::{apply_pending_candidates, candidate_init, ice_servers_from, CandidateBuffer};
use crate::peer::types::{
    IceCandidate, NegotiationState, PeerEvent, RemoteTrackInfo, SdpKind, SessionDescription,
    TransportState,
};

const OPUS_SAMPLE_RATE: u32 = 48_000;
/// 20 ms at 48 kHz.
const OPUS_FRAME_SAMPLES: usize = 960;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_OPUS_PACKET: usize = 1500;

/// The negotiated transport to the remote peer.
///
/// Implemented by [`RtcPeer`] for the real connection and by in-memory fakes
/// in the test suite.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Generates a local offer with this application's media directionality
    /// (bidirectional audio, no video) and installs it as the local
    /// description.
    async fn create_local_offer(&self) -> Result<SessionDescription, SessionError>;

    /// Installs a remote offer and synthesizes the local answer.
    async fn apply_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError>;

    /// Completes a local-offer round. Calling this without an outstanding
    /// local offer is a logic error reported to the caller.
    async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<(), SessionError>;

    /// Best-effort: a candidate that cannot be applied yet is buffered, and
    /// one the transport rejects is logged and dropped.
    async fn add_remote_candidate(&self, candidate: IceCandidate);

    /// Tears the transport down. Idempotent.
    async fn close(&self);
}

/// Peer session backed by the `webrtc` crate.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    negotiation: Mutex<NegotiationState>,
    pending: CandidateBuffer,
    closed: AtomicBool,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl RtcPeer {
    /// Builds the peer connection, attaches the local audio track fed from
    /// `media`, and wires transport events into `events`.
    pub async fn connect(
        config: &SessionConfig,
        media: &LocalMediaHandle,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<RtcPeer, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::TransportFailed(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::TransportFailed(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers_from(&config.ice_servers),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| SessionError::TransportFailed(e.to_string()))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "avatarlink".to_owned(),
        ));
        pc.add_transceiver_from_track(
            track.clone() as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| SessionError::TransportFailed(e.to_string()))?;

        // Each discovered candidate is forwarded immediately; trickle, no
        // batching.
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => warn!(%err, "failed to serialize local candidate"),
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let info = RemoteTrackInfo {
                    id: track.id(),
                    kind: track.kind().to_string(),
                };
                debug!(id = %info.id, kind = %info.kind, "remote track available");
                let _ = track_events.send(PeerEvent::RemoteTrack(info));
                Box::pin(async {})
            },
        ));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "peer connection state changed");
            if let Some(mapped) = map_transport_state(state) {
                let _ = state_events.send(PeerEvent::StateChanged(mapped));
            }
            Box::pin(async {})
        }));

        let feeder = tokio::spawn(feed_local_track(
            track,
            media.subscribe(),
            media.sample_rate(),
        ));

        Ok(RtcPeer {
            pc,
            negotiation: Mutex::new(NegotiationState::Idle),
            pending: CandidateBuffer::default(),
            closed: AtomicBool::new(false),
            feeder: Mutex::new(Some(feeder)),
        })
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn set_negotiation(&self, state: NegotiationState) {
        *self.negotiation.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SessionError::Negotiation("peer session is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_local_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_err)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            SessionError::Negotiation("local description missing after offer".into())
        })?;
        self.set_negotiation(NegotiationState::OfferSent);
        debug!("local offer installed");
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn apply_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        if offer.kind != SdpKind::Offer {
            return Err(SessionError::Negotiation(
                "expected an offer description".into(),
            ));
        }
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(negotiation_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_err)?;
        self.set_negotiation(NegotiationState::OfferReceived);
        apply_pending_candidates(&self.pc, &self.pending).await;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            SessionError::Negotiation("local description missing after answer".into())
        })?;
        self.set_negotiation(NegotiationState::AnswerExchanged);
        debug!("remote offer answered");
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<(), SessionError> {
        self.ensure_open()?;
        if answer.kind != SdpKind::Answer {
            return Err(SessionError::Negotiation(
                "expected an answer description".into(),
            ));
        }
        let state = self.negotiation_state();
        if state != NegotiationState::OfferSent {
            return Err(SessionError::Negotiation(format!(
                "received an answer with no outstanding local offer (negotiation is {state:?})"
            )));
        }
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(negotiation_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_err)?;
        apply_pending_candidates(&self.pc, &self.pending).await;
        self.set_negotiation(NegotiationState::AnswerExchanged);
        debug!("answer exchange complete");
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("dropping candidate for a closed peer session");
            return;
        }
        if self.pc.remote_description().await.is_some() {
            if let Err(err) = self.pc.add_ice_candidate(candidate_init(candidate)).await {
                warn!(%err, "failed to apply remote candidate, dropping");
            }
        } else {
            debug!("remote description not set yet, buffering candidate");
            self.pending.push(candidate);
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(feeder) = self
                .feeder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                feeder.abort();
            }
            if let Err(err) = self.pc.close().await {
                warn!(%err, "error while closing peer connection");
            }
        }
    }
}

fn negotiation_err(err: webrtc::Error) -> SessionError {
    SessionError::Negotiation(err.to_string())
}

fn map_transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Consumes capture frames, bridges them to 48 kHz, and writes Opus samples
/// into the outbound track. Runs until the capture stream closes.
async fn feed_local_track(
    track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<AudioFrame>,
    source_rate: u32,
) {
    let mut encoder = match opus::Encoder::new(
        OPUS_SAMPLE_RATE,
        opus::Channels::Mono,
        opus::Application::Voip,
    ) {
        Ok(encoder) => encoder,
        Err(err) => {
            warn!(%err, "opus encoder unavailable, local track stays silent");
            return;
        }
    };
    let mut pcm: Vec<f32> = Vec::with_capacity(OPUS_FRAME_SAMPLES * 4);
    let mut packet = vec![0u8; MAX_OPUS_PACKET];

    loop {
        match frames.recv().await {
            Ok(frame) => {
                pcm.extend(resample_linear(&frame, source_rate, OPUS_SAMPLE_RATE));
                while pcm.len() >= OPUS_FRAME_SAMPLES {
                    let chunk: Vec<f32> = pcm.drain(..OPUS_FRAME_SAMPLES).collect();
                    match encoder.encode_float(&chunk, &mut packet) {
                        Ok(len) => {
                            let sample = Sample {
                                data: Bytes::copy_from_slice(&packet[..len]),
                                duration: OPUS_FRAME_DURATION,
                                ..Default::default()
                            };
                            // Not an error before the track is bound; the
                            // transport simply has nowhere to send yet.
                            let _ = track.write_sample(&sample).await;
                        }
                        Err(err) => warn!(%err, "opus encode failed, dropping frame"),
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "encoder lagged behind capture");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn test_media() -> LocalMediaHandle {
        let (frames, _) = broadcast::channel(4);
        LocalMediaHandle::new(48_000, frames, Arc::new(AtomicBool::new(true)), || {})
    }

    fn test_config() -> SessionConfig {
        SessionConfig::new("ws://signaling.invalid/ws/rtc")
    }

    async fn test_peer() -> (RtcPeer, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let media = test_media();
        let peer = RtcPeer::connect(&test_config(), &media, tx).await.unwrap();
        (peer, rx)
    }

    #[tokio::test]
    async fn offer_answer_round_walks_the_negotiation_machine() {
        let (caller, _caller_events) = test_peer().await;
        let (callee, _callee_events) = test_peer().await;
        assert_eq!(caller.negotiation_state(), NegotiationState::Idle);

        let offer = caller.create_local_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(caller.negotiation_state(), NegotiationState::OfferSent);

        let answer = callee.apply_remote_offer(offer).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(callee.negotiation_state(), NegotiationState::AnswerExchanged);

        caller.apply_remote_answer(answer).await.unwrap();
        assert_eq!(caller.negotiation_state(), NegotiationState::AnswerExchanged);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn answer_without_outstanding_offer_is_reported() {
        let (peer, _events) = test_peer().await;
        let err = peer
            .apply_remote_answer(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        // The failed call leaves negotiation untouched.
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
        peer.close().await;
    }

    #[tokio::test]
    async fn malformed_remote_offer_is_a_negotiation_error() {
        let (peer, _events) = test_peer().await;
        let err = peer
            .apply_remote_offer(SessionDescription::offer("not sdp at all"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
        peer.close().await;
    }

    #[tokio::test]
    async fn early_candidate_is_buffered_not_dropped() {
        let (peer, _events) = test_peer().await;
        peer.add_remote_candidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.7 8189 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        })
        .await;
        assert_eq!(peer.pending_candidates(), 1);
        peer.close().await;
    }

    #[tokio::test]
    async fn closed_peer_rejects_negotiation() {
        let (peer, _events) = test_peer().await;
        peer.close().await;
        peer.close().await;
        let err = peer.create_local_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
    }
}
