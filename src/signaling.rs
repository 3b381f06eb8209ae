//! WebSocket signaling channel.
//!
//! A persistent, ordered, message-oriented connection to the signaling server
//! that relays session-negotiation messages between the two peers. JSON text
//! frames, tagged by `"type"`, matching the wire format the avatar backend
//! speaks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::peer::types::{IceCandidate, SessionDescription};

/// Session-negotiation messages relayed through the signaling server.
///
/// Ordering within one direction is significant and preserved by the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// A session description offer.
    Offer { offer: SessionDescription },
    /// The answer completing an offer.
    Answer { answer: SessionDescription },
    /// One ICE candidate, forwarded as discovered (trickle).
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidate },
    /// Sent by a peer once its local resources are initialized; the other
    /// side may begin offering.
    Ready,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Cheap clone of the channel's sending half, used by the coordinator's pump
/// to forward candidates while the handle itself stays with the owner.
#[derive(Clone)]
pub struct SignalingSender {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    closed: Arc<AtomicBool>,
}

impl SignalingSender {
    pub fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelUnavailable(
                "signaling channel is closed".into(),
            ));
        }
        self.outbound
            .send(message)
            .map_err(|_| SessionError::ChannelUnavailable("signaling channel went away".into()))
    }
}

/// An open signaling channel.
///
/// Outbound messages are serialized and written in submission order; inbound
/// messages arrive on the receiver returned by [`take_inbound`] in receipt
/// order. The inbound stream ending means the channel closed, whether locally
/// or by the server.
///
/// [`take_inbound`]: SignalingHandle::take_inbound
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    inbound: Option<mpsc::UnboundedReceiver<SignalMessage>>,
    closed: Arc<AtomicBool>,
    close_hook: Mutex<Option<CloseHook>>,
}

impl SignalingHandle {
    /// Assembles a handle from raw channel halves. Used by the WebSocket
    /// transport below and by in-memory channels in tests.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<SignalMessage>,
        inbound: mpsc::UnboundedReceiver<SignalMessage>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            closed: Arc::new(AtomicBool::new(false)),
            close_hook: Mutex::new(Some(Box::new(on_close))),
        }
    }

    /// Queues a message for the server. Fails once the channel is closed;
    /// callers must not send before open confirmation (the handle itself is
    /// the confirmation).
    pub fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelUnavailable(
                "signaling channel is closed".into(),
            ));
        }
        self.outbound
            .send(message)
            .map_err(|_| SessionError::ChannelUnavailable("signaling channel went away".into()))
    }

    /// Takes the inbound receiver. Yields each message in receipt order and
    /// `None` once the channel closes. Can only be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<SignalMessage>> {
        self.inbound.take()
    }

    pub fn sender(&self) -> SignalingSender {
        SignalingSender {
            outbound: self.outbound.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Closes the channel. Idempotent: closing an already-closed channel is a
    /// no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.close_hook.lock().unwrap_or_else(|e| e.into_inner()).take() {
                hook();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the WebSocket connection to the signaling server.
///
/// Returns a connected handle, or `ChannelUnavailable` if the underlying
/// transport cannot be established.
pub async fn connect_signaling(url: &str) -> Result<SignalingHandle, SessionError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SessionError::ChannelUnavailable(e.to_string()))?;
    debug!(url, "signaling channel open");

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    // Writer: serialize outbound messages in submission order; a close
    // request sends the close frame and stops the pump.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(err) => {
                                warn!(%err, "failed to encode signaling message");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: forward frames in receipt order. Malformed frames are logged
    // and skipped, not fatal. Dropping `in_tx` ends the inbound stream, which
    // is how the coordinator learns the channel closed.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "dropping unparseable signaling frame"),
                },
                Ok(Message::Close(_)) => {
                    debug!("signaling server closed the channel");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "signaling socket error");
                    break;
                }
            }
        }
    });

    Ok(SignalingHandle::from_parts(out_tx, in_rx, move || {
        let _ = close_tx.send(());
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn offer_matches_wire_format() {
        let msg = SignalMessage::Offer {
            offer: SessionDescription::offer("v=0\r\n"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"offer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n\""));
    }

    #[test]
    fn answer_matches_wire_format() {
        let msg = SignalMessage::Answer {
            answer: SessionDescription::answer("v=0\r\n"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"answer\""));
        assert!(json.contains("\"type\":\"answer\",\"answer\""));
    }

    #[test]
    fn candidate_uses_camel_case_fields() {
        let json = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        match msg {
            SignalMessage::IceCandidate { candidate } => {
                assert!(candidate.candidate.contains("typ host"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected ice-candidate, got {other:?}"),
        }
    }

    #[test]
    fn ready_has_no_payload() {
        assert_eq!(
            serde_json::to_string(&SignalMessage::Ready).unwrap(),
            r#"{"type":"ready"}"#
        );
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Ready);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let handle = SignalingHandle::from_parts(out_tx, in_rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.close();
        handle.close();
        handle.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());
        assert!(handle.send(SignalMessage::Ready).is_err());
    }
}
