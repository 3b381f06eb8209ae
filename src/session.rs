//! The session coordinator.
//!
//! Owns the three session resources (capture handle, peer session, signaling
//! channel), sequences them through the connect/disconnect lifecycle, and
//! translates their events into the published `SessionState` vocabulary.
//!
//! Every connect attempt carries an epoch. `disconnect()` bumps the epoch, so
//! resolutions arriving from a superseded attempt are discarded instead of
//! mutating current state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MediaConstraints, SessionConfig};
use crate::error::SessionError;
use crate::events::{SessionEvent, SessionState};
use crate::level::AudioLevelMonitor;
use crate::media::{acquire_microphone, LocalMediaHandle};
use crate::peer::types::{PeerEvent, RemoteTrackInfo, TransportState};
use crate::peer::{PeerTransport, RtcPeer};
use crate::signaling::{connect_signaling, SignalMessage, SignalingHandle, SignalingSender};
use crate::utils::random_id;

const EVENT_BUS_CAPACITY: usize = 64;

/// Factory for the three session resources. The default [`RtcBackend`] builds
/// the real WebSocket/cpal/WebRTC stack; tests inject in-memory fakes.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn open_signaling(&self, url: &str) -> Result<SignalingHandle, SessionError>;

    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, SessionError>;

    async fn create_peer(
        &self,
        config: &SessionConfig,
        media: &LocalMediaHandle,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SessionError>;
}

/// Production backend.
pub struct RtcBackend;

#[async_trait]
impl SessionBackend for RtcBackend {
    async fn open_signaling(&self, url: &str) -> Result<SignalingHandle, SessionError> {
        connect_signaling(url).await
    }

    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, SessionError> {
        acquire_microphone(constraints).await
    }

    async fn create_peer(
        &self,
        config: &SessionConfig,
        media: &LocalMediaHandle,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        Ok(Arc::new(RtcPeer::connect(config, media, events).await?))
    }
}

#[derive(Default)]
struct Owned {
    media: Option<LocalMediaHandle>,
    peer: Option<Arc<dyn PeerTransport>>,
    signaling: Option<SignalingHandle>,
    level: Option<AudioLevelMonitor>,
    pump: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

struct Inner {
    config: SessionConfig,
    backend: Arc<dyn SessionBackend>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    level_tx: Arc<watch::Sender<u8>>,
    level_rx: watch::Receiver<u8>,
    error: StdMutex<Option<String>>,
    remote_track: StdMutex<Option<RemoteTrackInfo>>,
    /// Last state the transport itself reported; consulted when the grace
    /// period expires.
    transport_state: StdMutex<TransportState>,
    /// Serializes state claims and epoch bumps between connect and disconnect.
    lifecycle: StdMutex<()>,
    epoch: AtomicU64,
    owned: AsyncMutex<Owned>,
}

/// The orchestrating core. Exactly one instance exists per UI session; its
/// owned resources are exclusively owned by it, and consumers only read the
/// published state or invoke the public operations.
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_backend(config, Arc::new(RtcBackend))
    }

    pub fn with_backend(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (level_tx, level_rx) = watch::channel(0u8);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                state_tx,
                events_tx,
                level_tx: Arc::new(level_tx),
                level_rx,
                error: StdMutex::new(None),
                remote_track: StdMutex::new(None),
                transport_state: StdMutex::new(TransportState::New),
                lifecycle: StdMutex::new(()),
                epoch: AtomicU64::new(0),
                owned: AsyncMutex::new(Owned::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn audio_level(&self) -> u8 {
        *self.inner.level_rx.borrow()
    }

    pub fn watch_audio_level(&self) -> watch::Receiver<u8> {
        self.inner.level_rx.clone()
    }

    /// The error slot: set on every failure, cleared on reaching `Connected`
    /// or by [`clear_error`](Self::clear_error).
    pub fn last_error(&self) -> Option<String> {
        self.inner.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_error(&self) {
        *self.inner.error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The remote media track, once negotiation made one available.
    pub fn remote_track(&self) -> Option<RemoteTrackInfo> {
        self.inner
            .remote_track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Builds a fresh session: capture, signaling channel, peer session, then
    /// announces readiness to the remote side.
    ///
    /// Returns once the pipeline is wired; `Connected` arrives through the
    /// published state when the transport lands. Valid from `Disconnected`
    /// and `Failed`; rejected with `AlreadyActive` elsewhere.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.inner.config.validate()?;
        let epoch = self.inner.try_begin_connect()?;
        let attempt = random_id();
        info!(attempt, url = %self.inner.config.signaling_url, "connecting");

        // Step 1: capture. A failure here leaves no partial session behind,
        // so the state returns to Disconnected rather than Failed.
        let media = match self
            .inner
            .backend
            .acquire_media(&self.inner.config.media)
            .await
        {
            Ok(media) => media,
            Err(err) => {
                warn!(attempt, %err, "media acquisition failed");
                self.inner.abort_attempt(epoch, &err);
                return Err(err);
            }
        };
        let level = AudioLevelMonitor::spawn(media.subscribe(), self.inner.level_tx.clone());

        // Step 2: signaling.
        let mut signaling = match self
            .inner
            .backend
            .open_signaling(&self.inner.config.signaling_url)
            .await
        {
            Ok(signaling) => signaling,
            Err(err) => {
                warn!(attempt, %err, "signaling open failed");
                level.stop();
                media.release();
                self.inner.abort_attempt(epoch, &err);
                return Err(err);
            }
        };
        let Some(inbound) = signaling.take_inbound() else {
            let err = SessionError::ChannelUnavailable("inbound stream already taken".into());
            level.stop();
            media.release();
            signaling.close();
            self.inner.abort_attempt(epoch, &err);
            return Err(err);
        };
        let sender = signaling.sender();

        // Step 3: peer session.
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = match self
            .inner
            .backend
            .create_peer(&self.inner.config, &media, peer_tx)
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                warn!(attempt, %err, "peer session creation failed");
                level.stop();
                media.release();
                signaling.close();
                self.inner.abort_attempt(epoch, &err);
                return Err(err);
            }
        };

        // Hand everything to the coordinator in one guarded step; a
        // disconnect issued while we were acquiring wins here.
        let pump = tokio::spawn(run_pump(
            self.inner.clone(),
            epoch,
            inbound,
            peer_rx,
            peer.clone(),
            sender.clone(),
        ));
        {
            let mut owned = self.inner.owned.lock().await;
            if !self.inner.is_current(epoch) {
                drop(owned);
                debug!(attempt, "connect superseded, releasing fresh resources");
                pump.abort();
                level.stop();
                media.release();
                peer.close().await;
                signaling.close();
                return Err(SessionError::Cancelled);
            }
            owned.media = Some(media);
            owned.peer = Some(peer);
            owned.signaling = Some(signaling);
            owned.level = Some(level);
            owned.pump = Some(pump);
        }

        // Local resources are initialized; the remote side may offer now.
        if let Err(err) = sender.send(SignalMessage::Ready) {
            warn!(attempt, %err, "failed to announce readiness");
            self.inner.teardown_owned(epoch, true).await;
            self.inner.abort_attempt(epoch, &err);
            return Err(err);
        }
        debug!(attempt, "ready sent, awaiting negotiation");
        Ok(())
    }

    /// Releases every owned resource (capture, peer session, signaling
    /// channel, in that order) and returns the state to `Disconnected`.
    /// Safe from any state, any number of times, including while a connect
    /// attempt is still in flight.
    pub async fn disconnect(&self) {
        let epoch = {
            let _guard = self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!("disconnecting");
        self.inner.teardown_owned(epoch, true).await;
        if self.inner.is_current(epoch) {
            self.inner.set_state(SessionState::Disconnected);
        }
    }

    /// Flips the microphone's track flag and returns the resulting state.
    /// Rejected with `NotConnected` while not connected; never touches
    /// `SessionState`.
    pub async fn toggle_microphone(&self) -> Result<bool, SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let owned = self.inner.owned.lock().await;
        match owned.media.as_ref() {
            Some(media) => Ok(media.toggle()),
            None => Err(SessionError::NotConnected),
        }
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "session state changed");
            if next == SessionState::Connected {
                *self.error.lock().unwrap_or_else(|e| e.into_inner()) = None;
            }
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    /// Claims the `Connecting` slot and a fresh epoch, or reports a live
    /// session.
    fn try_begin_connect(&self) -> Result<u64, SessionError> {
        let _guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let current = *self.state_tx.borrow();
        if matches!(current, SessionState::Connecting | SessionState::Connected) {
            return Err(SessionError::AlreadyActive);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Connecting);
        Ok(epoch)
    }

    /// Publishes exactly one error notification.
    fn publish_error(&self, err: &SessionError) {
        let message = err.to_string();
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
        self.emit(SessionEvent::Error(message));
    }

    /// A connect step failed before the session existed: back to
    /// `Disconnected`, surface the error. Stale attempts stay silent.
    fn abort_attempt(&self, epoch: u64, err: &SessionError) {
        if self.is_current(epoch) {
            self.set_state(SessionState::Disconnected);
            self.publish_error(err);
        }
    }

    /// Drains and releases every owned resource, in the documented order,
    /// provided `epoch` is still current. Idempotent by construction: a
    /// second call finds nothing to take.
    async fn teardown_owned(&self, epoch: u64, abort_pump: bool) {
        let taken = {
            let mut owned = self.owned.lock().await;
            if !self.is_current(epoch) {
                return;
            }
            std::mem::take(&mut *owned)
        };

        if let Some(grace) = taken.grace {
            grace.abort();
        }
        if abort_pump {
            if let Some(pump) = taken.pump {
                pump.abort();
            }
        }
        if let Some(level) = taken.level {
            level.stop();
        }
        if let Some(media) = taken.media {
            media.release();
        }
        let _ = self.level_tx.send(0);
        if let Some(peer) = taken.peer {
            peer.close().await;
        }
        if let Some(signaling) = taken.signaling {
            signaling.close();
        }
        *self.remote_track.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self
            .transport_state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = TransportState::New;
    }

    /// Invalidates the current attempt so late resolutions from it are
    /// discarded.
    fn supersede(&self) {
        let _guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Established-session failure: resources destroyed, state `Failed`,
    /// manual reconnect required.
    async fn fail(&self, epoch: u64, err: SessionError) {
        if !self.is_current(epoch) {
            return;
        }
        self.teardown_owned(epoch, false).await;
        self.set_state(SessionState::Failed);
        self.publish_error(&err);
        self.supersede();
    }

    /// Offer/answer-level negotiation failure: same handling as a resource
    /// acquisition failure.
    async fn abort_negotiation(&self, epoch: u64, err: SessionError) {
        if !self.is_current(epoch) {
            return;
        }
        self.teardown_owned(epoch, false).await;
        self.set_state(SessionState::Disconnected);
        self.publish_error(&err);
        self.supersede();
    }

    /// The signaling channel closed underneath us.
    async fn on_channel_closed(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        if *self.state_tx.borrow() == SessionState::Failed {
            return;
        }
        debug!("signaling channel closed, releasing session");
        self.teardown_owned(epoch, false).await;
        self.set_state(SessionState::Disconnected);
        self.supersede();
    }

    async fn cancel_grace(&self) {
        if let Some(grace) = self.owned.lock().await.grace.take() {
            grace.abort();
        }
    }

    /// Starts the recovery window for a transient transport loss. A pending
    /// window is left running.
    async fn start_grace(self: &Arc<Self>, epoch: u64) {
        let mut owned = self.owned.lock().await;
        if owned.grace.is_some() || !self.is_current(epoch) {
            return;
        }
        let inner = self.clone();
        owned.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.config.grace_period).await;
            let recovered = *inner
                .transport_state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                == TransportState::Connected;
            if inner.is_current(epoch) && !recovered {
                warn!("transport did not recover within the grace period");
                // Detach our own handle so the teardown below cannot abort
                // this task mid-release.
                inner.owned.lock().await.grace.take();
                inner
                    .fail(
                        epoch,
                        SessionError::TransportFailed(
                            "transport did not recover from a connection loss".into(),
                        ),
                    )
                    .await;
            }
        }));
    }
}

/// Drives one connect attempt: applies inbound signaling in receipt order,
/// forwards peer events, and enforces the negotiation timeout. Exits when the
/// attempt ends, whichever way.
async fn run_pump(
    inner: Arc<Inner>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    peer: Arc<dyn PeerTransport>,
    signaling: SignalingSender,
) {
    let deadline = tokio::time::sleep(inner.config.negotiation_timeout);
    tokio::pin!(deadline);
    let mut connected_once = false;
    let mut degraded = false;

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    if !handle_signal(&inner, epoch, peer.as_ref(), &signaling, message).await {
                        break;
                    }
                }
                None => {
                    inner.on_channel_closed(epoch).await;
                    break;
                }
            },
            event = peer_events.recv() => match event {
                Some(event) => match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        // Forwarded as discovered; negotiation latency beats
                        // batching.
                        if let Err(err) = signaling.send(SignalMessage::IceCandidate { candidate }) {
                            warn!(%err, "could not forward local candidate");
                        }
                    }
                    PeerEvent::RemoteTrack(info) => {
                        if inner.is_current(epoch) {
                            *inner
                                .remote_track
                                .lock()
                                .unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
                            inner.emit(SessionEvent::RemoteTrack(info));
                        }
                    }
                    PeerEvent::StateChanged(transport) => {
                        if !inner.is_current(epoch) {
                            break;
                        }
                        *inner
                            .transport_state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner()) = transport;
                        match transport {
                            TransportState::Connected => {
                                inner.cancel_grace().await;
                                if degraded {
                                    degraded = false;
                                    inner.emit(SessionEvent::TransportRecovered);
                                }
                                connected_once = true;
                                inner.set_state(SessionState::Connected);
                            }
                            TransportState::Failed => {
                                inner
                                    .fail(
                                        epoch,
                                        SessionError::TransportFailed(
                                            "peer transport failed".into(),
                                        ),
                                    )
                                    .await;
                                break;
                            }
                            TransportState::Disconnected => {
                                // Transient by policy: brief network blips do
                                // not tear down UI state.
                                if !degraded {
                                    degraded = true;
                                    inner.emit(SessionEvent::TransportDegraded);
                                }
                                inner.start_grace(epoch).await;
                            }
                            TransportState::Closed => {
                                inner.on_channel_closed(epoch).await;
                                break;
                            }
                            TransportState::New | TransportState::Connecting => {}
                        }
                    }
                },
                None => break,
            },
            _ = &mut deadline, if !connected_once => {
                inner
                    .fail(
                        epoch,
                        SessionError::TransportFailed("negotiation timed out".into()),
                    )
                    .await;
                break;
            }
        }
    }
}

/// Applies one inbound signaling message. Returns `false` when the attempt is
/// over.
async fn handle_signal(
    inner: &Arc<Inner>,
    epoch: u64,
    peer: &dyn PeerTransport,
    signaling: &SignalingSender,
    message: SignalMessage,
) -> bool {
    match message {
        // Callee-waits role: the remote's readiness is our cue to offer.
        SignalMessage::Ready => match peer.create_local_offer().await {
            Ok(offer) => {
                debug!("sending offer");
                if let Err(err) = signaling.send(SignalMessage::Offer { offer }) {
                    warn!(%err, "could not send offer");
                }
                true
            }
            Err(err) => {
                inner.abort_negotiation(epoch, err).await;
                false
            }
        },
        SignalMessage::Offer { offer } => match peer.apply_remote_offer(offer).await {
            Ok(answer) => {
                debug!("answering remote offer");
                if let Err(err) = signaling.send(SignalMessage::Answer { answer }) {
                    warn!(%err, "could not send answer");
                }
                true
            }
            Err(err) => {
                inner.abort_negotiation(epoch, err).await;
                false
            }
        },
        SignalMessage::Answer { answer } => match peer.apply_remote_answer(answer).await {
            Ok(()) => true,
            Err(err) => {
                inner.abort_negotiation(epoch, err).await;
                false
            }
        },
        SignalMessage::IceCandidate { candidate } => {
            peer.add_remote_candidate(candidate).await;
            true
        }
    }
}
