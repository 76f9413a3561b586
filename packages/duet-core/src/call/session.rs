//! # Call Session
//!
//! One call's lifecycle, from the first offer to teardown.
//!
//! ## State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CALL STATUS                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │            call()                          remote stream                │
//! │   idle ─────────────────► calling ──────────────────────┐               │
//! │    │                                                    ▼               │
//! │    │ incoming offer          answer()        remote stream              │
//! │    └────────────► ringing ───────────► answering ─────► in-call         │
//! │                                                                         │
//! │   any ──► idle  on hangup(), call-hangup, peer close, ring timeout      │
//! │                 or an exhausted re-negotiation budget                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Interleaving
//!
//! Every intent suspends at media acquisition and peer construction, and
//! relay or peer events may be handled in between. Each session carries a
//! generation number, bumped when a session starts or is torn down; an async
//! result whose generation no longer matches is discarded and its resources
//! released. Events from a peer that is no longer current are dropped by
//! peer id.
//!
//! Candidates that arrive before the peer exists are buffered. When the peer
//! is built, the remembered offer is fed first and the buffered candidates
//! follow in arrival order, before any other signal reaches the peer.
//! Candidates from the user whose session just ended are dropped until that
//! user sends a new offer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::call::backlog::IceBacklog;
use crate::call::config::{BusyPolicy, CallConfig};
use crate::call::media::{
    AcquiredMedia, MediaConstraints, MediaController, MediaDevices, MediaStream, SwapOutcome,
    TrackKind, VideoConstraint,
};
use crate::call::peer::{PeerConfig, PeerConnector, PeerEnvelope, PeerEvent, PeerEventSink, PeerId, PeerSession};
use crate::call::signal::SignalKind;
use crate::error::{Error, Result};
use crate::network::relay_client::{RelayClientMessage, RelaySender, RelayServerMessage, RelayStatus};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Where the call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Ringing,
    Answering,
    InCall,
}

impl CallStatus {
    pub fn is_idle(self) -> bool {
        self == CallStatus::Idle
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Answering => "answering",
            CallStatus::InCall => "in-call",
        };
        f.write_str(s)
    }
}

/// User-visible conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Video could not be opened; continuing audio-only
    MediaFallback,
    /// No usable local media; the call attempt was abandoned
    MediaUnavailable(String),
    /// Re-negotiation budget exhausted; the call was ended
    ConnectionLost,
    /// Nobody answered in time
    CallTimedOut { user_id: String },
    /// An incoming call ended before it was answered
    MissedCall { from_user_id: String },
}

/// Everything the session reports to its owner.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged(CallStatus),
    IncomingCall { from_user_id: String },
    /// The stream to render locally. The same stream is re-sent after an
    /// in-place device swap; `None` clears the preview.
    LocalPreview(Option<MediaStream>),
    RemoteStream(Option<MediaStream>),
    Notice(Notice),
    Presence(Vec<String>),
    Relay(RelayStatus),
}

/// Receivers handed back by [`CallSession::new`].
pub struct SessionChannels {
    /// Session events for the UI
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    /// Peer events; feed them to [`CallSession::handle_peer_event`]
    pub peer_events: mpsc::UnboundedReceiver<PeerEnvelope>,
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    /// Initiator: when to re-negotiate
    due: Option<Instant>,
    /// Answerer: when to stop waiting for the caller's new offer
    offer_deadline: Option<Instant>,
}

struct SessionState {
    status: CallStatus,
    generation: u64,
    peer_user: Option<String>,
    pending_offer: Option<Value>,
    initiator: bool,
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    peer: Option<Arc<dyn PeerSession>>,
    peer_id: Option<PeerId>,
    next_peer_id: PeerId,
    backlog: IceBacklog,
    /// Peer of the last session torn down; its late candidates are stale
    ended_peer: Option<String>,
    muted: bool,
    video_off: bool,
    constraints: MediaConstraints,
    ring_deadline: Option<Instant>,
    retry: RetryState,
    online: Vec<String>,
}

impl SessionState {
    /// Local media that can still be used.
    fn live_local(&self) -> Option<MediaStream> {
        self.local
            .clone()
            .filter(|s| s.tracks().iter().any(|t| !t.is_stopped()))
    }

    fn is_peer(&self, user_id: &str) -> bool {
        self.peer_user.as_deref() == Some(user_id)
    }
}

struct Inner {
    user_id: String,
    config: CallConfig,
    media: MediaController,
    connector: Arc<dyn PeerConnector>,
    relay: RelaySender,
    events: mpsc::UnboundedSender<CallEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEnvelope>,
    state: Mutex<SessionState>,
    /// Held while feeding a peer so replays and live signals never interleave
    signal_order: AsyncMutex<()>,
    /// Serializes device swaps
    swap_serial: AsyncMutex<()>,
}

/// Result of a retry decision.
enum RetryStep {
    Scheduled,
    Exhausted(Option<String>),
}

/// What a timer poll decided to do once the state lock is released.
enum TimerAction {
    Nothing,
    RingTimeout { target: Option<String>, was_calling: bool },
    Renegotiate { generation: u64, local: MediaStream },
    GiveUp { target: Option<String> },
}

/// What to do with an `incoming-call` once the state lock is released.
enum OfferStep {
    Ignore,
    Decline,
    Deliver(Arc<dyn PeerSession>, PeerId, Value),
    RestartAnswerer { generation: u64, local: MediaStream, offer: Value },
}

// ============================================================================
// SESSION
// ============================================================================

/// The call-session state machine for one local user.
///
/// Cheap to clone; clones drive the same session. UI intents are methods
/// on this type, and relay frames, peer events and timer ticks are fed in
/// through the `handle_*`/`poll_timers` methods, normally by a
/// [`CallClient`](crate::call::CallClient).
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<Inner>,
}

impl CallSession {
    pub fn new(
        user_id: impl Into<String>,
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        relay: RelaySender,
    ) -> (Self, SessionChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let constraints = config.constraints.clone();

        let session = Self {
            inner: Arc::new(Inner {
                user_id: user_id.into(),
                config,
                media: MediaController::new(devices),
                connector,
                relay,
                events: events_tx,
                peer_tx,
                state: Mutex::new(SessionState {
                    status: CallStatus::Idle,
                    generation: 0,
                    peer_user: None,
                    pending_offer: None,
                    initiator: false,
                    local: None,
                    remote: None,
                    peer: None,
                    peer_id: None,
                    next_peer_id: 1,
                    backlog: IceBacklog::new(),
                    ended_peer: None,
                    muted: false,
                    video_off: false,
                    constraints,
                    ring_deadline: None,
                    retry: RetryState::default(),
                    online: Vec::new(),
                }),
                signal_order: AsyncMutex::new(()),
                swap_serial: AsyncMutex::new(()),
            }),
        };
        let channels = SessionChannels {
            events: events_rx,
            peer_events: peer_rx,
        };
        (session, channels)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn status(&self) -> CallStatus {
        self.inner.state.lock().status
    }

    /// The user on the other end of the current (or ringing) call.
    pub fn peer_user(&self) -> Option<String> {
        self.inner.state.lock().peer_user.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.state.lock().muted
    }

    pub fn is_video_off(&self) -> bool {
        self.inner.state.lock().video_off
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.state.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.state.lock().remote.clone()
    }

    /// Last presence list received from the relay.
    pub fn online_users(&self) -> Vec<String> {
        self.inner.state.lock().online.clone()
    }

    /// Candidates waiting for a peer session.
    pub fn pending_candidates(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    // ------------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------------

    /// Call `target`: acquire media, build an initiating peer and send the offer.
    pub async fn call(&self, target: &str) -> Result<()> {
        let target = target.trim();
        let (generation, local) = {
            let mut st = self.inner.state.lock();
            if !st.status.is_idle() || target.is_empty() {
                return Err(Error::InvalidState {
                    action: "call",
                    status: st.status.to_string(),
                });
            }
            st.generation += 1;
            st.peer_user = Some(target.to_string());
            st.initiator = true;
            st.retry = RetryState::default();
            st.ring_deadline = self.inner.config.ring_timeout.map(|t| Instant::now() + t);
            self.set_status(&mut st, CallStatus::Calling);
            (st.generation, st.live_local())
        };
        tracing::info!(target, "Placing call");

        let Some(local) = self.ensure_local(generation, local).await? else {
            return Ok(());
        };
        self.start_peer(generation, true, local, None).await
    }

    /// Answer the ringing call: acquire media, build an answering peer and
    /// feed it the remembered offer.
    pub async fn answer(&self) -> Result<()> {
        let (generation, offer, local) = {
            let mut st = self.inner.state.lock();
            match st.status {
                CallStatus::Ringing => {}
                CallStatus::Idle => return Err(Error::NoPendingOffer),
                other => {
                    return Err(Error::InvalidState {
                        action: "answer",
                        status: other.to_string(),
                    })
                }
            }
            let offer = st.pending_offer.take().ok_or(Error::NoPendingOffer)?;
            st.ring_deadline = None;
            self.set_status(&mut st, CallStatus::Answering);
            (st.generation, offer, st.live_local())
        };
        tracing::info!(caller = self.peer_user().as_deref().unwrap_or("-"), "Answering call");

        let Some(local) = self.ensure_local(generation, local).await? else {
            return Ok(());
        };
        self.start_peer(generation, false, local, Some(offer)).await
    }

    /// End the call. Safe in any state; only the first call after a session
    /// starts notifies the remote side.
    pub fn hangup(&self) {
        let target = {
            let mut st = self.inner.state.lock();
            if st.status.is_idle() {
                return;
            }
            self.cleanup(&mut st)
        };
        tracing::info!(peer = target.as_deref().unwrap_or("-"), "Hung up");
        self.send_hangup(target);
    }

    /// Mute or unmute the microphone. Returns the new muted state.
    pub fn toggle_mute(&self) -> Result<bool> {
        let mut st = self.inner.state.lock();
        let local = st.local.clone().ok_or(Error::NoLocalMedia)?;
        let muted = !st.muted;
        MediaController::set_track_enabled(&local, TrackKind::Audio, !muted).ok_or(Error::NoLocalMedia)?;
        st.muted = muted;
        Ok(muted)
    }

    /// Turn the camera feed off or on. Returns the new video-off state.
    pub fn toggle_video(&self) -> Result<bool> {
        let mut st = self.inner.state.lock();
        let local = st.local.clone().ok_or(Error::NoLocalMedia)?;
        let video_off = !st.video_off;
        MediaController::set_track_enabled(&local, TrackKind::Video, !video_off).ok_or(Error::NoLocalMedia)?;
        st.video_off = video_off;
        Ok(video_off)
    }

    /// Open local media before a call. The next `call` or `answer` reuses it.
    pub async fn start_preview(&self) -> Result<MediaStream> {
        let (generation, constraints) = {
            let st = self.inner.state.lock();
            if let Some(local) = st.live_local() {
                return Ok(local);
            }
            if !st.status.is_idle() {
                return Err(Error::InvalidState {
                    action: "start a preview",
                    status: st.status.to_string(),
                });
            }
            (st.generation, st.constraints.clone())
        };

        let acquired = match self.inner.media.acquire(&constraints).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.emit(CallEvent::Notice(Notice::MediaUnavailable(e.to_string())));
                return Err(e);
            }
        };

        let mut st = self.inner.state.lock();
        if st.generation != generation || st.local.is_some() {
            acquired.stream.stop_all();
            return Err(Error::InvalidState {
                action: "start a preview",
                status: st.status.to_string(),
            });
        }
        st.local = Some(acquired.stream.clone());
        self.emit(CallEvent::LocalPreview(Some(acquired.stream.clone())));
        if acquired.fell_back {
            self.emit(CallEvent::Notice(Notice::MediaFallback));
        }
        Ok(acquired.stream)
    }

    /// Release a pre-call preview.
    pub fn stop_preview(&self) {
        let mut st = self.inner.state.lock();
        if !st.status.is_idle() {
            return;
        }
        if let Some(local) = st.local.take() {
            local.stop_all();
            self.emit(CallEvent::LocalPreview(None));
        }
    }

    /// Switch the camera. Also becomes the video device for later calls.
    pub async fn swap_video_device(&self, video: VideoConstraint) -> Result<SwapOutcome> {
        let _serial = self.inner.swap_serial.lock().await;

        let (generation, peer_id, local, peer) = {
            let mut st = self.inner.state.lock();
            st.constraints.video = video.clone();
            let Some(local) = st.local.clone() else {
                return Ok(SwapOutcome::NoLocalMedia);
            };
            if st.peer_id.is_some() && st.peer.is_none() {
                return Err(Error::InvalidState {
                    action: "swap video device",
                    status: "connecting".to_string(),
                });
            }
            (st.generation, st.peer_id, local, st.peer.clone())
        };

        let inner = self.inner.clone();
        let has_peer = peer.is_some();
        let still_current = move || {
            let st = inner.state.lock();
            st.generation == generation && st.peer_id == peer_id && st.peer.is_some() == has_peer
        };

        let outcome = self
            .inner
            .media
            .swap_video(&local, peer.as_ref(), video, still_current)
            .await?;
        tracing::info!(?outcome, "Video device swap finished");

        match outcome {
            SwapOutcome::Swapped | SwapOutcome::PreviewOnly => {
                self.emit(CallEvent::LocalPreview(Some(local)));
            }
            SwapOutcome::RestartRequired => self.restart_call(generation).await?,
            _ => {}
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Apply one frame from the relay.
    pub async fn handle_relay_message(&self, msg: RelayServerMessage) {
        match msg {
            RelayServerMessage::OnlineList(users) => {
                self.inner.state.lock().online = users.clone();
                self.emit(CallEvent::Presence(users));
            }
            RelayServerMessage::IncomingCall {
                from_user_id,
                signal_data,
            } => self.on_incoming_call(from_user_id, signal_data).await,
            RelayServerMessage::CallAnswered {
                from_user_id,
                signal_data,
            } => self.on_call_answered(&from_user_id, signal_data).await,
            RelayServerMessage::IceCandidate {
                from_user_id,
                candidate,
            } => self.on_remote_candidate(from_user_id, candidate).await,
            RelayServerMessage::CallHangup { from_user_id } => self.on_remote_hangup(&from_user_id),
            RelayServerMessage::Pong => {}
            RelayServerMessage::Error { message } => {
                tracing::warn!(message = message.as_str(), "Relay rejected a message");
            }
        }
    }

    /// Forward a relay connection status change to the owner.
    pub fn handle_relay_status(&self, status: RelayStatus) {
        self.emit(CallEvent::Relay(status));
    }

    /// Apply one event from a peer session.
    pub async fn handle_peer_event(&self, envelope: PeerEnvelope) {
        let PeerEnvelope { peer_id, event } = envelope;
        match event {
            PeerEvent::Signal(data) => self.on_local_signal(peer_id, data),
            PeerEvent::Stream(stream) => self.on_remote_stream(peer_id, stream),
            PeerEvent::Connected => {
                let mut st = self.inner.state.lock();
                if st.peer_id == Some(peer_id) {
                    st.retry = RetryState::default();
                }
            }
            PeerEvent::Failed(reason) | PeerEvent::Error(reason) => {
                self.on_negotiation_failure(peer_id, &Error::NegotiationFailed(reason));
            }
            PeerEvent::Close => {
                let target = {
                    let mut st = self.inner.state.lock();
                    if st.status.is_idle() || st.peer_id != Some(peer_id) {
                        return;
                    }
                    tracing::info!("Peer session closed");
                    self.cleanup(&mut st)
                };
                self.send_hangup(target);
            }
        }
    }

    /// Run due timers: ring timeout and scheduled re-negotiations.
    pub async fn poll_timers(&self, now: Instant) {
        let action = {
            let mut st = self.inner.state.lock();
            let ringing = matches!(st.status, CallStatus::Calling | CallStatus::Ringing);
            if ringing && st.ring_deadline.is_some_and(|d| d <= now) {
                let was_calling = st.status == CallStatus::Calling;
                TimerAction::RingTimeout {
                    target: self.cleanup(&mut st),
                    was_calling,
                }
            } else if st.retry.due.is_some_and(|d| d <= now) {
                st.retry.due = None;
                match st.live_local() {
                    Some(local) if st.initiator => TimerAction::Renegotiate {
                        generation: st.generation,
                        local,
                    },
                    _ if st.peer.is_none() => TimerAction::GiveUp {
                        target: self.cleanup(&mut st),
                    },
                    _ => TimerAction::Nothing,
                }
            } else if st.retry.offer_deadline.is_some_and(|d| d <= now) {
                st.retry.offer_deadline = None;
                if st.peer.is_none() {
                    tracing::info!("No new offer from caller");
                    TimerAction::GiveUp {
                        target: self.cleanup(&mut st),
                    }
                } else {
                    TimerAction::Nothing
                }
            } else {
                TimerAction::Nothing
            }
        };

        match action {
            TimerAction::Nothing => {}
            TimerAction::RingTimeout { target, was_calling } => {
                let user_id = target.clone().unwrap_or_default();
                tracing::info!(peer = user_id.as_str(), "Ring timeout");
                self.send_hangup(target);
                let notice = if was_calling {
                    Notice::CallTimedOut { user_id }
                } else {
                    Notice::MissedCall { from_user_id: user_id }
                };
                self.emit(CallEvent::Notice(notice));
            }
            TimerAction::Renegotiate { generation, local } => {
                tracing::info!("Re-negotiating peer session");
                if let Err(e) = self.start_peer(generation, true, local, None).await {
                    tracing::warn!(error = %e, "Re-negotiation failed");
                }
            }
            TimerAction::GiveUp { target } => self.give_up(target),
        }
    }

    // ------------------------------------------------------------------------
    // Relay handlers
    // ------------------------------------------------------------------------

    async fn on_incoming_call(&self, from: String, data: Value) {
        let kind = SignalKind::of(&data);
        let step = {
            let mut st = self.inner.state.lock();
            let from_peer = st.is_peer(&from);
            match (st.status, kind) {
                (CallStatus::Idle, SignalKind::Offer) => {
                    st.ended_peer = None;
                    st.backlog.retain_from(&from);
                    st.generation += 1;
                    st.peer_user = Some(from.clone());
                    st.pending_offer = Some(data);
                    st.initiator = false;
                    st.retry = RetryState::default();
                    st.ring_deadline = self.inner.config.ring_timeout.map(|t| Instant::now() + t);
                    self.set_status(&mut st, CallStatus::Ringing);
                    self.emit(CallEvent::IncomingCall {
                        from_user_id: from.clone(),
                    });
                    tracing::info!(caller = from.as_str(), "Incoming call");
                    OfferStep::Ignore
                }
                (CallStatus::Idle, SignalKind::Candidate) => {
                    Self::buffer_candidate(&mut st, from.clone(), data);
                    OfferStep::Ignore
                }
                (CallStatus::Idle, _) => {
                    tracing::debug!(from = from.as_str(), ?kind, "Ignoring non-offer payload while idle");
                    OfferStep::Ignore
                }
                (_, SignalKind::Offer) if !from_peer => match self.inner.config.busy_policy {
                    BusyPolicy::Ignore => {
                        tracing::info!(caller = from.as_str(), "Busy, ignoring second caller");
                        OfferStep::Ignore
                    }
                    BusyPolicy::Decline => OfferStep::Decline,
                },
                (_, _) if !from_peer => OfferStep::Ignore,
                (_, SignalKind::Candidate) => match (st.peer.clone(), st.peer_id) {
                    (Some(peer), Some(id)) => OfferStep::Deliver(peer, id, data),
                    _ => {
                        Self::buffer_candidate(&mut st, from.clone(), data);
                        OfferStep::Ignore
                    }
                },
                // First offer wins while ringing or still answering.
                (CallStatus::Ringing, _) | (CallStatus::Answering, SignalKind::Offer)
                    if st.peer.is_none() && st.retry.attempts == 0 =>
                {
                    OfferStep::Ignore
                }
                (_, SignalKind::Offer)
                    if !st.initiator && st.peer.is_none() && st.retry.attempts > 0 =>
                {
                    match st.live_local() {
                        Some(local) => {
                            st.retry.offer_deadline = None;
                            OfferStep::RestartAnswerer {
                                generation: st.generation,
                                local,
                                offer: data,
                            }
                        }
                        None => OfferStep::Ignore,
                    }
                }
                (_, SignalKind::Unknown) => OfferStep::Ignore,
                (_, _) => match (st.peer.clone(), st.peer_id) {
                    (Some(peer), Some(id)) => OfferStep::Deliver(peer, id, data),
                    _ => OfferStep::Ignore,
                },
            }
        };

        match step {
            OfferStep::Ignore => {}
            OfferStep::Decline => {
                tracing::info!(caller = from.as_str(), "Busy, declining second caller");
                self.send_hangup(Some(from));
            }
            OfferStep::Deliver(peer, id, data) => self.deliver(peer, id, data).await,
            OfferStep::RestartAnswerer {
                generation,
                local,
                offer,
            } => {
                tracing::info!(caller = from.as_str(), "Rebuilding answering peer");
                if let Err(e) = self.start_peer(generation, false, local, Some(offer)).await {
                    tracing::warn!(error = %e, "Failed to rebuild answering peer");
                }
            }
        }
    }

    async fn on_call_answered(&self, from: &str, data: Value) {
        let target = {
            let st = self.inner.state.lock();
            if st.status.is_idle() || !st.is_peer(from) || !st.initiator {
                tracing::debug!(from, "Dropping stale answer");
                return;
            }
            match (st.peer.clone(), st.peer_id) {
                (Some(peer), Some(id)) => (peer, id),
                _ => {
                    tracing::debug!(from, "Answer arrived without a live peer");
                    return;
                }
            }
        };
        self.deliver(target.0, target.1, data).await;
    }

    async fn on_remote_candidate(&self, from: String, candidate: Value) {
        let target = {
            let mut st = self.inner.state.lock();
            if !st.status.is_idle() && !st.is_peer(&from) {
                tracing::debug!(from = from.as_str(), "Dropping candidate from another caller");
                return;
            }
            match (st.peer.clone(), st.peer_id) {
                (Some(peer), Some(id)) if !st.status.is_idle() => (peer, id),
                _ => {
                    Self::buffer_candidate(&mut st, from, candidate);
                    return;
                }
            }
        };
        self.deliver(target.0, target.1, candidate).await;
    }

    fn on_remote_hangup(&self, from: &str) {
        let mut st = self.inner.state.lock();
        if st.status.is_idle() || !st.is_peer(from) {
            tracing::debug!(from, "Ignoring hangup for another session");
            return;
        }
        let was_ringing = st.status == CallStatus::Ringing;
        tracing::info!(peer = from, "Remote hung up");
        self.cleanup(&mut st);
        if was_ringing {
            self.emit(CallEvent::Notice(Notice::MissedCall {
                from_user_id: from.to_string(),
            }));
        }
    }

    // ------------------------------------------------------------------------
    // Peer handlers
    // ------------------------------------------------------------------------

    fn on_local_signal(&self, peer_id: PeerId, data: Value) {
        let msg = {
            let st = self.inner.state.lock();
            if st.status.is_idle() || st.peer_id != Some(peer_id) {
                return;
            }
            let Some(to_user_id) = st.peer_user.clone() else {
                return;
            };
            let from_user_id = Some(self.inner.user_id.clone());
            if SignalKind::of(&data) == SignalKind::Candidate {
                RelayClientMessage::IceCandidate {
                    to_user_id,
                    candidate: data,
                    from_user_id,
                }
            } else if st.initiator {
                RelayClientMessage::CallUser {
                    to_user_id,
                    signal_data: data,
                }
            } else {
                RelayClientMessage::AnswerCall {
                    to_user_id,
                    signal_data: data,
                    from_user_id,
                }
            }
        };
        self.send(msg);
    }

    fn on_remote_stream(&self, peer_id: PeerId, stream: MediaStream) {
        let mut st = self.inner.state.lock();
        if st.status.is_idle() || st.peer_id != Some(peer_id) {
            return;
        }
        if let Some(previous) = st.remote.replace(stream.clone()) {
            if !previous.same_stream(&stream) {
                previous.stop_all();
            }
        }
        st.ring_deadline = None;
        st.retry = RetryState::default();
        tracing::info!(tracks = stream.tracks().len(), "Remote stream received");
        self.emit(CallEvent::RemoteStream(Some(stream)));
        self.set_status(&mut st, CallStatus::InCall);
    }

    fn on_negotiation_failure(&self, peer_id: PeerId, err: &Error) {
        let mut st = self.inner.state.lock();
        if st.status.is_idle() || st.peer_id != Some(peer_id) {
            return;
        }
        tracing::warn!(error = %err, code = err.code(), "Peer connection failed");
        if let Some(peer) = st.peer.take() {
            peer.destroy();
        }
        st.peer_id = None;
        if let RetryStep::Exhausted(target) = self.next_retry(&mut st, Instant::now()) {
            drop(st);
            self.give_up(target);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Reuse `existing` or acquire new local media. `Ok(None)` means the
    /// session moved on while acquiring.
    async fn ensure_local(&self, generation: u64, existing: Option<MediaStream>) -> Result<Option<MediaStream>> {
        if let Some(stream) = existing {
            return Ok(Some(stream));
        }

        let constraints = self.inner.state.lock().constraints.clone();
        let acquired = self.inner.media.acquire(&constraints).await;

        let mut st = self.inner.state.lock();
        if st.generation != generation {
            if let Ok(acquired) = &acquired {
                acquired.stream.stop_all();
            }
            tracing::debug!("Discarding media acquired for a superseded session");
            return Ok(None);
        }

        match acquired {
            Ok(AcquiredMedia { stream, fell_back }) => {
                st.local = Some(stream.clone());
                self.emit(CallEvent::LocalPreview(Some(stream.clone())));
                if fell_back {
                    self.emit(CallEvent::Notice(Notice::MediaFallback));
                }
                Ok(Some(stream))
            }
            Err(e) => {
                tracing::warn!(error = %e, "No local media, abandoning call");
                let answering = !st.initiator;
                let target = self.cleanup(&mut st);
                drop(st);
                if answering {
                    self.send_hangup(target);
                }
                self.emit(CallEvent::Notice(Notice::MediaUnavailable(e.to_string())));
                Err(e)
            }
        }
    }

    /// Build a peer session and replay the offer and buffered candidates into it.
    async fn start_peer(
        &self,
        generation: u64,
        initiator: bool,
        local: MediaStream,
        offer: Option<Value>,
    ) -> Result<()> {
        let peer_id = {
            let mut st = self.inner.state.lock();
            if st.generation != generation {
                return Ok(());
            }
            let id = st.next_peer_id;
            st.next_peer_id += 1;
            st.peer_id = Some(id);
            id
        };

        let config = PeerConfig {
            initiator,
            stream: local,
            ice_servers: self.inner.config.ice_servers.clone(),
            trickle: self.inner.config.trickle,
        };
        let sink = PeerEventSink::new(peer_id, self.inner.peer_tx.clone());
        let created = self.inner.connector.create(config, sink).await;

        let order = self.inner.signal_order.lock().await;
        let (peer, replay) = {
            let mut st = self.inner.state.lock();
            if st.generation != generation || st.peer_id != Some(peer_id) {
                if let Ok(peer) = &created {
                    peer.destroy();
                }
                tracing::debug!(peer_id, "Discarding peer built for a superseded session");
                return Ok(());
            }
            let peer = match created {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create peer session");
                    let notify = st.status != CallStatus::Calling;
                    let target = self.cleanup(&mut st);
                    drop(st);
                    if notify {
                        self.send_hangup(target);
                    }
                    self.emit(CallEvent::Notice(Notice::ConnectionLost));
                    return Err(e);
                }
            };
            st.peer = Some(peer.clone());

            let mut replay: Vec<Value> = offer.into_iter().collect();
            if let Some(user) = st.peer_user.clone() {
                replay.extend(st.backlog.take_buffered(&user));
            }
            (peer, replay)
        };

        if !replay.is_empty() {
            tracing::debug!(peer_id, signals = replay.len(), "Replaying signals into new peer");
        }
        for payload in replay {
            if let Err(e) = peer.signal(payload).await {
                drop(order);
                self.on_negotiation_failure(peer_id, &e);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Feed one remote payload to a live peer, in order with any replay.
    async fn deliver(&self, peer: Arc<dyn PeerSession>, peer_id: PeerId, data: Value) {
        let order = self.inner.signal_order.lock().await;
        if self.inner.state.lock().peer_id != Some(peer_id) {
            return;
        }
        if let Err(e) = peer.signal(data).await {
            drop(order);
            self.on_negotiation_failure(peer_id, &e);
        }
    }

    /// Count a failed attempt and schedule the next one, or report exhaustion.
    ///
    /// The initiator re-negotiates after the backoff. The answerer waits for
    /// the initiator's new offer, up to the same backoff plus
    /// `reoffer_timeout`; waiting does not count further attempts.
    fn next_retry(&self, st: &mut SessionState, now: Instant) -> RetryStep {
        let attempt = st.retry.attempts + 1;
        if attempt > self.inner.config.reconnect_attempts {
            return RetryStep::Exhausted(self.cleanup(st));
        }
        let delay = self.inner.config.backoff_for(attempt);
        st.retry.attempts = attempt;
        if st.initiator {
            st.retry.due = Some(now + delay);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling re-negotiation"
            );
        } else {
            let wait = delay + self.inner.config.reoffer_timeout;
            st.retry.offer_deadline = Some(now + wait);
            tracing::info!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                "Waiting for caller to re-negotiate"
            );
        }
        RetryStep::Scheduled
    }

    /// Hold a candidate until its peer session exists. While idle nobody has
    /// claimed the backlog yet, so it is pruned to a bounded size.
    fn buffer_candidate(st: &mut SessionState, from: String, candidate: Value) {
        if !st.status.is_idle() {
            st.backlog.push(from, candidate, Instant::now());
            return;
        }
        if st.ended_peer.as_deref() == Some(from.as_str()) {
            tracing::debug!(from = from.as_str(), "Dropping candidate from an ended session");
            return;
        }
        let now = Instant::now();
        st.backlog.push(from, candidate, now);
        st.backlog.prune(now);
    }

    fn give_up(&self, target: Option<String>) {
        tracing::warn!(peer = target.as_deref().unwrap_or("-"), "Connection lost, ending call");
        self.send_hangup(target);
        self.emit(CallEvent::Notice(Notice::ConnectionLost));
    }

    async fn restart_call(&self, generation: u64) -> Result<()> {
        let target = {
            let st = self.inner.state.lock();
            if st.generation != generation {
                return Ok(());
            }
            st.peer_user.clone()
        };
        let Some(target) = target else {
            return Ok(());
        };
        tracing::info!(target = target.as_str(), "Restarting call to apply video device");
        self.hangup();
        self.call(&target).await
    }

    /// Tear everything down and return to idle. Returns the former peer user.
    fn cleanup(&self, st: &mut SessionState) -> Option<String> {
        st.generation += 1;
        if let Some(peer) = st.peer.take() {
            peer.destroy();
        }
        st.peer_id = None;
        if let Some(local) = st.local.take() {
            local.stop_all();
            self.emit(CallEvent::LocalPreview(None));
        }
        if let Some(remote) = st.remote.take() {
            remote.stop_all();
            self.emit(CallEvent::RemoteStream(None));
        }
        st.pending_offer = None;
        st.initiator = false;
        st.backlog.clear();
        st.muted = false;
        st.video_off = false;
        st.ring_deadline = None;
        st.retry = RetryState::default();
        self.set_status(st, CallStatus::Idle);
        st.ended_peer = st.peer_user.clone();
        st.peer_user.take()
    }

    fn set_status(&self, st: &mut SessionState, status: CallStatus) {
        if st.status != status {
            tracing::info!(from = %st.status, to = %status, "Call status changed");
            st.status = status;
            self.emit(CallEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }

    fn send(&self, msg: RelayClientMessage) {
        if let Err(e) = self.inner.relay.send(msg) {
            tracing::warn!(error = %e, "Dropping outbound signal");
        }
    }

    fn send_hangup(&self, target: Option<String>) {
        if let Some(to_user_id) = target {
            self.send(RelayClientMessage::HangupCall {
                to_user_id,
                from_user_id: Some(self.inner.user_id.clone()),
            });
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("CallSession")
            .field("user_id", &self.inner.user_id)
            .field("status", &st.status)
            .field("peer_user", &st.peer_user)
            .finish()
    }
}
