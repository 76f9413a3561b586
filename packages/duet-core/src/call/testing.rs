//! In-memory media devices and peer connections.
//!
//! Available to this crate's tests and, with the `test-support` feature, to
//! other packages. Fake peers exchange JSON descriptions that list the
//! sender's tracks, so the answering side can build a remote stream that
//! mirrors the caller's track ids. Peers created through connectors sharing
//! one [`FakePeerNetwork`] also see each other's `replace_track` calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::call::media::{
    AudioConstraint, FacingMode, MediaConstraints, MediaDevices, MediaError, MediaStream,
    MediaTrack, PlatformFamily, TrackKind, VideoConstraint,
};
use crate::call::peer::{PeerConfig, PeerConnector, PeerEvent, PeerEventSink, PeerSession};
use crate::call::signal::SignalKind;
use crate::error::{Error, Result};

// ============================================================================
// MEDIA DEVICES
// ============================================================================

#[derive(Default)]
struct DevicesState {
    fail_video: Option<MediaError>,
    fail_all: Option<MediaError>,
    requests: Vec<MediaConstraints>,
    opened: Vec<MediaTrack>,
}

/// Cameras and microphones that always exist unless told to fail.
///
/// `hold` parks every acquisition until `release`, to test what happens
/// when other events land while media is being opened.
pub struct FakeMediaDevices {
    state: Mutex<DevicesState>,
    platform: PlatformFamily,
    held: AtomicBool,
    waiting: AtomicUsize,
    gate: Semaphore,
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::with_platform(PlatformFamily::Desktop)
    }

    /// Devices on a mobile/touch browser.
    pub fn mobile() -> Self {
        Self::with_platform(PlatformFamily::MobileTouch)
    }

    fn with_platform(platform: PlatformFamily) -> Self {
        Self {
            state: Mutex::new(DevicesState::default()),
            platform,
            held: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    /// Fail any request that includes video.
    pub fn fail_video_with(&self, err: MediaError) {
        self.state.lock().fail_video = Some(err);
    }

    /// Fail every request.
    pub fn fail_all_with(&self, err: MediaError) {
        self.state.lock().fail_all = Some(err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_video = None;
        state.fail_all = None;
    }

    /// Park acquisitions until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let parked and future acquisitions through.
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        let parked = self.waiting.load(Ordering::SeqCst);
        self.gate.add_permits(parked);
    }

    /// Wait until at least one acquisition is parked.
    pub async fn wait_until_parked(&self) {
        while !self.held.load(Ordering::SeqCst) || self.waiting.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Every constraint set requested so far.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.state.lock().requests.clone()
    }

    /// Every track handed out so far.
    pub fn opened_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().opened.clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError> {
        self.state.lock().requests.push(constraints.clone());

        self.waiting.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(err) = &state.fail_all {
            return Err(err.clone());
        }
        if constraints.video.is_enabled() {
            if let Some(err) = &state.fail_video {
                return Err(err.clone());
            }
        }

        let video_label = match &constraints.video {
            VideoConstraint::Disabled => None,
            VideoConstraint::Any => Some("default".to_string()),
            VideoConstraint::Device(id) => Some(id.clone()),
            VideoConstraint::Facing(FacingMode::User) => Some("front".to_string()),
            VideoConstraint::Facing(FacingMode::Environment) => Some("back".to_string()),
        };
        let audio_label = match &constraints.audio {
            AudioConstraint::Disabled => None,
            AudioConstraint::Any => Some("default".to_string()),
            AudioConstraint::Device(id) => Some(id.clone()),
        };

        let mut tracks = Vec::new();
        if let Some(label) = audio_label {
            tracks.push(MediaTrack::new(TrackKind::Audio, Some(label)));
        }
        if let Some(label) = video_label {
            tracks.push(MediaTrack::new(TrackKind::Video, Some(label)));
        }
        if tracks.is_empty() {
            return Err(MediaError::Overconstrained("no tracks requested".into()));
        }
        state.opened.extend(tracks.iter().cloned());
        Ok(MediaStream::new(tracks))
    }

    fn platform(&self) -> PlatformFamily {
        self.platform
    }
}

// ============================================================================
// PEER NETWORK
// ============================================================================

/// Shared view of the remote streams fake peers have built, keyed by the
/// sending peer's key.
#[derive(Clone, Default)]
pub struct FakePeerNetwork {
    mirrors: Arc<Mutex<HashMap<String, MediaStream>>>,
}

impl FakePeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, sender_key: &str, mirror: MediaStream) {
        self.mirrors.lock().insert(sender_key.to_string(), mirror);
    }

    fn replace(&self, sender_key: &str, old_id: &str, new: &MediaTrack) {
        let mirror = self.mirrors.lock().get(sender_key).cloned();
        if let Some(mirror) = mirror {
            if mirror.remove_track(old_id).is_some() {
                mirror.add_track(MediaTrack::with_id(new.id(), new.kind(), None));
            }
        }
    }
}

#[derive(Deserialize)]
struct TrackInfo {
    id: String,
    kind: TrackKind,
}

// ============================================================================
// PEERS
// ============================================================================

/// One fake peer connection.
///
/// An initiator emits an offer and one candidate on creation. A
/// non-initiator answers every offer with an answer and a candidate. Either
/// side emits `Connected` and a mirrored `Stream` once it has the remote
/// description.
pub struct FakePeer {
    key: String,
    initiator: bool,
    local: MediaStream,
    sink: PeerEventSink,
    network: FakePeerNetwork,
    supports_replace: bool,
    fail_replace: bool,
    signals: Mutex<Vec<Value>>,
    replaced: Mutex<Vec<(String, String)>>,
    destroyed: AtomicBool,
}

impl FakePeer {
    /// `<connector label>#<peer id>`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Payloads fed through `signal`, in order.
    pub fn signals(&self) -> Vec<Value> {
        self.signals.lock().clone()
    }

    /// `(old, new)` track id pairs passed to `replace_track`.
    pub fn replaced(&self) -> Vec<(String, String)> {
        self.replaced.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Report a connectivity failure.
    pub fn fail(&self, reason: &str) {
        self.sink.emit(PeerEvent::Failed(reason.to_string()));
    }

    /// Report an error from the underlying connection.
    pub fn error(&self, reason: &str) {
        self.sink.emit(PeerEvent::Error(reason.to_string()));
    }

    /// Report that the connection closed.
    pub fn close(&self) {
        self.sink.emit(PeerEvent::Close);
    }

    fn description(&self, kind: &str) -> Value {
        let tracks: Vec<Value> = self
            .local
            .tracks()
            .iter()
            .map(|t| json!({"id": t.id(), "kind": t.kind()}))
            .collect();
        json!({
            "type": kind,
            "sdp": format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n", self.key),
            "peer": self.key,
            "tracks": tracks,
        })
    }

    fn candidate(&self) -> Value {
        json!({
            "type": "candidate",
            "candidate": {
                "candidate": format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", self.key),
                "sdpMLineIndex": 0,
                "sdpMid": "0",
            },
        })
    }

    fn start(&self) {
        if self.initiator {
            self.sink.emit(PeerEvent::Signal(self.description("offer")));
            self.sink.emit(PeerEvent::Signal(self.candidate()));
        }
    }

    fn accept_remote(&self, description: &Value) {
        let tracks: Vec<TrackInfo> = description
            .get("tracks")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok())
            .unwrap_or_default();
        let remote_key = description
            .get("peer")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let mirror = MediaStream::with_id(
            format!("remote:{}", remote_key),
            tracks
                .into_iter()
                .map(|t| MediaTrack::with_id(t.id, t.kind, None))
                .collect(),
        );
        self.network.register(remote_key, mirror.clone());
        self.sink.emit(PeerEvent::Connected);
        self.sink.emit(PeerEvent::Stream(mirror));
    }
}

#[async_trait]
impl PeerSession for FakePeer {
    async fn signal(&self, data: Value) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.signals.lock().push(data.clone());
        match SignalKind::of(&data) {
            SignalKind::Offer if !self.initiator => {
                self.sink.emit(PeerEvent::Signal(self.description("answer")));
                self.sink.emit(PeerEvent::Signal(self.candidate()));
                self.accept_remote(&data);
            }
            SignalKind::Answer if self.initiator => self.accept_remote(&data),
            _ => {}
        }
        Ok(())
    }

    fn supports_replace_track(&self) -> bool {
        self.supports_replace
    }

    async fn replace_track(&self, old: &MediaTrack, new: &MediaTrack, _stream: &MediaStream) -> Result<()> {
        if !self.supports_replace {
            return Err(Error::ReplaceTrackFailed("replaceTrack is not supported".into()));
        }
        if self.fail_replace {
            return Err(Error::ReplaceTrackFailed("sender rejected the track".into()));
        }
        self.replaced
            .lock()
            .push((old.id().to_string(), new.id().to_string()));
        self.network.replace(&self.key, old.id(), new);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Builds [`FakePeer`]s and remembers them.
pub struct FakePeerConnector {
    label: String,
    network: FakePeerNetwork,
    supports_replace: AtomicBool,
    fail_replace: AtomicBool,
    fail_create: AtomicBool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerConnector {
    pub fn new(label: impl Into<String>, network: FakePeerNetwork) -> Self {
        Self {
            label: label.into(),
            network,
            supports_replace: AtomicBool::new(true),
            fail_replace: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// A connector on its own network.
    pub fn standalone(label: impl Into<String>) -> Self {
        Self::new(label, FakePeerNetwork::new())
    }

    /// Whether peers created from now on offer `replace_track`.
    pub fn set_replace_supported(&self, supported: bool) {
        self.supports_replace.store(supported, Ordering::SeqCst);
    }

    /// Whether peers created from now on fail `replace_track`.
    pub fn set_replace_fails(&self, fails: bool) {
        self.fail_replace.store(fails, Ordering::SeqCst);
    }

    pub fn set_create_fails(&self, fails: bool) {
        self.fail_create.store(fails, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create(&self, config: PeerConfig, events: PeerEventSink) -> Result<Arc<dyn PeerSession>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::PeerCreation("fake connector refused".into()));
        }
        let peer = Arc::new(FakePeer {
            key: format!("{}#{}", self.label, events.peer_id()),
            initiator: config.initiator,
            local: config.stream,
            sink: events,
            network: self.network.clone(),
            supports_replace: self.supports_replace.load(Ordering::SeqCst),
            fail_replace: self.fail_replace.load(Ordering::SeqCst),
            signals: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        peer.start();
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
