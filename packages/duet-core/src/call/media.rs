//! # Local Media
//!
//! Tracks, streams, device constraints and the [`MediaController`] that owns
//! acquisition, mute/video toggles and mid-call camera swaps.
//!
//! ## Camera Swap
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         VIDEO DEVICE SWAP                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  (a) open new track ──► (b) replace on peer ──► (c) mutate local set    │
//! │                                                      │                  │
//! │                                                      ▼                  │
//! │                            (e) preview same set ◄── (d) stop old track  │
//! │                                                                         │
//! │  Any step failing leaves the old track live and stops the new one.      │
//! │  A session that went idle mid-swap stops the new track and returns      │
//! │  `Superseded`.                                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::call::peer::PeerSession;
use crate::error::{Error, Result};

// ============================================================================
// TRACKS AND STREAMS
// ============================================================================

/// Kind of media a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    device_id: Option<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

/// A single audio or video track.
///
/// Clones share the same underlying track. `enabled` gates delivery without
/// detaching the track; `stop` releases the device and is idempotent.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track with a fresh random id.
    pub fn new(kind: TrackKind, device_id: Option<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, device_id)
    }

    /// Create a track with a known id, e.g. a remote mirror of a sender's track.
    pub fn with_id(id: impl Into<String>, kind: TrackKind, device_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                device_id,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                on_stop: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Device the track was opened on, if known.
    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register a hook run once when the track is stopped.
    /// Platform adapters use it to release the underlying device.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.on_stop.lock() = Some(Box::new(hook));
    }

    /// Stop the track. Stopping an already-stopped track is a no-op.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.on_stop.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A mutable set of tracks.
///
/// Clones share the same track list, so a preview bound to a stream keeps
/// showing it after tracks are swapped in place.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(Mutex::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current tracks.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn video_track(&self) -> Option<MediaTrack> {
        self.first_of(TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<MediaTrack> {
        self.first_of(TrackKind::Audio)
    }

    fn first_of(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.tracks.lock().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.lock();
        if !tracks.iter().any(|t| t == &track) {
            tracks.push(track);
        }
    }

    /// Remove a track by id. Returns the removed track.
    pub fn remove_track(&self, id: &str) -> Option<MediaTrack> {
        let mut tracks = self.tracks.lock();
        let pos = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(pos))
    }

    /// Stop every track in the set.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    /// Whether both handles refer to the same underlying set.
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.lock())
            .finish()
    }
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Camera facing, for devices that expose front/back cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// What video to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoConstraint {
    /// No video
    Disabled,
    /// Platform default camera
    Any,
    /// An exact device id
    Device(String),
    /// Preferred facing (mobile front/back)
    Facing(FacingMode),
}

impl VideoConstraint {
    /// Map a UI device selector: `"default"`, `"front"`, `"back"` or a device id.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "" | "default" => VideoConstraint::Any,
            "front" => VideoConstraint::Facing(FacingMode::User),
            "back" => VideoConstraint::Facing(FacingMode::Environment),
            id => VideoConstraint::Device(id.to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, VideoConstraint::Disabled)
    }
}

/// What audio to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioConstraint {
    Disabled,
    Any,
    Device(String),
}

impl AudioConstraint {
    /// Map a UI device selector: `"default"` or a device id.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "" | "default" => AudioConstraint::Any,
            id => AudioConstraint::Device(id.to_string()),
        }
    }
}

/// Video and audio constraints for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: VideoConstraint,
    pub audio: AudioConstraint,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: VideoConstraint::Any,
            audio: AudioConstraint::Any,
        }
    }
}

impl MediaConstraints {
    /// The same audio with video dropped.
    pub fn audio_only(&self) -> Self {
        Self {
            video: VideoConstraint::Disabled,
            audio: self.audio.clone(),
        }
    }

    /// Only the given video, no audio. Used to open a replacement camera.
    pub fn video_only(video: VideoConstraint) -> Self {
        Self {
            video,
            audio: AudioConstraint::Disabled,
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Device-level acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no matching device")]
    NotFound,
    #[error("device is busy")]
    DeviceBusy,
    #[error("constraint cannot be satisfied: {0}")]
    Overconstrained(String),
    #[error("{0}")]
    Other(String),
}

/// Browser family, as far as in-place track swaps are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformFamily {
    #[default]
    Desktop,
    /// Mobile/touch browsers, where in-place swaps are unreliable
    MobileTouch,
}

/// Platform access to cameras and microphones.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open tracks matching the constraints.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError>;

    fn platform(&self) -> PlatformFamily {
        PlatformFamily::Desktop
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Result of a successful acquisition.
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub stream: MediaStream,
    /// Video failed and the stream is audio-only
    pub fell_back: bool,
}

/// How a video device swap ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The live peer now sends the new track
    Swapped,
    /// No peer session; only the local preview changed
    PreviewOnly,
    /// In-place swap is not possible; the call must be restarted
    RestartRequired,
    /// The session changed while the swap was in flight
    Superseded,
    /// There is no local media to swap on
    NoLocalMedia,
    /// The local media has no video track
    NoVideoTrack,
}

/// Owns acquisition and mutation of local media.
#[derive(Clone)]
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    pub fn platform(&self) -> PlatformFamily {
        self.devices.platform()
    }

    /// Open local media, falling back to audio-only when video fails.
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<AcquiredMedia> {
        match self.devices.get_user_media(constraints).await {
            Ok(stream) => Ok(AcquiredMedia {
                stream,
                fell_back: false,
            }),
            Err(e) if constraints.video.is_enabled() => {
                tracing::warn!(error = %e, "Video acquisition failed, retrying audio-only");
                let stream = self.devices.get_user_media(&constraints.audio_only()).await?;
                Ok(AcquiredMedia {
                    stream,
                    fell_back: true,
                })
            }
            Err(e) => Err(Error::MediaAcquisition(e)),
        }
    }

    /// Flip the enabled flag of the first track of `kind`.
    /// Returns the new enabled state, or `None` if there is no such track.
    pub fn set_track_enabled(stream: &MediaStream, kind: TrackKind, enabled: bool) -> Option<bool> {
        let track = match kind {
            TrackKind::Audio => stream.audio_track(),
            TrackKind::Video => stream.video_track(),
        }?;
        track.set_enabled(enabled);
        Some(enabled)
    }

    /// Swap the camera feeding `local`.
    ///
    /// `still_current` is checked after every suspension point; once it
    /// returns false the new track is stopped and nothing else changes.
    pub async fn swap_video(
        &self,
        local: &MediaStream,
        peer: Option<&Arc<dyn PeerSession>>,
        video: VideoConstraint,
        still_current: impl Fn() -> bool,
    ) -> Result<SwapOutcome> {
        let Some(old) = local.video_track() else {
            return Ok(SwapOutcome::NoVideoTrack);
        };

        if let Some(peer) = peer {
            if !peer.supports_replace_track() {
                return Ok(SwapOutcome::RestartRequired);
            }
        }

        // (a) open the new camera
        let opened = self
            .devices
            .get_user_media(&MediaConstraints::video_only(video))
            .await?;
        let Some(new) = opened.video_track() else {
            opened.stop_all();
            return Err(Error::MediaAcquisition(MediaError::NotFound));
        };
        if !still_current() {
            opened.stop_all();
            return Ok(SwapOutcome::Superseded);
        }
        new.set_enabled(old.is_enabled());

        // (b) replace on the live peer
        if let Some(peer) = peer {
            if let Err(e) = peer.replace_track(&old, &new, local).await {
                opened.stop_all();
                if self.platform() == PlatformFamily::MobileTouch {
                    tracing::warn!(error = %e, "Track replacement failed on mobile, restart required");
                    return Ok(SwapOutcome::RestartRequired);
                }
                return Err(e);
            }
            if !still_current() {
                opened.stop_all();
                return Ok(SwapOutcome::Superseded);
            }
        }

        // (c) mutate the local set in place
        local.remove_track(old.id());
        local.add_track(new.clone());
        for extra in opened.tracks() {
            if extra != new {
                extra.stop();
            }
        }

        // (d) release the old camera
        old.stop();

        tracing::debug!(old = old.id(), new = new.id(), "Video track swapped");
        Ok(if peer.is_some() {
            SwapOutcome::Swapped
        } else {
            SwapOutcome::PreviewOnly
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::FakeMediaDevices;

    #[test]
    fn test_selector_mapping() {
        assert_eq!(VideoConstraint::from_selector("default"), VideoConstraint::Any);
        assert_eq!(
            VideoConstraint::from_selector("front"),
            VideoConstraint::Facing(FacingMode::User)
        );
        assert_eq!(
            VideoConstraint::from_selector("back"),
            VideoConstraint::Facing(FacingMode::Environment)
        );
        assert_eq!(
            VideoConstraint::from_selector("cam2"),
            VideoConstraint::Device("cam2".into())
        );
        assert_eq!(AudioConstraint::from_selector("mic1"), AudioConstraint::Device("mic1".into()));
    }

    #[test]
    fn test_stop_is_idempotent_and_runs_hook_once() {
        let track = MediaTrack::new(TrackKind::Video, None);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        track.on_stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();

        assert!(track.is_stopped());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_clones_share_tracks() {
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, None)]);
        let view = stream.clone();
        stream.add_track(MediaTrack::new(TrackKind::Video, None));

        assert_eq!(view.tracks().len(), 2);
        assert!(view.same_stream(&stream));
        assert!(!view.same_stream(&MediaStream::new(vec![])));
    }

    #[tokio::test]
    async fn test_acquire_falls_back_to_audio_only() {
        let devices = Arc::new(FakeMediaDevices::new());
        devices.fail_video_with(MediaError::DeviceBusy);
        let controller = MediaController::new(devices.clone());

        let acquired = controller.acquire(&MediaConstraints::default()).await.unwrap();

        assert!(acquired.fell_back);
        assert!(acquired.stream.video_track().is_none());
        assert!(acquired.stream.audio_track().is_some());
        assert_eq!(devices.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_propagates_when_audio_also_fails() {
        let devices = Arc::new(FakeMediaDevices::new());
        devices.fail_all_with(MediaError::PermissionDenied);
        let controller = MediaController::new(devices);

        let err = controller.acquire(&MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(MediaError::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_preview_swap_mutates_same_stream() {
        let devices = Arc::new(FakeMediaDevices::new());
        let controller = MediaController::new(devices);
        let local = controller
            .acquire(&MediaConstraints::default())
            .await
            .unwrap()
            .stream;
        let old_video = local.video_track().unwrap();
        let audio = local.audio_track().unwrap();
        let preview = local.clone();

        let outcome = controller
            .swap_video(&local, None, VideoConstraint::Device("cam2".into()), || true)
            .await
            .unwrap();

        assert_eq!(outcome, SwapOutcome::PreviewOnly);
        let new_video = preview.video_track().unwrap();
        assert_ne!(new_video.id(), old_video.id());
        assert_eq!(new_video.device_id(), Some("cam2"));
        assert_eq!(preview.audio_track().unwrap().id(), audio.id());
        assert!(old_video.is_stopped());
        assert!(!new_video.is_stopped());
    }

    #[tokio::test]
    async fn test_swap_keeps_disabled_video_disabled() {
        let controller = MediaController::new(Arc::new(FakeMediaDevices::new()));
        let local = controller
            .acquire(&MediaConstraints::default())
            .await
            .unwrap()
            .stream;
        local.video_track().unwrap().set_enabled(false);

        controller
            .swap_video(&local, None, VideoConstraint::Any, || true)
            .await
            .unwrap();

        assert!(!local.video_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_superseded_swap_leaves_stream_untouched() {
        let controller = MediaController::new(Arc::new(FakeMediaDevices::new()));
        let local = controller
            .acquire(&MediaConstraints::default())
            .await
            .unwrap()
            .stream;
        let old_video = local.video_track().unwrap();

        let outcome = controller
            .swap_video(&local, None, VideoConstraint::Any, || false)
            .await
            .unwrap();

        assert_eq!(outcome, SwapOutcome::Superseded);
        assert_eq!(local.video_track().unwrap().id(), old_video.id());
        assert!(!old_video.is_stopped());
    }

    #[tokio::test]
    async fn test_swap_without_video_track() {
        let controller = MediaController::new(Arc::new(FakeMediaDevices::new()));
        let local = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, None)]);

        let outcome = controller
            .swap_video(&local, None, VideoConstraint::Any, || true)
            .await
            .unwrap();
        assert_eq!(outcome, SwapOutcome::NoVideoTrack);
    }
}
