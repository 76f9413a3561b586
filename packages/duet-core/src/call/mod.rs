//! # Calls
//!
//! The client side of a one-to-one video call.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           CALL CLIENT                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   UI intents ───────────────┐                                           │
//! │   (call, answer, hangup,    │                                           │
//! │    mute, swap camera)       ▼                                           │
//! │                    ┌─────────────────┐      ┌──────────────────┐        │
//! │   relay frames ──► │   CallSession   │ ───► │  RelaySender     │        │
//! │   peer events  ──► │  (state machine)│      │  (to the relay)  │        │
//! │   timer ticks  ──► └───┬─────────┬───┘      └──────────────────┘        │
//! │                        │         │                                      │
//! │                        ▼         ▼                                      │
//! │            ┌────────────────┐  ┌────────────────┐                       │
//! │            │MediaController │  │ PeerConnector  │                       │
//! │            │ (local tracks) │  │ (peer session) │                       │
//! │            └────────────────┘  └────────────────┘                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod backlog;
pub mod client;
pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod signal;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


pub use client::CallClient;
pub use config::{BusyPolicy, CallConfig};
pub use media::{
    AudioConstraint, MediaConstraints, MediaController, MediaDevices, MediaError, MediaStream,
    MediaTrack, PlatformFamily, SwapOutcome, TrackKind, VideoConstraint,
};
pub use peer::{IceServer, PeerConfig, PeerConnector, PeerEvent, PeerEventSink, PeerSession};
pub use session::{CallEvent, CallSession, CallStatus, Notice, SessionChannels};
pub use signal::SignalKind;
