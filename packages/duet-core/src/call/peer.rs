//! # Peer Session Adapter
//!
//! The seam between the call session and whatever peer-connection stack
//! carries the media. A [`PeerConnector`] builds a [`PeerSession`] for one
//! negotiation attempt; the session reports back through a [`PeerEventSink`]
//! tagged with the id it was created under, so events from a torn-down peer
//! can be told apart from the live one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::call::media::{MediaStream, MediaTrack};
use crate::error::Result;

/// Identifies one peer session within a [`CallSession`](crate::call::CallSession).
pub type PeerId = u64;

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Free public STUN server.
    pub fn default_stun() -> Vec<Self> {
        vec![Self {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: None,
            credential: None,
        }]
    }

    /// TURN server from `DUET_TURN_URL`, `DUET_TURN_USER` and `DUET_TURN_PASS`.
    pub fn turn_from_env() -> Option<Self> {
        let url = std::env::var("DUET_TURN_URL").ok().filter(|u| !u.is_empty())?;
        Some(Self {
            urls: vec![url],
            username: std::env::var("DUET_TURN_USER").ok(),
            credential: std::env::var("DUET_TURN_PASS").ok(),
        })
    }

    /// Default STUN plus the environment TURN server, if any.
    pub fn from_env() -> Vec<Self> {
        let mut servers = Self::default_stun();
        servers.extend(Self::turn_from_env());
        servers
    }
}

/// Parameters for one peer session.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Whether this side produces the offer
    pub initiator: bool,
    /// Local media to send
    pub stream: MediaStream,
    pub ice_servers: Vec<IceServer>,
    /// Emit candidates as they are gathered instead of inside the description
    pub trickle: bool,
}

/// Something the peer session reports.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A negotiation payload to deliver to the remote side
    Signal(Value),
    /// Remote media arrived
    Stream(MediaStream),
    /// Connectivity established
    Connected,
    /// Connectivity failed; may be retried
    Failed(String),
    /// The peer session reported an error
    Error(String),
    /// The peer session closed
    Close,
}

/// A [`PeerEvent`] together with the peer it came from.
#[derive(Debug, Clone)]
pub struct PeerEnvelope {
    pub peer_id: PeerId,
    pub event: PeerEvent,
}

/// Sender half handed to a peer session for its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<PeerEnvelope>,
}

impl PeerEventSink {
    pub fn new(peer_id: PeerId, tx: mpsc::UnboundedSender<PeerEnvelope>) -> Self {
        Self { peer_id, tx }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Report an event. Events sent after the session is gone are discarded.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerEnvelope {
            peer_id: self.peer_id,
            event,
        });
    }
}

/// A live peer connection.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Feed a remote negotiation payload.
    async fn signal(&self, data: Value) -> Result<()>;

    /// Whether `replace_track` is available on this platform.
    fn supports_replace_track(&self) -> bool;

    /// Swap the outgoing `old` track for `new` without renegotiating.
    async fn replace_track(&self, old: &MediaTrack, new: &MediaTrack, stream: &MediaStream) -> Result<()>;

    /// Close the connection. Destroying twice is a no-op.
    fn destroy(&self);
}

/// Builds peer sessions.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, config: PeerConfig, events: PeerEventSink) -> Result<Arc<dyn PeerSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stun() {
        let servers = IceServer::default_stun();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
        assert!(servers[0].username.is_none());
    }

    #[test]
    fn test_ice_server_serialization_skips_empty_credentials() {
        let json = serde_json::to_value(&IceServer::default_stun()[0]).unwrap();
        assert_eq!(json, serde_json::json!({"urls": ["stun:stun.l.google.com:19302"]}));
    }

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(7, tx);
        sink.emit(PeerEvent::Connected);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.peer_id, 7);
        assert!(matches!(envelope.event, PeerEvent::Connected));
    }

    #[test]
    fn test_sink_outlives_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(1, tx);
        drop(rx);
        sink.emit(PeerEvent::Close);
    }
}
