//! # Duet Core
//!
//! Client library for one-to-one video calls brokered by a duet relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DUET CORE MODULES                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │              Call                │  │          Network            │  │
//! │  │                                  │  │                             │  │
//! │  │ - Session state machine          │  │ - Relay WebSocket client    │  │
//! │  │ - Local media and camera swap    │◄─┤ - Re-identify on reconnect  │  │
//! │  │ - Peer session seam              │  │ - User directory (HTTP)     │  │
//! │  │ - Candidate backlog              │  │                             │  │
//! │  └──────────────────────────────────┘  └─────────────────────────────┘  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`call`] - Call lifecycle, media control and the peer-session seam
//! - [`network`] - Relay connection and user directory
//!
//! The media transport itself is not implemented here. Platforms plug in
//! through [`call::MediaDevices`] and [`call::PeerConnector`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use duet_core::call::{CallClient, CallConfig, VideoConstraint};
//! use duet_core::network::RelayClientConfig;
//!
//! let relay = RelayClientConfig::new("ws://localhost:9001/ws", "alice");
//! let (client, mut events) = CallClient::connect(relay, CallConfig::default(), devices, connector);
//!
//! client.session().call("bob").await?;
//! client.session().swap_video_device(VideoConstraint::from_selector("back")).await?;
//! client.session().hangup();
//! ```

pub mod call;
pub mod error;
pub mod network;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
