//! # Network Module
//!
//! Everything that talks to the relay server.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RELAY SURFACES                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────┐   ┌─────────────────────────────┐     │
//! │  │  WebSocket  /ws             │   │  HTTP  /api/users           │     │
//! │  │                             │   │                             │     │
//! │  │  identify, presence,        │   │  user directory search      │     │
//! │  │  call signaling             │   │  and display names          │     │
//! │  │                             │   │                             │     │
//! │  │  relay_client.rs            │   │  directory.rs               │     │
//! │  └─────────────────────────────┘   └─────────────────────────────┘     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod directory;
pub mod relay_client;

pub use directory::{DirectoryClient, UserRecord};
pub use relay_client::{
    RelayClientConfig, RelayClientMessage, RelayConnection, RelayEvent, RelaySender,
    RelayServerMessage, RelayStatus,
};
