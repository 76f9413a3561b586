//! User directory.
//!
//! Read-only list of known users served at `GET /api/users`. Clients use it
//! to pick someone to call and to show display names; the relay itself never
//! consults it when forwarding signals.

pub mod api;
pub mod store;

pub use store::{UserDirectory, UserRecord};
