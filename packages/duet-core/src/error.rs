//! # Error Handling
//!
//! Error types for Duet Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Media Errors (100-199)                                            │
//! │  │   ├── MediaAcquisition      - Device denied/busy/absent             │
//! │  │   └── NoLocalMedia          - Operation needs local media           │
//! │  │                                                                      │
//! │  ├── Session Errors (200-299)                                          │
//! │  │   ├── InvalidState          - Intent not valid in current status    │
//! │  │   └── NoPendingOffer        - Answer without a ringing offer        │
//! │  │                                                                      │
//! │  ├── Negotiation Errors (300-399)                                      │
//! │  │   ├── PeerCreation          - Peer session could not be built       │
//! │  │   ├── NegotiationFailed     - Peer reported an error                │
//! │  │   └── ReplaceTrackFailed    - In-place track swap failed            │
//! │  │                                                                      │
//! │  ├── Network Errors (500-599)                                          │
//! │  │   ├── NotConnected          - Relay connection is gone              │
//! │  │   ├── ConnectionFailed      - Could not reach the relay             │
//! │  │   ├── Timeout               - Operation timed out                   │
//! │  │   ├── ProtocolError         - Unexpected relay frame                │
//! │  │   └── DirectoryError        - User directory lookup failed          │
//! │  │                                                                      │
//! │  └── Encoding Errors (900-999)                                         │
//! │      ├── SerializationError    - Outbound frame could not be encoded   │
//! │      └── DeserializationError  - Inbound payload could not be decoded  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport and device failures are caught where they happen and turned
//! into session transitions or [`Notice`](crate::call::Notice)s; callers only
//! see these errors from the intent methods that triggered them.

use thiserror::Error;

use crate::call::media::MediaError;

/// Result type alias for Duet Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Duet Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Media Errors (100-199)
    // ========================================================================

    /// Local camera/microphone could not be opened
    #[error("Failed to acquire local media: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// The operation needs local media and there is none
    #[error("No local media is active.")]
    NoLocalMedia,

    // ========================================================================
    // Session Errors (200-299)
    // ========================================================================

    /// The intent is not valid in the current call status
    #[error("Cannot {action} while {status}.")]
    InvalidState {
        /// What was attempted
        action: &'static str,
        /// Status at the time
        status: String,
    },

    /// `answer` was called without a ringing offer
    #[error("There is no incoming call to answer.")]
    NoPendingOffer,

    // ========================================================================
    // Negotiation Errors (300-399)
    // ========================================================================

    /// The peer session could not be constructed
    #[error("Failed to create peer session: {0}")]
    PeerCreation(String),

    /// The peer session reported an error
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Replacing the outgoing track failed
    #[error("Failed to replace track: {0}")]
    ReplaceTrackFailed(String),

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// Not connected to the relay
    #[error("Not connected to the relay.")]
    NotConnected,

    /// Failed to connect to the relay
    #[error("Failed to connect to relay: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Protocol-level error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// User directory request failed
    #[error("Directory lookup failed: {0}")]
    DirectoryError(String),

    // ========================================================================
    // Encoding Errors (900-999)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Numeric error code, grouped by category:
    /// - 100-199: Media
    /// - 200-299: Session
    /// - 300-399: Negotiation
    /// - 500-599: Network
    /// - 900-999: Encoding
    pub fn code(&self) -> i32 {
        match self {
            Error::MediaAcquisition(_) => 100,
            Error::NoLocalMedia => 101,

            Error::InvalidState { .. } => 200,
            Error::NoPendingOffer => 201,

            Error::PeerCreation(_) => 300,
            Error::NegotiationFailed(_) => 301,
            Error::ReplaceTrackFailed(_) => 302,

            Error::NotConnected => 500,
            Error::ConnectionFailed(_) => 501,
            Error::Timeout(_) => 502,
            Error::ProtocolError(_) => 503,
            Error::DirectoryError(_) => 504,

            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying
    /// or by user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisition(_)
                | Error::NegotiationFailed(_)
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotConnected
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::SerializationError(err.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::DirectoryError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::MediaAcquisition(MediaError::PermissionDenied).code(), 100);
        assert_eq!(Error::NoPendingOffer.code(), 201);
        assert_eq!(Error::NotConnected.code(), 500);
        assert_eq!(Error::NegotiationFailed("ice failed".into()).code(), 301);
        assert_eq!(Error::SerializationError("test".into()).code(), 901);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::NotConnected.is_recoverable());
        assert!(Error::NegotiationFailed("ice failed".into()).is_recoverable());
        assert!(!Error::ProtocolError("bad frame".into()).is_recoverable());
        assert!(Error::MediaAcquisition(MediaError::DeviceBusy).is_recoverable());
        assert!(!Error::NoPendingOffer.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidState {
            action: "call",
            status: "ringing".into(),
        };
        assert_eq!(err.to_string(), "Cannot call while ringing.");
    }

    #[test]
    fn test_json_errors_map_to_deserialization() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), 902);
    }
}
