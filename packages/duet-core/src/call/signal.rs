//! Classification of negotiation payloads.
//!
//! Payloads are owned by the peer-connection library and stay opaque
//! everywhere else; the session only needs to know which kind it holds.
//! Shapes recognised:
//!
//! - `{"type": "offer", "sdp": ...}`
//! - `{"type": "answer", "sdp": ...}`
//! - `{"type": "candidate", "candidate": {...}}` or a bare `{"candidate": ...}`
//! - `{"type": "renegotiate", ...}` / `{"type": "transceiverRequest", ...}`

use serde_json::Value;

/// Kind of a negotiation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Renegotiate,
    Unknown,
}

impl SignalKind {
    /// Classify a payload by its `type` marker, or by a `candidate` field.
    pub fn of(payload: &Value) -> Self {
        match payload.get("type").and_then(Value::as_str) {
            Some("offer") => SignalKind::Offer,
            Some("answer") => SignalKind::Answer,
            Some("candidate") => SignalKind::Candidate,
            Some("renegotiate") | Some("transceiverRequest") => SignalKind::Renegotiate,
            Some(_) => SignalKind::Unknown,
            None if payload.get("candidate").is_some() => SignalKind::Candidate,
            None => SignalKind::Unknown,
        }
    }

    /// Session descriptions, as opposed to trickled candidates.
    pub fn is_description(self) -> bool {
        matches!(self, SignalKind::Offer | SignalKind::Answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptions() {
        assert_eq!(SignalKind::of(&json!({"type": "offer", "sdp": "v=0"})), SignalKind::Offer);
        assert_eq!(SignalKind::of(&json!({"type": "answer", "sdp": "v=0"})), SignalKind::Answer);
        assert!(SignalKind::Offer.is_description());
        assert!(!SignalKind::Candidate.is_description());
    }

    #[test]
    fn test_candidates() {
        let wrapped = json!({"type": "candidate", "candidate": {"candidate": "candidate:1", "sdpMid": "0"}});
        let bare = json!({"candidate": "candidate:1", "sdpMLineIndex": 0});
        assert_eq!(SignalKind::of(&wrapped), SignalKind::Candidate);
        assert_eq!(SignalKind::of(&bare), SignalKind::Candidate);
    }

    #[test]
    fn test_renegotiation_and_unknown() {
        assert_eq!(
            SignalKind::of(&json!({"type": "renegotiate", "renegotiate": true})),
            SignalKind::Renegotiate
        );
        assert_eq!(
            SignalKind::of(&json!({"type": "transceiverRequest", "transceiverRequest": {"kind": "video"}})),
            SignalKind::Renegotiate
        );
        assert_eq!(SignalKind::of(&json!({"type": "pranswer"})), SignalKind::Unknown);
        assert_eq!(SignalKind::of(&json!("offer")), SignalKind::Unknown);
        assert_eq!(SignalKind::of(&json!({})), SignalKind::Unknown);
    }
}
