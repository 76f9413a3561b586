//! Relay protocol message definitions.
//!
//! The relay speaks a small JSON-over-WebSocket protocol. Every frame is an
//! object of the form `{"event": "<name>", "data": <payload>}` with
//! kebab-case event names and camelCase payload fields.
//!
//! Signal payloads (`signalData`, `candidate`) are opaque to the relay: they
//! are carried as raw JSON values and forwarded verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Bind this connection to a logical user id.
    /// May be sent again after a reconnect or to switch identity.
    Identify { user_id: String },

    /// Start a call: forward an offer to `to_user_id`.
    CallUser { to_user_id: String, signal_data: Value },

    /// Answer a call: forward the answer back to the caller.
    AnswerCall {
        to_user_id: String,
        signal_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    /// Forward a connectivity candidate.
    IceCandidate {
        to_user_id: String,
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    /// Tear down the call with `to_user_id`.
    HangupCall {
        to_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::HangupCall { .. } => "hangup-call",
            Self::Ping => "ping",
        }
    }
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Every registered user id, sent to all connections on each presence change.
    OnlineList(Vec<String>),

    /// Someone is calling you.
    IncomingCall { from_user_id: String, signal_data: Value },

    /// The callee answered.
    CallAnswered { from_user_id: String, signal_data: Value },

    /// A connectivity candidate from the remote side.
    IceCandidate { from_user_id: String, candidate: Value },

    /// The remote side hung up.
    CallHangup { from_user_id: String },

    /// Keepalive response.
    Pong,

    /// The last frame could not be processed.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identify_wire_shape() {
        let msg = ClientMessage::Identify {
            user_id: "alice".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({"event": "identify", "data": {"userId": "alice"}}));
    }

    #[test]
    fn test_parse_call_user() {
        let raw = r#"{"event":"call-user","data":{"toUserId":"bob","signalData":{"type":"offer","sdp":"v=0"}}}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientMessage::CallUser {
                to_user_id,
                signal_data,
            } => {
                assert_eq!(to_user_id, "bob");
                assert_eq!(signal_data["type"], "offer");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_answer_call_without_from_user_id() {
        let raw = r#"{"event":"answer-call","data":{"toUserId":"alice","signalData":{"type":"answer"}}}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            parsed,
            ClientMessage::AnswerCall { from_user_id: None, .. }
        ));
    }

    #[test]
    fn test_ping_has_no_payload() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"event":"ping"}"#);
        let parsed: ClientMessage = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Ping);
    }

    #[test]
    fn test_online_list_wire_shape() {
        let msg = ServerMessage::OnlineList(vec!["alice".into(), "bob".into()]);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"event":"online-list","data":["alice","bob"]}"#);
    }

    #[test]
    fn test_signal_data_key_order_survives() {
        let raw = r#"{"event":"incoming-call","data":{"fromUserId":"alice","signalData":{"type":"offer","sdp":"v=0","zeta":1,"alpha":2}}}"#;
        let parsed: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), raw);
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let raw = r#"{"event":"call-request","data":{"to":"bob"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }
}
