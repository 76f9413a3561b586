//! Signaling relay.
//!
//! Stateless per-message forwarding of call-control payloads. The relay
//! resolves the target user id to a connection and forwards; it never looks
//! inside `signalData` or `candidate`. A target with no registered connection
//! is a silent drop: the sender gets no confirmation either way.

use serde_json::Value;

use crate::presence::{ConnectionId, PresenceRegistry};
use crate::protocol::ServerMessage;

/// Outcome of forwarding one message, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the target's connection.
    Delivered,
    /// Target user id is not registered.
    TargetOffline,
    /// The sender has no identity to stamp on the message.
    UnknownSender,
}

/// Forwards call-control messages between registered connections.
#[derive(Clone)]
pub struct SignalRelay {
    registry: PresenceRegistry,
}

impl SignalRelay {
    pub fn new(registry: PresenceRegistry) -> Self {
        Self { registry }
    }

    /// `call-user` → `incoming-call`.
    pub fn call_user(&self, from: ConnectionId, to_user_id: &str, signal_data: Value) -> Delivery {
        let Some(from_user_id) = self.sender_identity(from, None) else {
            return self.unknown_sender(from, "call-user");
        };
        self.forward(
            "call-user",
            to_user_id,
            ServerMessage::IncomingCall {
                from_user_id,
                signal_data,
            },
        )
    }

    /// `answer-call` → `call-answered`.
    pub fn answer_call(
        &self,
        from: ConnectionId,
        to_user_id: &str,
        signal_data: Value,
        claimed_from: Option<String>,
    ) -> Delivery {
        let Some(from_user_id) = self.sender_identity(from, claimed_from) else {
            return self.unknown_sender(from, "answer-call");
        };
        self.forward(
            "answer-call",
            to_user_id,
            ServerMessage::CallAnswered {
                from_user_id,
                signal_data,
            },
        )
    }

    /// `ice-candidate` → `ice-candidate`. Candidates are never reordered or
    /// held back relative to offers and answers.
    pub fn ice_candidate(
        &self,
        from: ConnectionId,
        to_user_id: &str,
        candidate: Value,
        claimed_from: Option<String>,
    ) -> Delivery {
        let Some(from_user_id) = self.sender_identity(from, claimed_from) else {
            return self.unknown_sender(from, "ice-candidate");
        };
        self.forward(
            "ice-candidate",
            to_user_id,
            ServerMessage::IceCandidate {
                from_user_id,
                candidate,
            },
        )
    }

    /// `hangup-call` → `call-hangup`.
    pub fn hangup_call(
        &self,
        from: ConnectionId,
        to_user_id: &str,
        claimed_from: Option<String>,
    ) -> Delivery {
        let Some(from_user_id) = self.sender_identity(from, claimed_from) else {
            return self.unknown_sender(from, "hangup-call");
        };
        self.forward("hangup-call", to_user_id, ServerMessage::CallHangup { from_user_id })
    }

    /// The registered identity wins over whatever the client claims; the claim
    /// is only used by connections that never identified.
    fn sender_identity(&self, from: ConnectionId, claimed: Option<String>) -> Option<String> {
        self.registry
            .identity_of(from)
            .or_else(|| claimed.filter(|id| !id.is_empty()))
    }

    fn unknown_sender(&self, from: ConnectionId, event: &str) -> Delivery {
        tracing::warn!(
            connection_id = %from,
            event = event,
            "Dropping message from unidentified connection"
        );
        Delivery::UnknownSender
    }

    fn forward(&self, event: &str, to_user_id: &str, message: ServerMessage) -> Delivery {
        if self.registry.send_to_user(to_user_id, message) {
            tracing::debug!(event = event, to = to_user_id, "Forwarded");
            Delivery::Delivered
        } else {
            tracing::debug!(event = event, to = to_user_id, "Target offline, dropped");
            Delivery::TargetOffline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn join(registry: &PresenceRegistry, user_id: Option<&str>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = registry.connect(tx);
            if let Some(uid) = user_id {
                registry.register(id, uid);
            }
            let mut client = Self { id, rx };
            client.drain();
            client
        }

        /// Everything but presence broadcasts.
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if !matches!(msg, ServerMessage::OnlineList(_)) {
                    out.push(msg);
                }
            }
            out
        }
    }

    fn setup() -> (PresenceRegistry, SignalRelay) {
        let registry = PresenceRegistry::new();
        let relay = SignalRelay::new(registry.clone());
        (registry, relay)
    }

    #[test]
    fn test_call_user_stamps_sender_identity() {
        let (registry, relay) = setup();
        let alice = Client::join(&registry, Some("alice"));
        let mut bob = Client::join(&registry, Some("bob"));

        let offer = json!({"type": "offer", "sdp": "v=0"});
        assert_eq!(relay.call_user(alice.id, "bob", offer.clone()), Delivery::Delivered);

        assert_eq!(
            bob.drain(),
            vec![ServerMessage::IncomingCall {
                from_user_id: "alice".into(),
                signal_data: offer,
            }]
        );
    }

    #[test]
    fn test_call_to_unregistered_user_is_silent() {
        let (registry, relay) = setup();
        let mut alice = Client::join(&registry, Some("alice"));
        let mut carol = Client::join(&registry, Some("carol"));
        let mut lurker = Client::join(&registry, None);

        let result = relay.call_user(alice.id, "bob", json!({"type": "offer"}));

        assert_eq!(result, Delivery::TargetOffline);
        assert!(alice.drain().is_empty());
        assert!(carol.drain().is_empty());
        assert!(lurker.drain().is_empty());
    }

    #[test]
    fn test_claimed_identity_cannot_override_registration() {
        let (registry, relay) = setup();
        let bob = Client::join(&registry, Some("bob"));
        let mut alice = Client::join(&registry, Some("alice"));

        relay.answer_call(bob.id, "alice", json!({"type": "answer"}), Some("mallory".into()));

        match alice.drain().as_slice() {
            [ServerMessage::CallAnswered { from_user_id, .. }] => assert_eq!(from_user_id, "bob"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unidentified_sender_falls_back_to_claim() {
        let (registry, relay) = setup();
        let anon = Client::join(&registry, None);
        let mut alice = Client::join(&registry, Some("alice"));

        relay.hangup_call(anon.id, "alice", Some("bob".into()));
        assert_eq!(
            alice.drain(),
            vec![ServerMessage::CallHangup {
                from_user_id: "bob".into()
            }]
        );

        assert_eq!(
            relay.call_user(anon.id, "alice", json!({"type": "offer"})),
            Delivery::UnknownSender
        );
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_candidates_keep_send_order() {
        let (registry, relay) = setup();
        let alice = Client::join(&registry, Some("alice"));
        let mut bob = Client::join(&registry, Some("bob"));

        for n in 0..5 {
            relay.ice_candidate(alice.id, "bob", json!({"candidate": format!("c{}", n)}), None);
        }

        let received: Vec<String> = bob
            .drain()
            .into_iter()
            .map(|m| match m {
                ServerMessage::IceCandidate { candidate, .. } => {
                    candidate["candidate"].as_str().unwrap().to_string()
                }
                other => panic!("unexpected: {:?}", other),
            })
            .collect();
        assert_eq!(received, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[test]
    fn test_forward_follows_latest_registration() {
        let (registry, relay) = setup();
        let alice = Client::join(&registry, Some("alice"));
        let mut bob_old = Client::join(&registry, Some("bob"));
        let mut bob_new = Client::join(&registry, Some("bob"));

        relay.hangup_call(alice.id, "bob", None);

        assert!(bob_old.drain().is_empty());
        assert_eq!(bob_new.drain().len(), 1);
    }
}
