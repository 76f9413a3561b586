//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them through the presence registry and signal relay, and writing
//! outbound messages back to the socket.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::presence::ConnectionId;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// Runs for the lifetime of the connection:
/// 1. Registers the connection so it receives presence broadcasts
/// 2. Spawns a sender task that drains the outbound channel into the socket
/// 3. Processes inbound frames until the socket closes
/// 4. Unregisters, which drops any identity and rebroadcasts presence
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = state.registry.connect(tx);
    tracing::info!(connection_id = %connection_id, "WebSocket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Receive Loop ──────────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => handle_client_message(&state, connection_id, client_msg),
                Err(e) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.registry.send_to(
                        connection_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(connection_id = %connection_id, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong: axum answers pings itself
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    let user_id = state.registry.disconnect(connection_id);
    sender_task.abort();
    tracing::info!(
        connection_id = %connection_id,
        user_id = user_id.as_deref().unwrap_or("-"),
        "WebSocket disconnected"
    );
}

/// Dispatch one parsed client message.
pub fn handle_client_message(state: &RelayState, from: ConnectionId, msg: ClientMessage) {
    tracing::debug!(connection_id = %from, event = msg.event_name(), "Client message");

    match msg {
        ClientMessage::Identify { user_id } => {
            if user_id.trim().is_empty() {
                state.registry.send_to(
                    from,
                    ServerMessage::Error {
                        message: "userId must not be empty".to_string(),
                    },
                );
                return;
            }
            state.registry.register(from, &user_id);
        }

        ClientMessage::CallUser {
            to_user_id,
            signal_data,
        } => {
            state.relay.call_user(from, &to_user_id, signal_data);
        }

        ClientMessage::AnswerCall {
            to_user_id,
            signal_data,
            from_user_id,
        } => {
            state
                .relay
                .answer_call(from, &to_user_id, signal_data, from_user_id);
        }

        ClientMessage::IceCandidate {
            to_user_id,
            candidate,
            from_user_id,
        } => {
            state
                .relay
                .ice_candidate(from, &to_user_id, candidate, from_user_id);
        }

        ClientMessage::HangupCall {
            to_user_id,
            from_user_id,
        } => {
            state.relay.hangup_call(from, &to_user_id, from_user_id);
        }

        ClientMessage::Ping => {
            state.registry.send_to(from, ServerMessage::Pong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::UserDirectory;
    use crate::state::RelayConfig;
    use serde_json::json;

    fn state() -> RelayState {
        RelayState::new(RelayConfig::default(), UserDirectory::default())
    }

    fn connect(state: &RelayState) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.connect(tx), rx)
    }

    fn non_presence(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if !matches!(msg, ServerMessage::OnlineList(_)) {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_identify_then_call() {
        let state = state();
        let (alice, _a) = connect(&state);
        let (bob, mut bob_rx) = connect(&state);

        handle_client_message(&state, alice, ClientMessage::Identify { user_id: "alice".into() });
        handle_client_message(&state, bob, ClientMessage::Identify { user_id: "bob".into() });
        handle_client_message(
            &state,
            alice,
            ClientMessage::CallUser {
                to_user_id: "bob".into(),
                signal_data: json!({"type": "offer"}),
            },
        );

        assert_eq!(
            non_presence(&mut bob_rx),
            vec![ServerMessage::IncomingCall {
                from_user_id: "alice".into(),
                signal_data: json!({"type": "offer"}),
            }]
        );
    }

    #[test]
    fn test_empty_identify_is_rejected() {
        let state = state();
        let (conn, mut rx) = connect(&state);

        handle_client_message(&state, conn, ClientMessage::Identify { user_id: " ".into() });

        assert!(matches!(non_presence(&mut rx).as_slice(), [ServerMessage::Error { .. }]));
        assert_eq!(state.registry.online_count(), 0);
    }

    #[test]
    fn test_ping_pong() {
        let state = state();
        let (conn, mut rx) = connect(&state);
        handle_client_message(&state, conn, ClientMessage::Ping);
        assert_eq!(non_presence(&mut rx), vec![ServerMessage::Pong]);
    }
}
