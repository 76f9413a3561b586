//! # Relay Client
//!
//! WebSocket client for the duet relay server.
//!
//! ## Architecture
//!
//! [`RelayConnection::spawn`] runs one background task that owns the socket:
//!
//! - Outbound messages are queued on a [`RelaySender`] and survive
//!   reconnects; anything queued while disconnected goes out after the next
//!   successful connect.
//! - Every (re)connect sends `identify` first. The relay keeps no state
//!   across restarts, so re-identifying is required, not optional.
//! - Lost connections are retried with exponential backoff up to
//!   `max_reconnect_attempts` consecutive failures, then the task reports
//!   [`RelayStatus::Failed`] and exits.
//!
//! Inbound frames and status changes arrive as [`RelayEvent`]s.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};

/// Messages sent from client to relay server.
/// Must match the relay server's `ClientMessage` enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayClientMessage {
    Identify {
        user_id: String,
    },
    CallUser {
        to_user_id: String,
        signal_data: Value,
    },
    AnswerCall {
        to_user_id: String,
        signal_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    IceCandidate {
        to_user_id: String,
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    HangupCall {
        to_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    Ping,
}

/// Messages received from the relay server.
/// Must match the relay server's `ServerMessage` enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayServerMessage {
    OnlineList(Vec<String>),
    IncomingCall {
        from_user_id: String,
        signal_data: Value,
    },
    CallAnswered {
        from_user_id: String,
        signal_data: Value,
    },
    IceCandidate {
        from_user_id: String,
        candidate: Value,
    },
    CallHangup {
        from_user_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Relay connection status.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayStatus {
    Connecting,
    /// Connected and `identify` sent
    Connected,
    /// Lost the connection; retry `attempt` is scheduled
    Reconnecting { attempt: u32 },
    /// Gave up reconnecting, or the handle was dropped
    Disconnected,
    /// Reconnect budget exhausted
    Failed(String),
}

/// Something the relay connection reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Status(RelayStatus),
    Message(RelayServerMessage),
}

/// Relay connection settings.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket URL, e.g. `ws://localhost:9001/ws`
    pub url: String,
    /// Identity sent on every connect
    pub user_id: String,
    /// Consecutive failed connects before giving up
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
            max_reconnect_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Cloneable handle for queueing messages to the relay.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayClientMessage>,
}

impl RelaySender {
    pub fn new(tx: mpsc::UnboundedSender<RelayClientMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message. Fails only once the connection task has exited.
    pub fn send(&self, msg: RelayClientMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::NotConnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Why one connected session ended.
enum SessionEnd {
    /// The remote closed or the socket errored
    Lost,
    /// Every sender handle, or the event receiver, was dropped
    Shutdown,
}

/// Background task owning the relay socket.
pub struct RelayConnection;

impl RelayConnection {
    /// Start connecting. Returns the outbound handle, the event stream and
    /// the task handle.
    pub fn spawn(
        config: RelayClientConfig,
    ) -> (RelaySender, mpsc::UnboundedReceiver<RelayEvent>, JoinHandle<()>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection_loop(config, out_rx, event_tx));
        (RelaySender::new(out_tx), event_rx, task)
    }
}

async fn connection_loop(
    config: RelayClientConfig,
    mut outbound: mpsc::UnboundedReceiver<RelayClientMessage>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut failures = 0u32;
    let mut backoff = config.initial_backoff;

    loop {
        let _ = events.send(RelayEvent::Status(RelayStatus::Connecting));
        tracing::info!(url = config.url.as_str(), "Connecting to relay...");

        match connect_once(&config, &mut outbound, &events).await {
            Ok(SessionEnd::Shutdown) => {
                tracing::info!("Relay client shutting down");
                let _ = events.send(RelayEvent::Status(RelayStatus::Disconnected));
                return;
            }
            Ok(SessionEnd::Lost) => {
                tracing::warn!(url = config.url.as_str(), "Relay connection lost");
                failures = 0;
                backoff = config.initial_backoff;
            }
            Err(e) => {
                tracing::warn!(url = config.url.as_str(), error = %e, "Relay connection failed");
                failures += 1;
                if failures > config.max_reconnect_attempts {
                    let _ = events.send(RelayEvent::Status(RelayStatus::Failed(e.to_string())));
                    return;
                }
            }
        }

        let _ = events.send(RelayEvent::Status(RelayStatus::Reconnecting {
            attempt: failures + 1,
        }));
        tracing::info!(
            backoff_ms = backoff.as_millis() as u64,
            "Reconnecting to relay after backoff..."
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// Connect, identify, then pump frames both ways until the socket ends.
async fn connect_once(
    config: &RelayClientConfig,
    outbound: &mut mpsc::UnboundedReceiver<RelayClientMessage>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> Result<SessionEnd> {
    let (ws_stream, _) = connect_async(config.url.as_str())
        .await
        .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let identify = encode_frame(&RelayClientMessage::Identify {
        user_id: config.user_id.clone(),
    })?;
    ws_sender
        .send(WsMessage::Text(identify.into()))
        .await
        .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

    tracing::info!(user_id = config.user_id.as_str(), "Connected to relay");
    if events.send(RelayEvent::Status(RelayStatus::Connected)).is_err() {
        return Ok(SessionEnd::Shutdown);
    }

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(msg) = queued else {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                };
                match encode_frame(&msg) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                            return Ok(SessionEnd::Lost);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, code = e.code(), "Dropping outbound relay message");
                    }
                }
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match decode_frame(&text) {
                        Ok(msg) => {
                            if events.send(RelayEvent::Message(msg)).is_err() {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, code = e.code(), "Skipping relay frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(SessionEnd::Lost),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Relay WebSocket error");
                    return Ok(SessionEnd::Lost);
                }
                Some(Ok(_)) => {} // tungstenite answers pings itself
            }
        }
    }
}

fn encode_frame(msg: &RelayClientMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| Error::SerializationError(e.to_string()))
}

/// Parse one text frame from the relay. Frames this client does not
/// understand are protocol errors, not connection failures.
fn decode_frame(text: &str) -> Result<RelayServerMessage> {
    serde_json::from_str(text).map_err(|e| Error::ProtocolError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_identify_serialization() {
        let msg = RelayClientMessage::Identify {
            user_id: "alice".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"event":"identify","data":{"userId":"alice"}}"#);
    }

    #[test]
    fn test_answer_call_carries_sender() {
        let msg = RelayClientMessage::AnswerCall {
            to_user_id: "alice".to_string(),
            signal_data: json!({"type": "answer", "sdp": "v=0"}),
            from_user_id: Some("bob".to_string()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "answer-call");
        assert_eq!(json["data"]["toUserId"], "alice");
        assert_eq!(json["data"]["fromUserId"], "bob");
        assert_eq!(json["data"]["signalData"]["type"], "answer");
    }

    #[test]
    fn test_hangup_without_sender_omits_field() {
        let msg = RelayClientMessage::HangupCall {
            to_user_id: "bob".to_string(),
            from_user_id: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({"event": "hangup-call", "data": {"toUserId": "bob"}}));
    }

    #[test]
    fn test_relay_server_message_online_list() {
        let json = r#"{"event":"online-list","data":["alice","bob"]}"#;
        let msg: RelayServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            RelayServerMessage::OnlineList(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn test_relay_server_message_incoming_call() {
        let json = r#"{"event":"incoming-call","data":{"fromUserId":"alice","signalData":{"type":"offer","sdp":"v=0"}}}"#;
        let msg: RelayServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            RelayServerMessage::IncomingCall {
                from_user_id,
                signal_data,
            } => {
                assert_eq!(from_user_id, "alice");
                assert_eq!(signal_data["type"], "offer");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_relay_server_message_pong() {
        let msg: RelayServerMessage = serde_json::from_str(r#"{"event":"pong"}"#).unwrap();
        assert_eq!(msg, RelayServerMessage::Pong);
    }

    #[test]
    fn test_signal_payload_key_order_survives() {
        let json = r#"{"event":"call-answered","data":{"fromUserId":"bob","signalData":{"type":"answer","sdp":"v=0","z":1,"a":2}}}"#;
        let msg: RelayServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(serde_json::to_string(&msg).unwrap(), json);
    }

    #[test]
    fn test_unknown_relay_frame_is_a_protocol_error() {
        let err = assert_err!(decode_frame(r#"{"event":"teleport","data":{}}"#));
        assert!(matches!(err, Error::ProtocolError(_)));
        assert_eq!(err.code(), 503);

        let msg = assert_ok!(decode_frame(r#"{"event":"pong"}"#));
        assert_eq!(msg, RelayServerMessage::Pong);
    }

    #[test]
    fn test_encode_frame_matches_wire_format() {
        let json = assert_ok!(encode_frame(&RelayClientMessage::Ping));
        assert_eq!(json, r#"{"event":"ping"}"#);
    }

    #[test]
    fn test_sender_fails_after_task_exits() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = RelaySender::new(tx);
        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(sender.send(RelayClientMessage::Ping), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_unreachable_relay_gives_up() {
        let mut config = RelayClientConfig::new("ws://127.0.0.1:1/ws", "alice");
        config.max_reconnect_attempts = 1;
        config.initial_backoff = Duration::from_millis(10);

        let (_sender, mut events, task) = RelayConnection::spawn(config);

        let mut statuses = Vec::new();
        while let Some(RelayEvent::Status(status)) = events.recv().await {
            statuses.push(status);
        }
        task.await.unwrap();

        assert_eq!(statuses.first(), Some(&RelayStatus::Connecting));
        assert!(matches!(statuses.last(), Some(RelayStatus::Failed(_))));
        assert!(statuses.contains(&RelayStatus::Reconnecting { attempt: 2 }));
    }
}
