//! Driver task that feeds a [`CallSession`].
//!
//! One task owns the inbound side: relay frames, peer events and a timer
//! tick are applied to the session one at a time, in arrival order. UI
//! intents call the session directly through [`CallClient::session`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::call::config::CallConfig;
use crate::call::media::MediaDevices;
use crate::call::peer::{PeerConnector, PeerEnvelope};
use crate::call::session::{CallEvent, CallSession};
use crate::network::relay_client::{RelayClientConfig, RelayConnection, RelayEvent};

/// Default interval for ring-timeout and re-negotiation checks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// A running call client.
///
/// Dropping it hangs up and stops the driver and relay tasks.
pub struct CallClient {
    session: CallSession,
    driver: JoinHandle<()>,
    relay: Option<JoinHandle<()>>,
}

impl CallClient {
    /// Connect to the relay as `relay.user_id` and start driving a new session.
    /// Returns the client and the session's event stream.
    pub fn connect(
        relay: RelayClientConfig,
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let user_id = relay.user_id.clone();
        let (sender, relay_events, relay_task) = RelayConnection::spawn(relay);
        let (session, channels) = CallSession::new(user_id, config, devices, connector, sender);

        let mut client = Self::spawn(session, relay_events, channels.peer_events, DEFAULT_TICK);
        client.relay = Some(relay_task);
        (client, channels.events)
    }

    /// Drive an existing session from the given event sources.
    pub fn spawn(
        session: CallSession,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        peer_events: mpsc::UnboundedReceiver<PeerEnvelope>,
        tick: Duration,
    ) -> Self {
        let driver = tokio::spawn(drive(session.clone(), relay_events, peer_events, tick));
        Self {
            session,
            driver,
            relay: None,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Hang up and stop the driver and relay tasks.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.session.hangup();
        self.driver.abort();
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        tracing::debug!(user_id = self.session.user_id(), "Call client stopped");
    }
}

async fn drive(
    session: CallSession,
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEnvelope>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut relay_open = true;

    loop {
        tokio::select! {
            event = relay_events.recv(), if relay_open => match event {
                Some(RelayEvent::Message(msg)) => session.handle_relay_message(msg).await,
                Some(RelayEvent::Status(status)) => session.handle_relay_status(status),
                None => {
                    tracing::info!(user_id = session.user_id(), "Relay event stream ended");
                    relay_open = false;
                }
            },
            Some(envelope) = peer_events.recv() => session.handle_peer_event(envelope).await,
            _ = ticker.tick() => session.poll_timers(Instant::now()).await,
        }
    }
}
