//! Call session configuration.

use std::time::Duration;

use crate::call::media::MediaConstraints;
use crate::call::peer::IceServer;

/// What to do with an offer from someone else while a call is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Drop it; the other caller keeps ringing until they give up
    #[default]
    Ignore,
    /// Answer with `hangup-call` so the other caller goes idle at once
    Decline,
}

/// Tunables for a [`CallSession`](crate::call::CallSession).
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// Devices to open for calls and previews
    pub constraints: MediaConstraints,
    /// How long `calling`/`ringing` may last before giving up. `None` waits forever.
    pub ring_timeout: Option<Duration>,
    /// Re-negotiations attempted after a connectivity failure before hanging up
    pub reconnect_attempts: u32,
    /// Delay before the first re-negotiation; doubled for each later one
    pub reconnect_backoff: Duration,
    /// After its peer fails, how long the answering side waits past the
    /// caller's backoff for a new offer before hanging up
    pub reoffer_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub trickle: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::from_env(),
            constraints: MediaConstraints::default(),
            ring_timeout: Some(Duration::from_secs(45)),
            reconnect_attempts: 2,
            reconnect_backoff: Duration::from_secs(1),
            reoffer_timeout: Duration::from_secs(10),
            busy_policy: BusyPolicy::Ignore,
            trickle: true,
        }
    }
}

impl CallConfig {
    /// Backoff before re-negotiation number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.reconnect_backoff.saturating_mul(1u32 << exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.reconnect_attempts, 2);
        assert_eq!(config.reoffer_timeout, Duration::from_secs(10));
        assert_eq!(config.busy_policy, BusyPolicy::Ignore);
        assert!(config.trickle);
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = CallConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
    }
}
