//! Server state management.
//!
//! Bundles the presence registry, the signal relay built on it, the user
//! directory and the server configuration into one clonable handle that the
//! router hands to every request and socket.

use std::path::PathBuf;

use crate::directory::UserDirectory;
use crate::presence::PresenceRegistry;
use crate::relay::SignalRelay;

/// Default listen port.
const DEFAULT_PORT: u16 = 9001;

/// Default location of the user directory file.
const DEFAULT_USERS_FILE: &str = "data/users.json";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// JSON file backing `GET /api/users`.
    pub users_file: PathBuf,
    /// CORS origins. Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            users_file: PathBuf::from(DEFAULT_USERS_FILE),
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub registry: PresenceRegistry,
    pub relay: SignalRelay,
    pub directory: UserDirectory,
    pub config: RelayConfig,
}

impl RelayState {
    /// Build state with a fresh registry and the given directory.
    pub fn new(config: RelayConfig, directory: UserDirectory) -> Self {
        let registry = PresenceRegistry::new();
        Self {
            relay: SignalRelay::new(registry.clone()),
            registry,
            directory,
            config,
        }
    }

    /// Build state, loading the directory from `config.users_file`.
    pub fn from_config(config: RelayConfig) -> Self {
        let directory = UserDirectory::load(&config.users_file);
        Self::new(config, directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 9001);
        assert_eq!(config.bind_addr(), "0.0.0.0:9001");
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_states_do_not_share_registries() {
        let a = RelayState::new(RelayConfig::default(), UserDirectory::default());
        let b = RelayState::new(RelayConfig::default(), UserDirectory::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = a.registry.connect(tx);
        a.registry.register(conn, "alice");

        assert_eq!(a.registry.online_count(), 1);
        assert_eq!(b.registry.online_count(), 0);
    }
}
