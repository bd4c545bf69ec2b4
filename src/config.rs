//! Network configuration for the peer session core.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery;

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multicast group for presence announcements.
    pub multicast_addr: Ipv4Addr,
    /// Port of the multicast group.
    pub multicast_port: u16,
    /// Interval between presence announcements.
    pub announce_interval: Duration,
    /// Run the discovery announce/listen loops on start.
    pub discovery_enabled: bool,
    /// Drop peers not heard from within this window; `None` keeps them until
    /// an explicit offline notice.
    pub peer_expiry: Option<Duration>,
    /// Give up on an unanswered outgoing call after this long; `None` waits
    /// forever.
    pub call_timeout: Option<Duration>,
    /// Directory where received files are stored.
    pub download_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_addr: discovery::MULTICAST_ADDR,
            multicast_port: discovery::MULTICAST_PORT,
            announce_interval: Duration::from_millis(discovery::ANNOUNCE_INTERVAL_MS),
            discovery_enabled: true,
            peer_expiry: None,
            call_timeout: None,
            download_dir: PathBuf::from("."),
        }
    }
}

impl NetworkConfig {
    /// Create a new network configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.multicast_addr, Ipv4Addr::new(230, 0, 0, 0));
        assert_eq!(config.multicast_port, 9999);
        assert_eq!(config.announce_interval, Duration::from_secs(2));
        assert!(config.discovery_enabled);
        assert!(config.peer_expiry.is_none());
        assert!(config.call_timeout.is_none());
    }
}
