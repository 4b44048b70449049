use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN fleet used for NAT traversal by default.
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Configuration for the peer transport.
#[derive(Debug, Clone)]
pub struct PeerTransportConfig {
    /// STUN/TURN urls for connection establishment. Empty means host
    /// candidates only (loopback / same-LAN setups).
    pub ice_servers: Vec<String>,
    /// Label of the outbound control channel, created before the offer so
    /// the offer already advertises it.
    pub control_channel_label: String,
    /// Label of the inbound frame channel announced by the agent.
    pub screen_channel_label: String,
    /// Bound on waiting for local ICE gathering before the offer ships.
    pub gather_timeout: Duration,
}

impl Default for PeerTransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            control_channel_label: "control".to_string(),
            screen_channel_label: "screen".to_string(),
            gather_timeout: Duration::from_secs(3),
        }
    }
}

impl PeerTransportConfig {
    /// Host-candidates-only configuration, for loopback tests.
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub(crate) fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_the_stun_fleet() {
        let config = PeerTransportConfig::default();
        assert_eq!(config.ice_servers.len(), 5);
        assert!(config.ice_servers.iter().all(|u| u.starts_with("stun:")));
        assert_eq!(config.control_channel_label, "control");
    }

    #[test]
    fn host_only_config_has_no_ice_servers() {
        assert!(PeerTransportConfig::host_only().ice_servers.is_empty());
    }
}
