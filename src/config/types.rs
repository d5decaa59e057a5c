use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Address, NetLocation, OverrideTarget};
use crate::shared_state::RelayConfig;

pub const DEFAULT_UDP_RELAY_HOST: &str = "udp-relay.hobihaus.space";
pub const DEFAULT_UDP_RELAY_PORT: u16 = 7300;

fn default_true() -> bool {
    true
}

fn default_udp_relay() -> NetLocation {
    NetLocation::new(
        Address::Hostname(DEFAULT_UDP_RELAY_HOST.to_string()),
        DEFAULT_UDP_RELAY_PORT,
    )
}

fn default_dns_server() -> NetLocation {
    NetLocation::new(Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)), 53)
}

fn default_stats_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub no_delay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig { no_delay: true }
    }
}

/// One server as written in a config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default = "default_udp_relay")]
    pub udp_relay: NetLocation,
    #[serde(default = "default_dns_server")]
    pub dns_server: NetLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_path: Option<String>,
    #[serde(default)]
    pub tcp_settings: Option<TcpConfig>,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// A validated server, ready to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub fallback: Option<OverrideTarget>,
    pub relay: RelayConfig,
    pub websocket_path: Option<String>,
    pub tcp_settings: TcpConfig,
    /// `None` disables the periodic stats line.
    pub stats_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_entry_uses_defaults() {
        let entries: Vec<ServerEntry> = serde_yaml::from_str("- address: 0.0.0.0:8080\n").unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.address, "0.0.0.0:8080");
        assert!(entry.fallback.is_none());
        assert_eq!(entry.udp_relay.to_string(), "udp-relay.hobihaus.space:7300");
        assert_eq!(entry.dns_server.to_string(), "8.8.8.8:53");
        assert!(entry.tcp_settings.is_none());
        assert_eq!(entry.stats_interval_secs, 300);
    }

    #[test]
    fn test_full_entry() {
        let yaml = r#"
- address: 127.0.0.1:9000
  fallback: proxy.example=443
  udp_relay: relay.example:7400
  dns_server: 1.1.1.1:53
  websocket_path: /ws
  tcp_settings:
    no_delay: false
  stats_interval_secs: 0
"#;
        let entries: Vec<ServerEntry> = serde_yaml::from_str(yaml).unwrap();
        let entry = &entries[0];
        assert_eq!(entry.fallback.as_deref(), Some("proxy.example=443"));
        assert_eq!(entry.udp_relay.to_string(), "relay.example:7400");
        assert_eq!(entry.websocket_path.as_deref(), Some("/ws"));
        assert!(!entry.tcp_settings.as_ref().unwrap().no_delay);
        assert_eq!(entry.stats_interval_secs, 0);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "- address: 127.0.0.1:9000\n  protocol: vless\n";
        assert!(serde_yaml::from_str::<Vec<ServerEntry>>(yaml).is_err());
    }

    #[test]
    fn test_relay_without_port_rejected() {
        let yaml = "- address: 127.0.0.1:9000\n  udp_relay: relay.example\n";
        assert!(serde_yaml::from_str::<Vec<ServerEntry>>(yaml).is_err());
    }
}
