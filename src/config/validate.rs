//! Turns parsed config entries into startable server configs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::address::OverrideTarget;
use crate::shared_state::RelayConfig;

use super::types::{ServerConfig, ServerEntry};

pub fn create_server_configs(entries: Vec<ServerEntry>) -> std::io::Result<Vec<ServerConfig>> {
    let mut bind_addresses: HashSet<SocketAddr> = HashSet::new();
    let mut server_configs = Vec::with_capacity(entries.len());

    for entry in entries {
        let ServerEntry {
            address,
            fallback,
            udp_relay,
            dns_server,
            websocket_path,
            tcp_settings,
            stats_interval_secs,
        } = entry;

        let bind_address: SocketAddr = address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid bind address {address}: {e}"),
            )
        })?;
        if !bind_addresses.insert(bind_address) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bind address is used more than once: {bind_address}"),
            ));
        }

        let fallback = fallback
            .map(|s| {
                OverrideTarget::parse(&s).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("invalid fallback for {bind_address}: {e}"),
                    )
                })
            })
            .transpose()?;

        if let Some(path) = &websocket_path
            && !path.starts_with('/')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("websocket path must start with '/': {path}"),
            ));
        }

        server_configs.push(ServerConfig {
            bind_address,
            fallback,
            relay: RelayConfig {
                udp_relay,
                dns_server,
            },
            websocket_path,
            tcp_settings: tcp_settings.unwrap_or_default(),
            stats_interval: (stats_interval_secs > 0)
                .then(|| Duration::from_secs(stats_interval_secs)),
        });
    }

    Ok(server_configs)
}
