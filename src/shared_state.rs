use std::sync::Arc;

use crate::address::NetLocation;
use crate::connection_pool::{ConnectionPool, OutboundSocket};
use crate::latency_tracker::LatencyTracker;
use crate::outbound::SocketConnector;
use crate::stats::Stats;

/// Where UDP traffic is tunneled.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub udp_relay: NetLocation,
    pub dns_server: NetLocation,
}

/// Caches and counters shared by every stream of one server.
pub struct SharedState {
    pub stats: Arc<Stats>,
    pub latency: LatencyTracker,
    pub pool: ConnectionPool<OutboundSocket>,
    pub connector: Arc<dyn SocketConnector>,
    pub relay: RelayConfig,
}

impl SharedState {
    pub fn new(connector: Arc<dyn SocketConnector>, relay: RelayConfig) -> Self {
        let stats = Arc::new(Stats::new());
        Self {
            latency: LatencyTracker::new(stats.clone()),
            pool: ConnectionPool::new(stats.clone()),
            stats,
            connector,
            relay,
        }
    }
}
