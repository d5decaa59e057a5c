//! aegir - a WebSocket edge gateway.
//!
//! Each WebSocket connection carries one Trojan, VMess or Shadowsocks style stream.
//! The first message is sniffed and its header stripped, then the payload is relayed
//! to the TCP destination it names, or through the UDP relay for UDP streams.
//! Outbound connects share a connection pool and an adaptive timeout learned from
//! recent connect latencies, and failed connects are retried with backoff.

pub mod address;
pub mod async_stream;
pub mod client_channel;
pub mod config;
pub mod connection_pool;
pub mod latency_tracker;
pub mod line_reader;
pub mod outbound;
pub mod protocol;
pub mod relay_session;
pub mod resolver;
pub mod retry;
pub mod shared_state;
pub mod socket_util;
pub mod stats;
pub mod stream_pump;
pub mod tcp_server;
pub mod websocket;
