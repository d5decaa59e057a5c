mod socket_connector;
mod tcp_outbound;
mod udp_outbound;

pub use socket_connector::{SocketConnector, TcpSocketConnector};
pub use tcp_outbound::{TcpRequest, handle_tcp_outbound};
pub use udp_outbound::{UDP_RELAY_TIMEOUT, handle_udp_outbound, relay_envelope};
