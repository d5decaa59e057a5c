use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// Byte stream used for outbound connections. Boxed so connectors can hand back
/// whatever transport they created.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl AsyncStream for TcpStream {}

impl AsyncStream for DuplexStream {}
