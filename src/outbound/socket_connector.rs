//! Opens the raw outbound byte stream for a destination.
//!
//! Timeouts, pooling and retries are layered on top by the outbound handlers, so
//! implementations only need to resolve and connect.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::error;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::resolver::{Resolver, resolve_single_address};
use crate::socket_util::{new_tcp_socket, set_tcp_keepalive};

#[async_trait]
pub trait SocketConnector: Send + Sync + Debug {
    async fn connect(&self, location: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>>;
}

pub struct TcpSocketConnector {
    resolver: Arc<dyn Resolver>,
    no_delay: bool,
}

impl TcpSocketConnector {
    pub fn new(resolver: Arc<dyn Resolver>, no_delay: bool) -> Self {
        Self { resolver, no_delay }
    }
}

impl Debug for TcpSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocketConnector")
            .field("no_delay", &self.no_delay)
            .finish()
    }
}

#[async_trait]
impl SocketConnector for TcpSocketConnector {
    async fn connect(&self, location: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
        let target_addr = resolve_single_address(self.resolver.as_ref(), location).await?;

        let tcp_socket = new_tcp_socket(target_addr.is_ipv6())?;
        let stream = tcp_socket.connect(target_addr).await?;

        if let Err(e) = set_tcp_keepalive(&stream, Duration::from_secs(120), Duration::from_secs(30))
        {
            error!("Failed to set TCP keepalive: {e}");
        }

        if self.no_delay && let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP no-delay: {e}");
        }

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NativeResolver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpSocketConnector::new(Arc::new(NativeResolver::new()), true);
        let location = NetLocation::from_str(&format!("127.0.0.1:{port}"), None).unwrap();
        let mut stream = connector.connect(&location).await.unwrap();
        stream.write_all(b"abcd").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpSocketConnector::new(Arc::new(NativeResolver::new()), false);
        let location = NetLocation::from_str(&format!("127.0.0.1:{port}"), None).unwrap();
        assert!(connector.connect(&location).await.is_err());
    }
}
