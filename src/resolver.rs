use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use log::debug;

use crate::address::NetLocation;

pub trait Resolver: Send + Sync {
    fn resolve_location(
        &self,
        location: &NetLocation,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>>;
}

#[derive(Debug, Default)]
pub struct NativeResolver;

impl NativeResolver {
    pub fn new() -> Self {
        NativeResolver {}
    }
}

impl Resolver for NativeResolver {
    fn resolve_location(
        &self,
        location: &NetLocation,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>> {
        if let Some(socket_addr) = location.to_socket_addr_nonblocking() {
            return Box::pin(futures::future::ready(Ok(vec![socket_addr])));
        }

        let address = location.address().to_string();
        let port = location.port();
        use futures::future::FutureExt;
        Box::pin(
            tokio::net::lookup_host((address.clone(), port)).map(move |result| {
                let ret = result.map(|r| {
                    r.filter(|addr| !addr.ip().is_unspecified())
                        .collect::<Vec<_>>()
                });
                debug!("NativeResolver resolved {address}:{port} -> {ret:?}");
                ret
            }),
        )
    }
}

pub async fn resolve_single_address(
    resolver: &dyn Resolver,
    location: &NetLocation,
) -> std::io::Result<SocketAddr> {
    let resolve_results = resolver.resolve_location(location).await?;
    resolve_results.first().copied().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve location: {location}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_ip_location_skips_lookup() {
        let resolver = NativeResolver::new();
        let location = NetLocation::new(Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let addr = resolve_single_address(&resolver, &location).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let resolver = NativeResolver::new();
        let location = NetLocation::new(Address::Hostname("localhost".to_string()), 53);
        let addr = resolve_single_address(&resolver, &location).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 53);
    }
}
