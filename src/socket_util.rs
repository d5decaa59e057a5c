use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

pub fn new_tcp_listener(
    bind_address: SocketAddr,
    backlog: i32,
) -> std::io::Result<tokio::net::TcpListener> {
    let domain = if bind_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_address.into())?;
    socket.listen(backlog)?;
    tokio::net::TcpListener::from_std(socket.into())
}

#[inline]
pub fn new_tcp_socket(is_ipv6: bool) -> std::io::Result<tokio::net::TcpSocket> {
    if is_ipv6 {
        tokio::net::TcpSocket::new_v6()
    } else {
        tokio::net::TcpSocket::new_v4()
    }
}

pub fn set_tcp_keepalive(
    stream: &tokio::net::TcpStream,
    idle_time: Duration,
    interval: Duration,
) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(idle_time)
        .with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_accepts_with_keepalive() {
        let listener = new_tcp_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move {
            new_tcp_socket(false).unwrap().connect(addr).await.unwrap()
        });
        let (stream, _) = listener.accept().await.unwrap();
        set_tcp_keepalive(&stream, Duration::from_secs(60), Duration::from_secs(10)).unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
        connect.await.unwrap();
    }
}
