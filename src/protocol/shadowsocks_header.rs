use bytes::Bytes;

use super::address_codec::{SOCKS_ADDRESS_TYPES, read_address, read_port};
use super::{HeaderError, ParsedHeader, ProtocolKind};

/// There is no command byte in this encapsulation. Traffic to the DNS port is the
/// only thing treated as UDP.
const DNS_PORT: u16 = 53;

pub fn parse_shadowsocks_header(buffer: &Bytes) -> Result<ParsedHeader, HeaderError> {
    let (address, port_offset) = read_address(buffer, 0, SOCKS_ADDRESS_TYPES)?;
    let port = read_port(buffer, port_offset)?;

    Ok(ParsedHeader {
        protocol: ProtocolKind::ShadowsocksLike,
        address,
        port,
        is_udp: port == DNS_PORT,
        response_prefix: None,
        payload: buffer.slice(port_offset + 2..),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_frames::*;
    use super::*;

    #[test]
    fn test_shadowsocks_port_53_is_udp() {
        let mut address = vec![3];
        address.extend_from_slice(&domain("dns.local"));
        let frame = Bytes::from(shadowsocks_frame(&address, 53, &[0x12, 0x34, 0x01, 0x00]));

        let header = parse_shadowsocks_header(&frame).unwrap();
        assert_eq!(header.address_remote(), "dns.local");
        assert_eq!(header.port, 53);
        assert!(header.is_udp);
        assert_eq!(header.response_prefix, None);
        assert_eq!(&header.payload[..], &[0x12, 0x34, 0x01, 0x00]);
    }

    #[test]
    fn test_shadowsocks_tcp_ipv4() {
        let frame = Bytes::from(shadowsocks_frame(&[1, 1, 2, 3, 4], 8080, b"hello"));
        let header = parse_shadowsocks_header(&frame).unwrap();
        assert_eq!(header.address_remote(), "1.2.3.4");
        assert_eq!(header.port, 8080);
        assert!(!header.is_udp);
        assert_eq!(&header.payload[..], b"hello");
    }

    #[test]
    fn test_shadowsocks_non_53_udp_is_tcp() {
        let frame = Bytes::from(shadowsocks_frame(&[1, 10, 0, 0, 1], 5353, b""));
        assert!(!parse_shadowsocks_header(&frame).unwrap().is_udp);
    }

    #[test]
    fn test_shadowsocks_errors() {
        assert_eq!(
            parse_shadowsocks_header(&Bytes::new()),
            Err(HeaderError::Truncated)
        );
        assert_eq!(
            parse_shadowsocks_header(&Bytes::from_static(&[0x05, 1, 2, 3])),
            Err(HeaderError::InvalidAddressType(5))
        );
        assert_eq!(
            parse_shadowsocks_header(&Bytes::from_static(&[0x03, 0x00, 0x00, 0x50])),
            Err(HeaderError::EmptyAddress(3))
        );
        // Address complete but port missing a byte.
        assert_eq!(
            parse_shadowsocks_header(&Bytes::from_static(&[0x01, 1, 2, 3, 4, 0x00])),
            Err(HeaderError::Truncated)
        );
    }
}
