use bytes::Bytes;

use super::address_codec::{VMESS_ADDRESS_TYPES, read_address, read_port};
use super::{HeaderError, ParsedHeader, ProtocolKind};

// version(1) + uuid(16) + options length(1)
const FIXED_HEADER_LEN: usize = 18;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;

pub fn parse_vmess_header(buffer: &Bytes) -> Result<ParsedHeader, HeaderError> {
    if buffer.len() < FIXED_HEADER_LEN {
        return Err(HeaderError::Truncated);
    }

    let version = buffer[0];
    let options_len = buffer[17] as usize;

    let command_offset = FIXED_HEADER_LEN + options_len;
    let is_udp = match buffer.get(command_offset) {
        Some(&CMD_TCP) => false,
        Some(&CMD_UDP) => true,
        Some(&cmd) => return Err(HeaderError::UnsupportedCommand(cmd)),
        None => return Err(HeaderError::Truncated),
    };

    let port = read_port(buffer, command_offset + 1)?;
    let (address, payload_offset) = read_address(buffer, command_offset + 3, VMESS_ADDRESS_TYPES)?;

    Ok(ParsedHeader {
        protocol: ProtocolKind::VmessLike,
        address,
        port,
        is_udp,
        response_prefix: Some(Bytes::copy_from_slice(&[version, 0])),
        payload: buffer.slice(payload_offset..),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_frames::*;
    use super::*;
    use crate::address::AddressType;

    #[test]
    fn test_vmess_tcp_domain() {
        let mut address = vec![2];
        address.extend_from_slice(&domain("www.example.com"));
        let frame = Bytes::from(vmess_frame(3, &[], 1, 443, &address, b"\x16\x03\x01"));

        let header = parse_vmess_header(&frame).unwrap();
        assert_eq!(header.protocol, ProtocolKind::VmessLike);
        assert_eq!(header.address_remote(), "www.example.com");
        assert_eq!(header.address_type(), AddressType::DomainName);
        assert_eq!(header.port, 443);
        assert!(!header.is_udp);
        assert_eq!(header.response_prefix.as_deref(), Some(&[3u8, 0][..]));
        assert_eq!(&header.payload[..], b"\x16\x03\x01");
    }

    #[test]
    fn test_vmess_skips_options() {
        let frame = Bytes::from(vmess_frame(
            1,
            &[0xaa, 0xbb, 0xcc, 0xdd],
            2,
            53,
            &[1, 8, 8, 4, 4],
            b"query",
        ));
        let header = parse_vmess_header(&frame).unwrap();
        assert_eq!(header.address_remote(), "8.8.4.4");
        assert_eq!(header.port, 53);
        assert!(header.is_udp);
        assert_eq!(&header.payload[..], b"query");
    }

    #[test]
    fn test_vmess_ipv6() {
        let mut address = vec![3];
        address.extend_from_slice(&[0u8; 16]);
        let frame = Bytes::from(vmess_frame(0, &[], 1, 8443, &address, b""));
        let header = parse_vmess_header(&frame).unwrap();
        assert_eq!(header.address_remote(), "0:0:0:0:0:0:0:0");
        assert_eq!(header.address_type(), AddressType::Ipv6);
        assert!(header.payload.is_empty());
    }

    #[test]
    fn test_vmess_unsupported_command() {
        let frame = Bytes::from(vmess_frame(0, &[], 3, 80, &[1, 1, 1, 1, 1], b""));
        assert_eq!(
            parse_vmess_header(&frame),
            Err(HeaderError::UnsupportedCommand(3))
        );
    }

    #[test]
    fn test_vmess_socks_domain_code_is_invalid() {
        // 0x04 is IPv6 in SOCKS numbering but has no meaning here.
        let frame = Bytes::from(vmess_frame(0, &[], 1, 80, &[4, 0, 0, 0, 0], b""));
        assert_eq!(
            parse_vmess_header(&frame),
            Err(HeaderError::InvalidAddressType(4))
        );
    }

    #[test]
    fn test_vmess_truncated() {
        assert_eq!(
            parse_vmess_header(&Bytes::from_static(&[0u8; 17])),
            Err(HeaderError::Truncated)
        );

        // Options length runs past the end of the buffer.
        let mut frame = vmess_frame(0, &[], 1, 80, &[1, 1, 1, 1, 1], b"");
        frame[17] = 100;
        assert_eq!(
            parse_vmess_header(&Bytes::from(frame)),
            Err(HeaderError::Truncated)
        );

        let frame = vmess_frame(0, &[], 1, 80, &[1, 1, 1], b"");
        assert_eq!(
            parse_vmess_header(&Bytes::from(frame)),
            Err(HeaderError::Truncated)
        );
    }

    #[test]
    fn test_vmess_empty_domain() {
        let frame = Bytes::from(vmess_frame(0, &[], 1, 80, &[2, 0], b"tail"));
        assert_eq!(
            parse_vmess_header(&frame),
            Err(HeaderError::EmptyAddress(2))
        );
    }
}
