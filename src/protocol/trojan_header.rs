use bytes::Bytes;

use super::address_codec::{SOCKS_ADDRESS_TYPES, read_address, read_port};
use super::{HeaderError, ParsedHeader, ProtocolKind};

/// 56 hex chars of password hash followed by CRLF.
const PREFIX_LEN: usize = 58;
/// Command, address type, and at least a 4 byte body.
const MIN_REQUEST_LEN: usize = 6;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub fn parse_trojan_header(buffer: &Bytes) -> Result<ParsedHeader, HeaderError> {
    if buffer.len() < PREFIX_LEN + MIN_REQUEST_LEN {
        return Err(HeaderError::Truncated);
    }

    let request = &buffer[PREFIX_LEN..];
    let is_udp = match request[0] {
        CMD_CONNECT => false,
        CMD_UDP_ASSOCIATE => true,
        cmd => return Err(HeaderError::UnsupportedCommand(cmd)),
    };

    let (address, port_offset) = read_address(request, 1, SOCKS_ADDRESS_TYPES)?;
    let port = read_port(request, port_offset)?;

    // Skip the port and the CRLF that terminates the request. A request that ends
    // at the port carries no payload.
    let payload_offset = (port_offset + 4).min(request.len());

    Ok(ParsedHeader {
        protocol: ProtocolKind::TrojanLike,
        address,
        port,
        is_udp,
        response_prefix: None,
        payload: buffer.slice(PREFIX_LEN + payload_offset..),
    })
}
