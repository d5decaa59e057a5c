//! Wire-level decapsulation of the three supported tunnel encapsulations.
//!
//! The first client frame of every stream is classified by [`sniff`] and then handed
//! to the parser for that [`ProtocolKind`]. Each parser recovers the destination,
//! whether the stream carries UDP, an optional response prefix that must precede the
//! first reply, and the payload that followed the header.

mod address_codec;
mod shadowsocks_header;
mod sniffer;
mod trojan_header;
mod vmess_header;

use bytes::Bytes;

use crate::address::{Address, AddressType, NetLocation};

pub use shadowsocks_header::parse_shadowsocks_header;
pub use sniffer::sniff;
pub use trojan_header::parse_trojan_header;
pub use vmess_header::parse_vmess_header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    TrojanLike,
    VmessLike,
    ShadowsocksLike,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::TrojanLike => "trojan",
            ProtocolKind::VmessLike => "vmess",
            ProtocolKind::ShadowsocksLike => "shadowsocks",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid request data")]
    Truncated,
    #[error("command {0} is not supported")]
    UnsupportedCommand(u8),
    #[error("invalid address type {0}")]
    InvalidAddressType(u8),
    #[error("address is empty, address type is {0}")]
    EmptyAddress(u8),
}

impl From<HeaderError> for std::io::Error {
    fn from(e: HeaderError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    }
}

/// Decapsulated first frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub protocol: ProtocolKind,
    pub address: Address,
    pub port: u16,
    pub is_udp: bool,
    pub response_prefix: Option<Bytes>,
    pub payload: Bytes,
}

impl ParsedHeader {
    pub fn address_remote(&self) -> String {
        self.address.to_string()
    }

    pub fn address_type(&self) -> AddressType {
        self.address.address_type()
    }

    pub fn location(&self) -> NetLocation {
        NetLocation::new(self.address.clone(), self.port)
    }
}

/// Parses `frame` with the parser matching `kind`.
pub fn parse_header(kind: ProtocolKind, frame: &Bytes) -> Result<ParsedHeader, HeaderError> {
    match kind {
        ProtocolKind::TrojanLike => parse_trojan_header(frame),
        ProtocolKind::VmessLike => parse_vmess_header(frame),
        ProtocolKind::ShadowsocksLike => parse_shadowsocks_header(frame),
    }
}

/// Sniffs and parses in one step.
pub fn decapsulate(frame: &Bytes) -> Result<ParsedHeader, HeaderError> {
    parse_header(sniff(frame), frame)
}
