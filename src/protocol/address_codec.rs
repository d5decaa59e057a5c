use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address::Address;

use super::HeaderError;

/// Discriminant bytes an encapsulation uses for each address family.
#[derive(Debug, Clone, Copy)]
pub struct AddressTypeCodes {
    pub ipv4: u8,
    pub domain: u8,
    pub ipv6: u8,
}

/// SOCKS5 numbering, shared by the Trojan-like and Shadowsocks-like headers.
pub const SOCKS_ADDRESS_TYPES: AddressTypeCodes = AddressTypeCodes {
    ipv4: 0x01,
    domain: 0x03,
    ipv6: 0x04,
};

pub const VMESS_ADDRESS_TYPES: AddressTypeCodes = AddressTypeCodes {
    ipv4: 0x01,
    domain: 0x02,
    ipv6: 0x03,
};

/// Reads an address starting with its type byte at `offset`. Returns the address and
/// the offset of the first byte after it.
pub fn read_address(
    buf: &[u8],
    offset: usize,
    codes: AddressTypeCodes,
) -> Result<(Address, usize), HeaderError> {
    let address_type = *buf.get(offset).ok_or(HeaderError::Truncated)?;
    let value_offset = offset + 1;

    if address_type == codes.ipv4 {
        let octets: [u8; 4] = slice_at(buf, value_offset, 4)?
            .try_into()
            .map_err(|_| HeaderError::Truncated)?;
        Ok((Address::Ipv4(Ipv4Addr::from(octets)), value_offset + 4))
    } else if address_type == codes.domain {
        let len = *buf.get(value_offset).ok_or(HeaderError::Truncated)? as usize;
        let name_offset = value_offset + 1;
        let name = slice_at(buf, name_offset, len)?;
        if name.is_empty() {
            return Err(HeaderError::EmptyAddress(address_type));
        }
        let hostname = String::from_utf8_lossy(name).into_owned();
        Ok((Address::Hostname(hostname), name_offset + len))
    } else if address_type == codes.ipv6 {
        let octets: [u8; 16] = slice_at(buf, value_offset, 16)?
            .try_into()
            .map_err(|_| HeaderError::Truncated)?;
        Ok((Address::Ipv6(Ipv6Addr::from(octets)), value_offset + 16))
    } else {
        Err(HeaderError::InvalidAddressType(address_type))
    }
}

pub fn read_port(buf: &[u8], offset: usize) -> Result<u16, HeaderError> {
    let bytes = slice_at(buf, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], HeaderError> {
    buf.get(offset..offset + len).ok_or(HeaderError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ipv4() {
        let (address, next) = read_address(&[0x01, 1, 2, 3, 4, 0xff], 0, SOCKS_ADDRESS_TYPES)
            .unwrap();
        assert_eq!(address.to_string(), "1.2.3.4");
        assert_eq!(next, 5);
    }

    #[test]
    fn test_read_ipv6_zero() {
        let mut buf = vec![0x04];
        buf.extend_from_slice(&[0u8; 16]);
        let (address, next) = read_address(&buf, 0, SOCKS_ADDRESS_TYPES).unwrap();
        assert_eq!(address.to_string(), "0:0:0:0:0:0:0:0");
        assert_eq!(next, 17);

        // Same bytes under VMess numbering use discriminant 3.
        buf[0] = 0x03;
        let (address, _) = read_address(&buf, 0, VMESS_ADDRESS_TYPES).unwrap();
        assert!(address.is_ipv6());
    }

    #[test]
    fn test_read_domain() {
        let mut buf = vec![0x00, 0x03, 9];
        buf.extend_from_slice(b"dns.local");
        let (address, next) = read_address(&buf, 1, SOCKS_ADDRESS_TYPES).unwrap();
        assert_eq!(address.hostname(), Some("dns.local"));
        assert_eq!(next, buf.len());
    }

    #[test]
    fn test_read_empty_domain() {
        assert_eq!(
            read_address(&[0x03, 0], 0, SOCKS_ADDRESS_TYPES),
            Err(HeaderError::EmptyAddress(0x03))
        );
    }

    #[test]
    fn test_read_truncated() {
        assert_eq!(
            read_address(&[0x01, 1, 2], 0, SOCKS_ADDRESS_TYPES),
            Err(HeaderError::Truncated)
        );
        assert_eq!(
            read_address(&[0x03, 5, b'a'], 0, SOCKS_ADDRESS_TYPES),
            Err(HeaderError::Truncated)
        );
        assert_eq!(
            read_address(&[], 0, SOCKS_ADDRESS_TYPES),
            Err(HeaderError::Truncated)
        );
        assert_eq!(read_port(&[0x01], 0), Err(HeaderError::Truncated));
    }

    #[test]
    fn test_read_invalid_type() {
        assert_eq!(
            read_address(&[0x02, 1, 2, 3, 4], 0, SOCKS_ADDRESS_TYPES),
            Err(HeaderError::InvalidAddressType(0x02))
        );
    }
}
