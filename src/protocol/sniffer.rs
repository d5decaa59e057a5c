use super::ProtocolKind;

const TROJAN_MIN_LEN: usize = 62;
const TROJAN_DELIMITER_OFFSET: usize = 56;
const VMESS_UUID_RANGE: std::ops::Range<usize> = 1..17;

/// Classifies the first client frame. Total and side-effect free; every buffer maps to
/// some kind and malformed input is rejected later by the matching parser.
pub fn sniff(buffer: &[u8]) -> ProtocolKind {
    if is_trojan_like(buffer) {
        return ProtocolKind::TrojanLike;
    }

    if let Some(uuid) = buffer.get(VMESS_UUID_RANGE)
        && is_uuid_v4(uuid)
    {
        return ProtocolKind::VmessLike;
    }

    ProtocolKind::ShadowsocksLike
}

fn is_trojan_like(buffer: &[u8]) -> bool {
    if buffer.len() < TROJAN_MIN_LEN {
        return false;
    }
    let delimiter = &buffer[TROJAN_DELIMITER_OFFSET..TROJAN_DELIMITER_OFFSET + 4];
    delimiter[0] == 0x0d
        && delimiter[1] == 0x0a
        && matches!(delimiter[2], 0x01 | 0x03 | 0x7f)
        && matches!(delimiter[3], 0x01 | 0x03 | 0x04)
}

// Matches the canonical v4 shape: version nibble 4, variant nibble one of 8, 9, a, b.
fn is_uuid_v4(bytes: &[u8]) -> bool {
    bytes.len() == 16 && (bytes[6] >> 4) == 4 && (bytes[8] >> 6) == 0b10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trojan_marker(cmd: u8, atype: u8) -> Vec<u8> {
        let mut buffer = vec![0u8; 62];
        buffer[56] = 0x0d;
        buffer[57] = 0x0a;
        buffer[58] = cmd;
        buffer[59] = atype;
        buffer
    }

    #[test]
    fn test_sniff_trojan_marker() {
        for cmd in [0x01, 0x03, 0x7f] {
            for atype in [0x01, 0x03, 0x04] {
                assert_eq!(sniff(&trojan_marker(cmd, atype)), ProtocolKind::TrojanLike);
            }
        }
    }

    #[test]
    fn test_sniff_trojan_rejects_bad_marker() {
        assert_ne!(sniff(&trojan_marker(0x02, 0x01)), ProtocolKind::TrojanLike);
        assert_ne!(sniff(&trojan_marker(0x01, 0x02)), ProtocolKind::TrojanLike);

        let mut buffer = trojan_marker(0x01, 0x01);
        buffer[57] = 0x0b;
        assert_ne!(sniff(&buffer), ProtocolKind::TrojanLike);

        // Marker present but one byte short of the minimum length.
        let buffer = trojan_marker(0x01, 0x01);
        assert_ne!(sniff(&buffer[..61]), ProtocolKind::TrojanLike);
    }

    #[test]
    fn test_sniff_vmess_uuid() {
        let mut buffer = vec![0u8; 40];
        buffer[1..17].copy_from_slice(&[
            0xd3, 0x42, 0x9e, 0x11, 0x07, 0xaa, 0x4f, 0x01, 0xbf, 0x33, 0x00, 0x00, 0x12, 0x34,
            0x56, 0x78,
        ]);
        assert_eq!(sniff(&buffer), ProtocolKind::VmessLike);

        for variant in [0x80, 0x9f, 0xa0, 0xbf] {
            buffer[9] = variant;
            assert_eq!(sniff(&buffer), ProtocolKind::VmessLike);
        }
    }

    #[test]
    fn test_sniff_vmess_rejects_non_v4() {
        let mut buffer = vec![0u8; 40];
        buffer[7] = 0x1f; // version 1
        buffer[9] = 0x80;
        assert_eq!(sniff(&buffer), ProtocolKind::ShadowsocksLike);

        buffer[7] = 0x4f;
        buffer[9] = 0xc0; // variant nibble c
        assert_eq!(sniff(&buffer), ProtocolKind::ShadowsocksLike);
    }

    #[test]
    fn test_sniff_defaults_to_shadowsocks() {
        assert_eq!(sniff(&[]), ProtocolKind::ShadowsocksLike);
        assert_eq!(sniff(&[0x01]), ProtocolKind::ShadowsocksLike);
        assert_eq!(sniff(&[0x03, 0x09]), ProtocolKind::ShadowsocksLike);
    }

    #[test]
    fn test_sniff_does_not_mutate_and_is_deterministic() {
        let buffer = trojan_marker(0x01, 0x03);
        let copy = buffer.clone();
        let first = sniff(&buffer);
        let second = sniff(&buffer);
        assert_eq!(first, second);
        assert_eq!(buffer, copy);
    }
}
