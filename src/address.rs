use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AddressType {
    Ipv4,
    DomainName,
    Ipv6,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (b'A'..=b'F').contains(&c) || (b'a'..=b'f').contains(&c) {
                possible_ipv4 = false;
            } else if !c.is_ascii_digit() {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4
            && dots == 3
            && let Ok(addr) = s.parse::<Ipv4Addr>()
        {
            return Ok(Address::Ipv4(addr));
        }

        if possible_ipv6 && let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }

        if possible_hostname && !s.is_empty() {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse address: {s}"),
        ))
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::Ipv4(_) => AddressType::Ipv4,
            Address::Ipv6(_) => AddressType::Ipv6,
            Address::Hostname(_) => AddressType::DomainName,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }
}

// IPv6 is written as eight lower-case hex groups without zero compression, which is
// the form the relay server and the latency/pool keys expect.
impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Address::Ipv4(i) => write!(f, "{i}"),
            Address::Ipv6(i) => {
                for (idx, segment) in i.segments().iter().enumerate() {
                    if idx > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{segment:x}")?;
                }
                Ok(())
            }
            Address::Hostname(h) => write!(f, "{h}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let (address_str, port, expect_ipv6) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be from an ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) => (&s[0..i], Some(port), false),
                    Err(_) => (s, default_port, true),
                }
            }
            None => (s, default_port, false),
        };

        let address_str = address_str
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(address_str);

        let address = Address::from(address_str)?;
        if expect_ipv6 && !address.is_ipv6() {
            return Err(std::io::Error::other("Invalid location"));
        }

        let port = port.ok_or_else(|| std::io::Error::other("No port"))?;

        Ok(Self { address, port })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ipv6(ref addr) => Some(SocketAddr::new(IpAddr::V6(*addr), self.port)),
            Address::Ipv4(ref addr) => Some(SocketAddr::new(IpAddr::V4(*addr), self.port)),
            Address::Hostname(ref _d) => None,
        }
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl serde::ser::Serialize for NetLocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::de::Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        NetLocation::from_str(&s, None).map_err(|e| Error::custom(format!("{s}: {e}")))
    }
}

/// Fallback destination used only when retrying a failed connect.
///
/// Written as `host:port`, `host=port` or `host-port`. The port may be omitted, in
/// which case the original destination port is kept.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OverrideTarget {
    address: Address,
    port: Option<u16>,
}

impl OverrideTarget {
    pub fn parse(s: &str) -> std::io::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty override destination",
            ));
        }

        // Only treat the last separator as a port delimiter when a valid port follows it,
        // so that hostnames like `my-proxy.example` survive.
        let (host, port) = match s.rfind([':', '=', '-']) {
            Some(i) => match s[i + 1..].parse::<u16>() {
                Ok(port) => (&s[..i], Some(port)),
                Err(_) => (s, None),
            },
            None => (s, None),
        };

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let address = Address::from(host).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid override destination {s}: {e}"),
            )
        })?;

        Ok(Self { address, port })
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Resolves the override against the destination it replaces.
    pub fn resolve(&self, original: &NetLocation) -> NetLocation {
        NetLocation::new(self.address.clone(), self.port.unwrap_or(original.port()))
    }
}

impl TryFrom<String> for OverrideTarget {
    type Error = std::io::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        OverrideTarget::parse(&s)
    }
}

impl From<OverrideTarget> for String {
    fn from(target: OverrideTarget) -> Self {
        target.to_string()
    }
}

impl std::fmt::Display for OverrideTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}", self.address),
        }
    }
}
