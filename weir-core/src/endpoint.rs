//! Addressing types: IPv4 addresses, sockets, and the 4-tuple that
//! identifies a connection.

use std::fmt::{self, Display};

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);

    pub const fn new(octets: [u8; 4]) -> Self {
        Self(octets)
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0
    }

    /// The address as a big-endian `u32`, as it appears on the wire.
    pub const fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(octets: [u8; 4]) -> Self {
        Self(octets)
    }
}

impl From<u32> for Ipv4Address {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl std::str::FromStr for Ipv4Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(AddressParseError)?;
            *octet = part.parse().map_err(|_| AddressParseError)?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(Self(octets))
    }
}

/// The string was not a dotted-quad IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Not a dotted-quad IPv4 address")]
pub struct AddressParseError;

/// An IPv4 address with a port, RFC 793's "socket".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The pair of endpoints that uniquely identifies a TCP connection. Used as
/// the demultiplexing key by the host and as the connection handle by users
/// of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoints {
    /// The local endpoint
    pub local: Endpoint,
    /// The remote endpoint
    pub remote: Endpoint,
}

impl Endpoints {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// The matching identifier on the remote host.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        let parsed: Ipv4Address = "10.0.0.42".parse().unwrap();
        assert_eq!(parsed, Ipv4Address::new([10, 0, 0, 42]));
        assert!("10.0.0".parse::<Ipv4Address>().is_err());
        assert!("10.0.0.1.2".parse::<Ipv4Address>().is_err());
        assert!("10.0.0.256".parse::<Ipv4Address>().is_err());
    }

    #[test]
    fn reversal() {
        let local = Endpoint::new(Ipv4Address::new([1, 2, 3, 4]), 80);
        let remote = Endpoint::new(Ipv4Address::new([5, 6, 7, 8]), 12345);
        let id = Endpoints::new(local, remote);
        assert_eq!(id.reverse().reverse(), id);
        assert_eq!(id.reverse().local, remote);
    }
}
