//! Network addresses in the 16-byte-IP + big-endian-port wire layout.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::consensus::{encode, Decodable, Encodable};

/// An IPv4-mapped address prefix inside a 16-byte IP field.
const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];

/// A peer or service-node endpoint. The wire carries 16 address bytes so
/// non-IPv4 addresses decode fine; validity is a separate, network-aware
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetAddress {
    ip: [u8; 16],
    port: u16,
}

impl NetAddress {
    pub fn new_ipv4(ip: Ipv4Addr, port: u16) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..12].copy_from_slice(&V4_MAPPED_PREFIX);
        bytes[12..].copy_from_slice(&ip.octets());
        NetAddress { ip: bytes, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => NetAddress::new_ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => NetAddress { ip: v6.ip().octets(), port: v6.port() },
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip[..12] == V4_MAPPED_PREFIX
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.is_ipv4() {
            Some(Ipv4Addr::new(self.ip[12], self.ip[13], self.ip[14], self.ip[15]))
        } else {
            None
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ipv4().map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }

    /// RFC1918 private ranges.
    pub fn is_rfc1918(&self) -> bool {
        match self.ipv4() {
            Some(ip) => {
                let [a, b, _, _] = ip.octets();
                a == 10 || (a == 192 && b == 168) || (a == 172 && (16..=31).contains(&b))
            }
            None => false,
        }
    }

    pub fn is_local(&self) -> bool {
        match self.ipv4() {
            Some(ip) => ip.is_loopback() || ip.is_unspecified(),
            None => false,
        }
    }

    pub fn is_routable(&self) -> bool {
        self.is_ipv4() && !self.is_rfc1918() && !self.is_local()
    }

    /// The key under which per-peer caches store this address: the port is
    /// zeroed unless the network permits multiple nodes per IP.
    pub fn squashed(&self, allow_multiple_ports: bool) -> NetAddress {
        if allow_multiple_ports {
            *self
        } else {
            NetAddress { ip: self.ip, port: 0 }
        }
    }

    /// `ip:port`, the exact form embedded in legacy signature strings.
    pub fn to_ip_port_string(&self) -> String {
        match self.ipv4() {
            Some(ip) => format!("{}:{}", ip, self.port),
            None => {
                let v6 = std::net::Ipv6Addr::from(self.ip);
                format!("[{}]:{}", v6, self.port)
            }
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ip_port_string())
    }
}

impl Ord for NetAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip.cmp(&other.ip).then(self.port.cmp(&other.port))
    }
}

impl PartialOrd for NetAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encodable for NetAddress {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.ip.consensus_encode(w)?;
        // port travels big-endian, unlike every other integer
        w.write_all(&self.port.to_be_bytes())?;
        Ok(18)
    }
}

impl Decodable for NetAddress {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let ip = <[u8; 16]>::consensus_decode(r)?;
        let mut port_bytes = [0u8; 2];
        r.read_exact(&mut port_bytes)?;
        Ok(NetAddress { ip, port: u16::from_be_bytes(port_bytes) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{deserialize, serialize};

    #[test]
    fn wire_layout() {
        let addr = NetAddress::new_ipv4(Ipv4Addr::new(1, 2, 3, 4), 12919);
        let encoded = serialize(&addr);
        assert_eq!(encoded.len(), 18);
        assert_eq!(&encoded[10..16], &[0xFF, 0xFF, 1, 2, 3, 4]);
        assert_eq!(&encoded[16..], &12919u16.to_be_bytes());
        let decoded: NetAddress = deserialize(&encoded).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn classification() {
        assert!(NetAddress::new_ipv4(Ipv4Addr::new(10, 0, 0, 1), 1).is_rfc1918());
        assert!(NetAddress::new_ipv4(Ipv4Addr::new(172, 20, 0, 1), 1).is_rfc1918());
        assert!(NetAddress::new_ipv4(Ipv4Addr::new(127, 0, 0, 1), 1).is_local());
        assert!(NetAddress::new_ipv4(Ipv4Addr::new(8, 8, 8, 8), 1).is_routable());
        assert!(!NetAddress::new_ipv4(Ipv4Addr::new(192, 168, 1, 1), 1).is_routable());
    }

    #[test]
    fn ip_port_string() {
        let addr = NetAddress::new_ipv4(Ipv4Addr::new(203, 0, 113, 7), 12919);
        assert_eq!(addr.to_ip_port_string(), "203.0.113.7:12919");
    }

    #[test]
    fn squashing_drops_the_port() {
        let addr = NetAddress::new_ipv4(Ipv4Addr::new(1, 1, 1, 1), 9999);
        assert_eq!(addr.squashed(true), addr);
        assert_eq!(addr.squashed(false).port(), 0);
    }
}
