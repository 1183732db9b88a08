use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use num_bigint::BigUint;
use rand::Rng as _;

use super::error::DhtError;
use crate::info_hash::InfoHash;

/// A 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let raw: [u8; 20] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`. Big-endian byte order, so slice
    /// comparison is numeric comparison.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// The id as an unsigned big integer, for bucket-range arithmetic.
    pub fn to_uint(self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }
}

impl From<InfoHash> for NodeId {
    /// Info hashes live in the same 160-bit key space as node ids.
    fn from(hash: InfoHash) -> Self {
        Self(hash.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A known DHT node: routable identity plus a liveness bit.
///
/// A node is good while it keeps answering; a query failure marks it bad
/// and makes it an eviction candidate on bucket overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub is_good: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            is_good: true,
        }
    }

    /// Parses a 26-byte compact node blob: id, IPv4, big-endian port.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let addr = peer_from_compact(&data[20..])?;
        Some(Self::new(id, addr))
    }

    /// Encodes to the compact form; `None` for IPv6 addresses, which the
    /// compact format cannot carry.
    pub fn to_compact(&self) -> Option<[u8; 26]> {
        let mut compact = [0u8; 26];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..].copy_from_slice(&peer_to_compact(&self.addr)?);
        Some(compact)
    }
}

/// Parses a 6-byte compact peer blob: IPv4, big-endian port.
pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; 6]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; 6];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(compact)
        }
        SocketAddr::V6(_) => None,
    }
}
