use std::fmt;

use rand::Rng as _;
use thiserror::Error;

/// A 20-byte torrent info hash, identifying a swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

#[derive(Debug, Error)]
#[error("invalid info hash")]
pub struct InvalidInfoHash;

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidInfoHash> {
        let raw: [u8; 20] = bytes.try_into().map_err(|_| InvalidInfoHash)?;
        Ok(Self(raw))
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, InvalidInfoHash> {
        if s.len() != 40 {
            return Err(InvalidInfoHash);
        }
        let mut raw = [0u8; 20];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| InvalidInfoHash)?;
        }
        Ok(Self(raw))
    }

    pub fn random() -> Self {
        let mut raw = [0u8; 20];
        rand::rng().fill(&mut raw);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(raw: [u8; 20]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
