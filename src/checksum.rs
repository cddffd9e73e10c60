//! Content checksums
//!
//! Every buffer, transformation and result is identified by the SHA-256
//! digest of its bytes. Absent checksums are modelled as `Option<Checksum>`.

use crate::error::{CommuneError, CommuneResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a raw checksum in bytes
pub const CHECKSUM_LEN: usize = 32;

/// A 32-byte content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    /// Hash a byte buffer
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> CommuneResult<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| CommuneError::InvalidChecksum(format!("{}: {}", s, e)))?;
        let bytes: [u8; CHECKSUM_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            CommuneError::InvalidChecksum(format!(
                "{}: expected {} bytes, got {}",
                s,
                CHECKSUM_LEN,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.short())
    }
}

impl FromStr for Checksum {
    type Err = CommuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_sha256() {
        let cs = Checksum::digest(b"hello");
        assert_eq!(
            cs.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let cs = Checksum::digest(b"abc");
        let parsed: Checksum = cs.to_hex().parse().unwrap();
        assert_eq!(parsed, cs);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Checksum::from_hex("zz").is_err());
        assert!(Checksum::from_hex("abcd").is_err());
    }

    #[test]
    fn serde_as_hex_string() {
        let cs = Checksum::from_bytes([0xde; 32]);
        let json = serde_json::to_string(&cs).unwrap();
        assert_eq!(json, format!("\"{}\"", "de".repeat(32)));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cs);
    }
}
