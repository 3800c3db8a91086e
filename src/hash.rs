use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of a content digest in bytes.
pub const HASH_SIZE: usize = 32;

/// A fixed-width BLAKE3 content digest.
///
/// Equality is byte equality. [`Hash::short`] projects the leading eight
/// bytes into a `u64` for in-memory hash tables; collisions there are
/// resolved by comparing the full digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Digest the given bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a raw 32-byte digest.
    pub fn from_raw(raw: [u8; HASH_SIZE]) -> Self {
        Self(raw)
    }

    /// Parse a digest from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Leading eight bytes as a little-endian `u64`.
    pub fn short(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().unwrap())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
