//! Core domain models shared across the lodestone crates.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Block height on the daemon's chain. Genesis is height 0.
pub type Height = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte block hash, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(self.0))
    }
}

impl FromStr for BlockHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(stripped).map_err(|e| ParseHashError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ParseHashError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// One indexed block header as stored locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub height: Height,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub timestamp: u64,
}

/// A half-open, contiguous range of block heights `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: Height,
    pub end: Height,
}

impl BlockRange {
    pub fn new(start: Height, end: Height) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, height: Height) -> bool {
        height >= self.start && height < self.end
    }

    /// Partitions the range into at most `max_parts` contiguous,
    /// non-overlapping sub-ranges that exactly cover it. A range wider than
    /// `max_parts` yields wider parts, never more of them.
    pub fn split(&self, max_parts: usize) -> Vec<BlockRange> {
        if self.is_empty() || max_parts == 0 {
            return Vec::new();
        }
        let parts = (max_parts as u64).min(self.len());
        let chunk = self.len() / parts;
        let remainder = self.len() % parts;
        let mut ranges = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for i in 0..parts {
            // spread the remainder over the leading parts
            let width = chunk + u64::from(i < remainder);
            ranges.push(BlockRange::new(start, start + width));
            start += width;
        }
        ranges
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
