//! Client-chosen global transaction identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum encoded length of a GID on disk, including the NUL terminator.
///
/// This is the fixed width of segment 1's `gid` field in the state file
/// (see `statefile::Header`); a GID longer than [`MAX_GID_LEN`] - 1 bytes
/// is rejected at `PREPARE TRANSACTION` time.
pub const MAX_GID_LEN: usize = 200;

/// A bounded, client-chosen identifier naming a prepared transaction.
///
/// Validated once at construction so every other component can assume a
/// `Gid` already fits the on-disk fixed-width field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(String);

/// Error returned when a candidate GID does not fit the on-disk format.
#[derive(Debug, thiserror::Error)]
#[error("GID exceeds maximum length of {max} bytes (including terminator): {len} bytes")]
pub struct GidTooLong {
    /// Offending length in bytes.
    pub len: usize,
    /// Maximum allowed length.
    pub max: usize,
}

impl Gid {
    /// Validate and wrap a caller-supplied GID string.
    pub fn new(s: impl Into<String>) -> Result<Self, GidTooLong> {
        let s = s.into();
        // +1 for the NUL terminator the on-disk fixed field reserves.
        if s.len() + 1 > MAX_GID_LEN {
            return Err(GidTooLong { len: s.len() + 1, max: MAX_GID_LEN });
        }
        Ok(Gid(s))
    }

    /// Borrow the GID as a plain string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode into the fixed-width on-disk representation (NUL-padded).
    pub fn to_fixed_bytes(&self) -> [u8; MAX_GID_LEN] {
        let mut buf = [0u8; MAX_GID_LEN];
        let bytes = self.0.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    /// Decode from the fixed-width on-disk representation.
    pub fn from_fixed_bytes(buf: &[u8; MAX_GID_LEN]) -> Result<Self, GidTooLong> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let s = String::from_utf8_lossy(&buf[..end]).into_owned();
        Gid::new(s)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Gid {
    type Error = GidTooLong;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Gid::new(s)
    }
}
