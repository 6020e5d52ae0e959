//! Block identifiers.

use std::fmt;
use std::str::FromStr;

/// The hash of a Zcash block, in internal byte order.
///
/// The [`Display`] and [`FromStr`] impls use the byte-reversed hex encoding shown by
/// block explorers and returned in the `hash` field of a `TreeState`.
///
/// [`Display`]: fmt::Display
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Constructs a [`BlockHash`] from the given slice.
    ///
    /// Returns `None` if `bytes` is not exactly 32 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(BlockHash)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let mut data = self.0;
        data.reverse();
        formatter.write_str(&hex::encode(data))
    }
}

/// Errors that can occur when parsing a [`BlockHash`] from its hex encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockHashParseError {
    /// The input was not valid hex.
    InvalidHex(hex::FromHexError),
    /// The decoded input was not 32 bytes long.
    InvalidLength(usize),
}

impl fmt::Display for BlockHashParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockHashParseError::InvalidHex(e) => write!(f, "Invalid block hash encoding: {}", e),
            BlockHashParseError::InvalidLength(len) => {
                write!(f, "Block hash must be 32 bytes; got {} bytes", len)
            }
        }
    }
}

// `hex::FromHexError` only derives `PartialEq`, but its variants hold plain `char`/`usize`
// values, so equality is total.
impl Eq for BlockHashParseError {}

impl std::error::Error for BlockHashParseError {}

impl FromStr for BlockHash {
    type Err = BlockHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut data = hex::decode(s).map_err(BlockHashParseError::InvalidHex)?;
        let len = data.len();
        data.reverse();
        BlockHash::try_from_slice(&data).ok_or(BlockHashParseError::InvalidLength(len))
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockHash, BlockHashParseError};

    #[test]
    fn display_is_byte_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = BlockHash(bytes);
        let encoded = hash.to_string();
        assert!(encoded.starts_with("01"));
        assert!(encoded.ends_with("ab"));
        assert_eq!(encoded.parse::<BlockHash>(), Ok(hash));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_matches!(
            "zz".parse::<BlockHash>(),
            Err(BlockHashParseError::InvalidHex(_))
        );
        assert_matches!(
            "0011".parse::<BlockHash>(),
            Err(BlockHashParseError::InvalidLength(2))
        );
    }
}
