//! Light client protobuf structs, as served by `lightwalletd`.

use zcash_protocol::consensus::BlockHeight;

use crate::{block::BlockHash, wallet::Nullifier};

#[rustfmt::skip]
#[allow(unknown_lints)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod compact_formats;

#[rustfmt::skip]
#[allow(unknown_lints)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod service;

/// The version of the compact block format produced by this crate's test utilities.
pub const PROTO_VERSION: u32 = 1;

impl compact_formats::CompactBlock {
    /// Returns the [`BlockHash`] for this block, or `None` if the `hash` field is not
    /// exactly 32 bytes.
    pub fn hash(&self) -> Option<BlockHash> {
        BlockHash::try_from_slice(&self.hash)
    }

    /// Returns the [`BlockHash`] for this block's parent, or `None` if the `prev_hash`
    /// field is not exactly 32 bytes.
    pub fn prev_hash(&self) -> Option<BlockHash> {
        BlockHash::try_from_slice(&self.prev_hash)
    }

    /// Returns the [`BlockHeight`] value for this block, or `None` if the height does
    /// not fit in a `u32`.
    pub fn height(&self) -> Option<BlockHeight> {
        u32::try_from(self.height).ok().map(BlockHeight::from_u32)
    }

    /// Returns an iterator over the Orchard actions of all transactions in this block,
    /// in block order.
    pub fn orchard_actions(&self) -> impl Iterator<Item = &compact_formats::CompactOrchardAction> {
        self.vtx.iter().flat_map(|tx| tx.actions.iter())
    }
}

impl compact_formats::CompactOrchardAction {
    /// Returns the nullifier of the note spent by this action, or `None` if the
    /// `nullifier` field is not exactly 32 bytes.
    pub fn nf(&self) -> Option<Nullifier> {
        Nullifier::from_slice(&self.nullifier)
    }
}

impl service::BlockId {
    /// Constructs a height-only block identifier.
    pub fn from_height(height: BlockHeight) -> Self {
        service::BlockId {
            height: u64::from(u32::from(height)),
            hash: vec![],
        }
    }

    /// Returns the [`BlockHeight`] value for this identifier, or `None` if the height
    /// does not fit in a `u32`.
    pub fn block_height(&self) -> Option<BlockHeight> {
        u32::try_from(self.height).ok().map(BlockHeight::from_u32)
    }
}
