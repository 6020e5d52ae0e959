//! The states of a sync session, and the pure decisions that drive transitions between
//! them.

use std::cmp::{max, min};
use std::fmt;
use std::sync::Arc;

use zcash_protocol::consensus::BlockHeight;

use crate::{
    proto::compact_formats::CompactBlock,
    scanning::ScanResult,
    wallet::{AccountBirthday, AccountMeta, Checkpoint},
};

/// The position up to which an account has been scanned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ScanCursor {
    birthday: AccountBirthday,
    position: Option<Checkpoint>,
}

impl ScanCursor {
    pub(crate) fn new(birthday: AccountBirthday, position: Option<Checkpoint>) -> Self {
        ScanCursor { birthday, position }
    }

    pub(crate) fn birthday(&self) -> &AccountBirthday {
        &self.birthday
    }

    /// The last block whose scan results are committed, if known.
    pub(crate) fn position(&self) -> Option<&Checkpoint> {
        self.position.as_ref()
    }

    /// The height of the last scanned block; an account that has not scanned any
    /// blocks is positioned immediately below its birthday.
    pub(crate) fn height(&self) -> BlockHeight {
        self.position
            .map_or(self.birthday.scan_floor(), |p| p.height())
    }
}

/// A state of the sync state machine.
///
/// Each call to the engine's step function consumes one state and produces the next.
pub(crate) enum SyncState {
    /// The chain tip has not yet been requested.
    Uninitialized,
    /// The chain tip is known; the account's sync metadata has not yet been loaded.
    TipKnown { tip: BlockHeight },
    /// The account is not known to the store and must be registered.
    Provisioning { tip: BlockHeight },
    /// The account's checkpoint must be compared against the chain.
    VerifyingChainState { tip: BlockHeight, meta: AccountMeta },
    /// A reorg has been detected; the account must be rewound to `recovery_height` or
    /// below.
    ReorgRecovery {
        tip: BlockHeight,
        recovery_height: BlockHeight,
        birthday: AccountBirthday,
    },
    /// The account is consistent with the chain up to the cursor.
    Scanning { tip: BlockHeight, cursor: ScanCursor },
    /// A batch of blocks following the cursor has been downloaded.
    BlocksDownloaded {
        tip: BlockHeight,
        cursor: ScanCursor,
        blocks: Arc<Vec<CompactBlock>>,
        attempt: u32,
    },
    /// A batch of blocks has been scanned and its results await commit.
    BlocksScanned {
        tip: BlockHeight,
        cursor: ScanCursor,
        blocks: Arc<Vec<CompactBlock>>,
        result: ScanResult,
        attempt: u32,
    },
    /// The account is scanned up to the chain tip.
    CaughtUp { tip: BlockHeight, cursor: ScanCursor },
}

impl SyncState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SyncState::Uninitialized => "Uninitialized",
            SyncState::TipKnown { .. } => "TipKnown",
            SyncState::Provisioning { .. } => "Provisioning",
            SyncState::VerifyingChainState { .. } => "VerifyingChainState",
            SyncState::ReorgRecovery { .. } => "ReorgRecovery",
            SyncState::Scanning { .. } => "Scanning",
            SyncState::BlocksDownloaded { .. } => "BlocksDownloaded",
            SyncState::BlocksScanned { .. } => "BlocksScanned",
            SyncState::CaughtUp { .. } => "CaughtUp",
        }
    }
}

impl fmt::Debug for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Uninitialized => write!(f, "Uninitialized"),
            SyncState::TipKnown { tip } | SyncState::Provisioning { tip } => {
                write!(f, "{} {{ tip: {} }}", self.name(), tip)
            }
            SyncState::VerifyingChainState { tip, meta } => write!(
                f,
                "VerifyingChainState {{ tip: {}, checkpoint: {:?} }}",
                tip,
                meta.latest_scanned().map(|c| c.height())
            ),
            SyncState::ReorgRecovery {
                tip,
                recovery_height,
                ..
            } => write!(
                f,
                "ReorgRecovery {{ tip: {}, recovery_height: {} }}",
                tip, recovery_height
            ),
            SyncState::Scanning { tip, cursor } | SyncState::CaughtUp { tip, cursor } => write!(
                f,
                "{} {{ tip: {}, cursor: {} }}",
                self.name(),
                tip,
                cursor.height()
            ),
            SyncState::BlocksDownloaded {
                tip,
                cursor,
                blocks,
                attempt,
            } => write!(
                f,
                "BlocksDownloaded {{ tip: {}, cursor: {}, blocks: {}, attempt: {} }}",
                tip,
                cursor.height(),
                blocks.len(),
                attempt
            ),
            SyncState::BlocksScanned {
                tip,
                cursor,
                blocks,
                attempt,
                ..
            } => write!(
                f,
                "BlocksScanned {{ tip: {}, cursor: {}, blocks: {}, attempt: {} }}",
                tip,
                cursor.height(),
                blocks.len(),
                attempt
            ),
        }
    }
}

/// The action to take to verify an account's checkpoint against the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verification {
    /// The account has never scanned a block; scanning starts from its birthday.
    StartFromBirthday,
    /// The chain is shorter than the checkpoint; recover from the given height.
    ChainBehindCheckpoint { recovery_height: BlockHeight },
    /// The checkpoint must be compared against the chain's hash at its height.
    CompareHash(Checkpoint),
}

/// Decides how to verify an account's checkpoint given the current chain tip.
pub(crate) fn verification_for(
    tip: BlockHeight,
    meta: &AccountMeta,
    reorg_delta: u32,
) -> Verification {
    match meta.latest_scanned() {
        None => Verification::StartFromBirthday,
        Some(checkpoint) if tip < checkpoint.height() => Verification::ChainBehindCheckpoint {
            recovery_height: recovery_height_below(tip, reorg_delta, meta.birthday()),
        },
        Some(checkpoint) => Verification::CompareHash(*checkpoint),
    }
}

/// Returns the height `reorg_delta` blocks below `height`, clamped so that it is never
/// below the account's scan floor.
pub(crate) fn recovery_height_below(
    height: BlockHeight,
    reorg_delta: u32,
    birthday: &AccountBirthday,
) -> BlockHeight {
    max(height.saturating_sub(reorg_delta), birthday.scan_floor())
}

/// Returns the inclusive range of the next batch of blocks to download, or `None` if
/// the cursor has reached the tip.
pub(crate) fn next_batch(
    cursor: BlockHeight,
    tip: BlockHeight,
    batch_size: u32,
) -> Option<(BlockHeight, BlockHeight)> {
    if cursor >= tip {
        None
    } else {
        let start = cursor + 1;
        let end = min(tip, cursor + max(batch_size, 1));
        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use zcash_protocol::consensus::BlockHeight;

    use super::{next_batch, recovery_height_below, verification_for, ScanCursor, Verification};
    use crate::{
        block::BlockHash,
        testing::birthday,
        wallet::{AccountMeta, Checkpoint},
    };

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    #[test]
    fn unscanned_account_starts_below_birthday() {
        let meta = AccountMeta::from_parts(birthday(100), None);
        assert_eq!(
            verification_for(h(500), &meta, 150),
            Verification::StartFromBirthday
        );
        assert_eq!(ScanCursor::new(birthday(100), None).height(), h(99));
    }

    #[test]
    fn chain_behind_checkpoint_recovers_below_tip() {
        let checkpoint = Checkpoint::new(h(1000), BlockHash([1; 32]));
        let meta = AccountMeta::from_parts(birthday(100), Some(checkpoint));
        assert_eq!(
            verification_for(h(300), &meta, 150),
            Verification::ChainBehindCheckpoint { recovery_height: h(150) }
        );
        assert_eq!(
            verification_for(h(1000), &meta, 150),
            Verification::CompareHash(checkpoint)
        );
        assert_eq!(
            verification_for(h(1200), &meta, 150),
            Verification::CompareHash(checkpoint)
        );
    }

    #[test]
    fn recovery_heights_are_clamped_to_scan_floor() {
        assert_eq!(recovery_height_below(h(500), 150, &birthday(100)), h(350));
        assert_eq!(recovery_height_below(h(200), 150, &birthday(100)), h(99));
        assert_eq!(recovery_height_below(h(100), 150, &birthday(1)), h(0));
    }

    #[test]
    fn batches_are_bounded_by_tip_and_size() {
        assert_eq!(next_batch(h(99), h(500), 1024), Some((h(100), h(500))));
        assert_eq!(next_batch(h(99), h(500), 100), Some((h(100), h(199))));
        assert_eq!(next_batch(h(499), h(500), 100), Some((h(500), h(500))));
        assert_eq!(next_batch(h(500), h(500), 100), None);
        assert_eq!(next_batch(h(600), h(500), 100), None);
    }
}
