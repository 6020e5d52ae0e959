//! Tools for scanning a compact representation of the Zcash block chain.

use std::fmt;

use subtle::{ConditionallySelectable, ConstantTimeEq, CtOption};
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::{
    block::BlockHash,
    proto::compact_formats::CompactBlock,
    wallet::{Checkpoint, DiscoveredNote, Nullifier, SpentMarker},
};

/// The result of successfully trial-decrypting a compact Orchard action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedAction {
    nullifier: Nullifier,
    value: u64,
}

impl DecodedAction {
    /// Constructs a decoded action from the nullifier of the received note and its
    /// value in zatoshis.
    pub fn from_parts(nullifier: Nullifier, value: u64) -> Self {
        DecodedAction { nullifier, value }
    }

    /// The nullifier of the decrypted note.
    pub fn nullifier(&self) -> &Nullifier {
        &self.nullifier
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

/// A failure of a decoding backend as a whole, as opposed to a failure to decrypt an
/// individual action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError(String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        DecodeError(message.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DecodeError {}

/// A trial-decryption capability for the Orchard actions of an account.
///
/// Implementations are expected to batch the work for all actions of a block.
pub trait ActionDecoder {
    /// Attempts to decrypt every Orchard action in `block`.
    ///
    /// Returns one entry per action, in the order yielded by
    /// [`CompactBlock::orchard_actions`]. Actions that are not addressed to the account
    /// are `None`; this is not an error.
    fn decode_block(&self, block: &CompactBlock) -> Result<Vec<Option<DecodedAction>>, DecodeError>;
}

impl<D: ActionDecoder + ?Sized> ActionDecoder for &D {
    fn decode_block(&self, block: &CompactBlock) -> Result<Vec<Option<DecodedAction>>, DecodeError> {
        (**self).decode_block(block)
    }
}

/// Errors that may occur in block scanning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanError {
    /// The decoding backend failed while processing the block at the given height.
    DecodeFailure {
        at_height: BlockHeight,
        message: String,
    },

    /// The hash of the parent block given by a proposed new block does not match the hash
    /// of the previously scanned block.
    PrevHashMismatch { at_height: BlockHeight },

    /// The block height field of the proposed new block is not equal to the height of the
    /// previous block + 1.
    BlockHeightDiscontinuity {
        prev_height: BlockHeight,
        new_height: BlockHeight,
    },

    /// A block's height or hash fields could not be parsed.
    MalformedBlock { height: u64 },

    /// An Orchard action in the block at the given height has a malformed nullifier.
    MalformedAction {
        at_height: BlockHeight,
        action_index: usize,
    },

    /// A decrypted note has a value outside the valid range of zatoshi amounts.
    InvalidNoteValue { at_height: BlockHeight, value: u64 },
}

impl ScanError {
    /// Returns whether this error is the result of a failed continuity check
    pub fn is_continuity_error(&self) -> bool {
        use ScanError::*;
        match self {
            PrevHashMismatch { .. } => true,
            BlockHeightDiscontinuity { .. } => true,
            DecodeFailure { .. } => false,
            MalformedBlock { .. } => false,
            MalformedAction { .. } => false,
            InvalidNoteValue { .. } => false,
        }
    }

    /// Returns the block height at which the scan error occurred, if the height of the
    /// offending block could be determined.
    pub fn at_height(&self) -> Option<BlockHeight> {
        use ScanError::*;
        match self {
            DecodeFailure { at_height, .. } => Some(*at_height),
            PrevHashMismatch { at_height } => Some(*at_height),
            BlockHeightDiscontinuity { new_height, .. } => Some(*new_height),
            MalformedBlock { height } => u32::try_from(*height).ok().map(BlockHeight::from_u32),
            MalformedAction { at_height, .. } => Some(*at_height),
            InvalidNoteValue { at_height, .. } => Some(*at_height),
        }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ScanError::*;
        match &self {
            DecodeFailure { at_height, message } => write!(
                f,
                "Trial decryption failed for the block at height {}: {}",
                at_height, message
            ),
            PrevHashMismatch { at_height } => write!(
                f,
                "The parent hash of proposed block does not correspond to the block hash at height {}.",
                at_height
            ),
            BlockHeightDiscontinuity { prev_height, new_height } => {
                write!(f, "Block height discontinuity at height {}; previous height was: {}", new_height, prev_height)
            }
            MalformedBlock { height } => write!(
                f,
                "The block claiming height {} has a malformed height or hash.",
                height
            ),
            MalformedAction { at_height, action_index } => write!(
                f,
                "Orchard action {} in the block at height {} has a malformed nullifier.",
                action_index, at_height
            ),
            InvalidNoteValue { at_height, value } => write!(
                f,
                "A note decrypted at height {} has invalid value {}.",
                at_height, value
            ),
        }
    }
}

impl std::error::Error for ScanError {}

/// The notes and spends detected in a contiguous range of blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    discovered_notes: Vec<DiscoveredNote>,
    spent_markers: Vec<SpentMarker>,
    scanned_blocks: Vec<Checkpoint>,
}

impl ScanResult {
    pub fn from_parts(
        discovered_notes: Vec<DiscoveredNote>,
        spent_markers: Vec<SpentMarker>,
        scanned_blocks: Vec<Checkpoint>,
    ) -> Self {
        ScanResult {
            discovered_notes,
            spent_markers,
            scanned_blocks,
        }
    }

    /// The notes received by the account in the scanned blocks, in block order.
    pub fn discovered_notes(&self) -> &[DiscoveredNote] {
        &self.discovered_notes
    }

    /// The spends of the account's notes observed in the scanned blocks, in block order.
    pub fn spent_markers(&self) -> &[SpentMarker] {
        &self.spent_markers
    }

    /// The height and hash of each scanned block, in ascending height order.
    pub fn scanned_blocks(&self) -> &[Checkpoint] {
        &self.scanned_blocks
    }

    /// The height and hash of the last block scanned, or `None` if no blocks were
    /// provided.
    pub fn last_block(&self) -> Option<&Checkpoint> {
        self.scanned_blocks.last()
    }

    pub fn into_parts(self) -> (Vec<DiscoveredNote>, Vec<SpentMarker>, Vec<Checkpoint>) {
        (
            self.discovered_notes,
            self.spent_markers,
            self.scanned_blocks,
        )
    }
}

/// Checks that `block` directly extends the block identified by `prior`.
pub(crate) fn check_continuity(
    block: &CompactBlock,
    height: BlockHeight,
    prior: Option<&Checkpoint>,
) -> Option<ScanError> {
    if let Some(prev) = prior {
        if height != prev.height() + 1 {
            return Some(ScanError::BlockHeightDiscontinuity {
                prev_height: prev.height(),
                new_height: height,
            });
        }

        if block.prev_hash().as_ref() != Some(prev.hash()) {
            return Some(ScanError::PrevHashMismatch { at_height: height });
        }
    }

    None
}

/// Returns the index of the tracked nullifier equal to `nf`, comparing in constant time.
fn find_tracked(tracked: &[Nullifier], nf: &Nullifier) -> Option<usize> {
    let found: Option<u64> = tracked
        .iter()
        .enumerate()
        .map(|(i, t)| CtOption::new(i as u64, t.ct_eq(nf)))
        .fold(CtOption::new(0, 0.into()), |first, next| {
            CtOption::conditional_select(&next, &first, first.is_some())
        })
        .into();

    found.map(|i| i as usize)
}

/// Scans a contiguous sequence of compact blocks for notes received by, and spends
/// from, an account.
///
/// `known_unspent` is the set of the account's notes that were unspent as of the block
/// preceding `blocks`. Notes discovered in `blocks` are tracked as well, so a note that
/// is received and then spent within the same range produces both a
/// [`DiscoveredNote`] and a [`SpentMarker`]. Each nullifier is marked as spent at most
/// once.
///
/// If `prior` is provided, the first block must directly extend it; each following
/// block must directly extend its predecessor.
///
/// This function performs no I/O and holds no state between calls; scanning the same
/// inputs twice produces the same result.
#[tracing::instrument(skip_all, fields(blocks = blocks.len()))]
pub fn scan_blocks<D: ActionDecoder + ?Sized>(
    decoder: &D,
    known_unspent: &[DiscoveredNote],
    blocks: &[CompactBlock],
    prior: Option<&Checkpoint>,
) -> Result<ScanResult, ScanError> {
    let mut tracked: Vec<Nullifier> = known_unspent.iter().map(|n| *n.nullifier()).collect();
    let mut discovered_notes = vec![];
    let mut spent_markers = vec![];
    let mut scanned_blocks: Vec<Checkpoint> = Vec::with_capacity(blocks.len());

    for block in blocks {
        let height = block
            .height()
            .ok_or(ScanError::MalformedBlock {
                height: block.height,
            })?;
        let hash: BlockHash = block.hash().ok_or(ScanError::MalformedBlock {
            height: block.height,
        })?;

        if let Some(err) = check_continuity(block, height, scanned_blocks.last().or(prior)) {
            return Err(err);
        }

        let decoded = decoder
            .decode_block(block)
            .map_err(|e| ScanError::DecodeFailure {
                at_height: height,
                message: e.to_string(),
            })?;

        let action_count = block.orchard_actions().count();
        if decoded.len() != action_count {
            return Err(ScanError::DecodeFailure {
                at_height: height,
                message: format!(
                    "decoder returned {} results for {} actions",
                    decoded.len(),
                    action_count
                ),
            });
        }

        for (action_index, (action, decoded)) in
            block.orchard_actions().zip(decoded.into_iter()).enumerate()
        {
            let nf = action.nf().ok_or(ScanError::MalformedAction {
                at_height: height,
                action_index,
            })?;

            if let Some(i) = find_tracked(&tracked, &nf) {
                tracked.swap_remove(i);
                spent_markers.push(SpentMarker::from_parts(height, nf));
            }

            if let Some(output) = decoded {
                let value = Zatoshis::from_u64(output.value()).map_err(|_| {
                    ScanError::InvalidNoteValue {
                        at_height: height,
                        value: output.value(),
                    }
                })?;
                tracked.push(*output.nullifier());
                discovered_notes.push(DiscoveredNote::from_parts(
                    height,
                    *output.nullifier(),
                    value,
                ));
            }
        }

        scanned_blocks.push(Checkpoint::new(height, hash));
    }

    if !blocks.is_empty() {
        tracing::trace!(
            notes = discovered_notes.len(),
            spends = spent_markers.len(),
            "Scanned block range"
        );
    }

    Ok(ScanResult::from_parts(
        discovered_notes,
        spent_markers,
        scanned_blocks,
    ))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

    use super::{scan_blocks, ActionDecoder, DecodeError, DecodedAction, ScanError};
    use crate::{
        block::BlockHash,
        proto::compact_formats::CompactBlock,
        testing::{arb_nullifier, FakeAction, FakeBlockSource, TestDecoder},
        wallet::{Checkpoint, DiscoveredNote, Nullifier, SpentMarker},
    };

    const KEY: u8 = 7;

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    #[test]
    fn detects_received_and_spent_notes() {
        let decoder = TestDecoder::new(KEY);
        let mut chain = FakeBlockSource::new(h(100));

        let known = DiscoveredNote::from_parts(h(90), Nullifier([1; 32]), Zatoshis::const_from_u64(10));

        chain.push_block(vec![
            FakeAction::received(KEY, Nullifier([2; 32]), 5),
            FakeAction::received(KEY + 1, Nullifier([3; 32]), 6),
        ]);
        chain.push_block(vec![FakeAction::spend(Nullifier([1; 32]))]);
        // The note received in the first block is spent within the same range.
        chain.push_block(vec![FakeAction::spend(Nullifier([2; 32]))]);

        let blocks = chain.blocks_in(h(100), h(102));
        let result = scan_blocks(&decoder, &[known], &blocks, None).unwrap();

        assert_eq!(
            result.discovered_notes(),
            &[DiscoveredNote::from_parts(
                h(100),
                Nullifier([2; 32]),
                Zatoshis::const_from_u64(5)
            )]
        );
        assert_eq!(
            result.spent_markers(),
            &[
                SpentMarker::from_parts(h(101), Nullifier([1; 32])),
                SpentMarker::from_parts(h(102), Nullifier([2; 32])),
            ]
        );
        assert_eq!(
            result.last_block(),
            Some(&Checkpoint::new(h(102), chain.hash_at(h(102)).unwrap()))
        );
        assert_eq!(
            result
                .scanned_blocks()
                .iter()
                .map(|b| b.height())
                .collect::<Vec<_>>(),
            vec![h(100), h(101), h(102)]
        );
    }

    #[test]
    fn nullifier_is_marked_spent_once() {
        let decoder = TestDecoder::new(KEY);
        let mut chain = FakeBlockSource::new(h(100));
        let known = DiscoveredNote::from_parts(h(90), Nullifier([1; 32]), Zatoshis::const_from_u64(10));

        chain.push_block(vec![FakeAction::spend(Nullifier([1; 32]))]);
        chain.push_block(vec![FakeAction::spend(Nullifier([1; 32]))]);

        let blocks = chain.blocks_in(h(100), h(101));
        let result = scan_blocks(&decoder, &[known], &blocks, None).unwrap();
        assert_eq!(result.spent_markers().len(), 1);
    }

    #[test]
    fn empty_range_has_no_last_block() {
        let decoder = TestDecoder::new(KEY);
        let prior = Checkpoint::new(h(5), BlockHash([0; 32]));
        let result = scan_blocks(&decoder, &[], &[], Some(&prior)).unwrap();
        assert_eq!(result.last_block(), None);
        assert!(result.discovered_notes().is_empty());
    }

    #[test]
    fn continuity_is_checked() {
        let decoder = TestDecoder::new(KEY);
        let mut chain = FakeBlockSource::new(h(100));
        chain.push_empty_blocks(3);

        let blocks = chain.blocks_in(h(101), h(102));
        let wrong_prior = Checkpoint::new(h(100), BlockHash([0xff; 32]));
        assert_matches!(
            scan_blocks(&decoder, &[], &blocks, Some(&wrong_prior)),
            Err(ScanError::PrevHashMismatch { at_height }) if at_height == h(101)
        );

        let gap_prior = Checkpoint::new(h(99), chain.hash_at(h(100)).unwrap());
        let err = scan_blocks(&decoder, &[], &blocks, Some(&gap_prior)).unwrap_err();
        assert!(err.is_continuity_error());
        assert_matches!(
            err,
            ScanError::BlockHeightDiscontinuity { prev_height, new_height }
                if prev_height == h(99) && new_height == h(101)
        );

        let good_prior = Checkpoint::new(h(100), chain.hash_at(h(100)).unwrap());
        assert!(scan_blocks(&decoder, &[], &blocks, Some(&good_prior)).is_ok());
    }

    #[test]
    fn decoder_failure_is_reported() {
        let decoder = TestDecoder::new(KEY).failing_at(h(101));
        let mut chain = FakeBlockSource::new(h(100));
        chain.push_empty_blocks(2);

        let blocks = chain.blocks_in(h(100), h(101));
        let err = scan_blocks(&decoder, &[], &blocks, None).unwrap_err();
        assert!(!err.is_continuity_error());
        assert_eq!(err.at_height(), Some(h(101)));
        assert_matches!(err, ScanError::DecodeFailure { .. });
    }

    struct ShortDecoder;

    impl ActionDecoder for ShortDecoder {
        fn decode_block(
            &self,
            _block: &CompactBlock,
        ) -> Result<Vec<Option<DecodedAction>>, DecodeError> {
            Ok(vec![])
        }
    }

    #[test]
    fn decoder_result_count_must_match() {
        let mut chain = FakeBlockSource::new(h(100));
        chain.push_block(vec![FakeAction::spend(Nullifier([9; 32]))]);
        let blocks = chain.blocks_in(h(100), h(100));
        assert_matches!(
            scan_blocks(&ShortDecoder, &[], &blocks, None),
            Err(ScanError::DecodeFailure { .. })
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        let decoder = TestDecoder::new(KEY);
        let mut chain = FakeBlockSource::new(h(100));
        chain.push_block(vec![FakeAction::spend(Nullifier([9; 32]))]);

        let mut blocks = chain.blocks_in(h(100), h(100));
        blocks[0].vtx[0].actions[0].nullifier.truncate(31);
        assert_matches!(
            scan_blocks(&decoder, &[], &blocks, None),
            Err(ScanError::MalformedAction { action_index: 0, .. })
        );

        blocks[0].hash.clear();
        assert_matches!(
            scan_blocks(&decoder, &[], &blocks, None),
            Err(ScanError::MalformedBlock { height: 100 })
        );
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let decoder = TestDecoder::new(KEY);
        let mut chain = FakeBlockSource::new(h(100));
        chain.push_block(vec![FakeAction::received(KEY, Nullifier([2; 32]), u64::MAX)]);
        let blocks = chain.blocks_in(h(100), h(100));
        assert_matches!(
            scan_blocks(&decoder, &[], &blocks, None),
            Err(ScanError::InvalidNoteValue { value: u64::MAX, .. })
        );
    }

    proptest! {
        #[test]
        fn scan_is_idempotent(
            received in proptest::collection::vec((arb_nullifier(), 1u64..1_000_000, any::<bool>()), 0..20),
            spend_known in proptest::collection::vec(any::<bool>(), 0..10),
        ) {
            let decoder = TestDecoder::new(KEY);
            let known = spend_known
                .iter()
                .enumerate()
                .map(|(i, _)| DiscoveredNote::from_parts(
                    h(50),
                    Nullifier([0xf0 | i as u8; 32]),
                    Zatoshis::const_from_u64(1),
                ))
                .collect::<Vec<_>>();

            let mut chain = FakeBlockSource::new(h(100));
            for (nf, value, mine) in &received {
                let key = if *mine { KEY } else { KEY + 1 };
                chain.push_block(vec![FakeAction::received(key, *nf, *value)]);
            }
            for (note, spend) in known.iter().zip(spend_known.iter()) {
                if *spend {
                    chain.push_block(vec![FakeAction::spend(*note.nullifier())]);
                }
            }

            let blocks = chain.all_blocks();
            let first = scan_blocks(&decoder, &known, &blocks, None);
            let second = scan_blocks(&decoder, &known, &blocks, None);
            prop_assert_eq!(&first, &second);

            let result = first.unwrap();
            let expected_spends = spend_known.iter().filter(|s| **s).count();
            prop_assert_eq!(result.spent_markers().len(), expected_spends);
            prop_assert!(result.discovered_notes().len() <= received.len());
        }
    }
}
