//! Utilities for testing the sync engine and note store implementations.
//!
//! Compact blocks built by [`FakeBlockSource`] carry Orchard actions whose ciphertexts
//! are understood by [`TestDecoder`]: a ciphertext addressed to a test key holds a magic
//! prefix, the key byte and the little-endian note value, and the note's nullifier is
//! carried in the `cmx` field. No real cryptography is involved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use proptest::prelude::*;
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::{
    block::BlockHash,
    data_api::{NoteStoreRead, NoteStoreWrite},
    proto::{
        compact_formats::{CompactBlock, CompactOrchardAction, CompactTx},
        service::{BlockId, TreeState},
        PROTO_VERSION,
    },
    rpc::ChainClient,
    scanning::{ActionDecoder, DecodeError, DecodedAction},
    sync::{PauseHandle, SyncError, SyncObserver, SyncStatus},
    wallet::{
        AccountBirthday, AccountId, AccountKind, AccountMeta, Checkpoint, DiscoveredNote,
        Nullifier, SpentMarker,
    },
};

const CIPHERTEXT_MAGIC: &[u8; 4] = b"TEST";
const COMPACT_CIPHERTEXT_SIZE: usize = 52;

/// The SLIP-44 coin type for Zcash.
const ZCASH_COIN_TYPE: u32 = 133;

/// Returns a derived Zcash account identifier with the given index.
pub fn account(index: u32) -> AccountId {
    AccountId::new(ZCASH_COIN_TYPE, 0, AccountKind::Derived, index)
}

/// Returns the hash of the block at `height` on the fork identified by `seed`.
pub fn block_hash(height: BlockHeight, seed: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&u32::from(height).to_le_bytes());
    bytes[4] = seed;
    bytes[31] = 0x5a;
    BlockHash(bytes)
}

/// Returns an account birthday at the given height on the default fork.
pub fn birthday(height: u32) -> AccountBirthday {
    let height = BlockHeight::from_u32(height);
    AccountBirthday::from_parts(height, block_hash(height, 0))
}

pub fn arb_nullifier() -> impl Strategy<Value = Nullifier> {
    prop::array::uniform32(any::<u8>()).prop_map(Nullifier)
}

pub fn arb_discovered_note(
    heights: std::ops::Range<u32>,
) -> impl Strategy<Value = DiscoveredNote> {
    (heights, arb_nullifier(), 1u64..100_000_000).prop_map(|(h, nf, v)| {
        DiscoveredNote::from_parts(BlockHeight::from_u32(h), nf, Zatoshis::const_from_u64(v))
    })
}

/// An [`ActionDecoder`] that recognizes the test ciphertexts produced by
/// [`FakeAction::received`].
#[derive(Clone, Debug)]
pub struct TestDecoder {
    key: u8,
    failing_heights: BTreeSet<BlockHeight>,
}

impl TestDecoder {
    pub fn new(key: u8) -> Self {
        TestDecoder {
            key,
            failing_heights: BTreeSet::new(),
        }
    }

    /// Makes the decoder fail as a whole when given the block at `height`.
    pub fn failing_at(mut self, height: BlockHeight) -> Self {
        self.failing_heights.insert(height);
        self
    }

    fn decode_action(&self, action: &CompactOrchardAction) -> Option<DecodedAction> {
        let ct = &action.ciphertext;
        if ct.len() != COMPACT_CIPHERTEXT_SIZE
            || &ct[..4] != CIPHERTEXT_MAGIC
            || ct[4] != self.key
        {
            return None;
        }
        let value = u64::from_le_bytes(ct[5..13].try_into().ok()?);
        let nf = Nullifier::from_slice(&action.cmx)?;
        Some(DecodedAction::from_parts(nf, value))
    }
}

impl ActionDecoder for TestDecoder {
    fn decode_block(
        &self,
        block: &CompactBlock,
    ) -> Result<Vec<Option<DecodedAction>>, DecodeError> {
        if block
            .height()
            .is_some_and(|h| self.failing_heights.contains(&h))
        {
            return Err(DecodeError::new("injected decoder failure"));
        }
        Ok(block
            .orchard_actions()
            .map(|a| self.decode_action(a))
            .collect())
    }
}

/// A description of an Orchard action to be placed in a fake block.
#[derive(Clone, Debug)]
pub struct FakeAction {
    spend: Option<Nullifier>,
    output: Option<(u8, Nullifier, u64)>,
}

impl FakeAction {
    /// An action that creates a note of `value` zatoshis for the holder of `key`, whose
    /// nullifier will be `nf`.
    pub fn received(key: u8, nf: Nullifier, value: u64) -> Self {
        FakeAction {
            spend: None,
            output: Some((key, nf, value)),
        }
    }

    /// An action that reveals the nullifier `nf`.
    pub fn spend(nf: Nullifier) -> Self {
        FakeAction {
            spend: Some(nf),
            output: None,
        }
    }

    fn to_compact(&self, dummy_nf: Nullifier) -> CompactOrchardAction {
        let mut ciphertext = vec![0u8; COMPACT_CIPHERTEXT_SIZE];
        let mut cmx = vec![0u8; 32];
        if let Some((key, nf, value)) = self.output {
            ciphertext[..4].copy_from_slice(CIPHERTEXT_MAGIC);
            ciphertext[4] = key;
            ciphertext[5..13].copy_from_slice(&value.to_le_bytes());
            cmx = nf.0.to_vec();
        }
        CompactOrchardAction {
            nullifier: self.spend.unwrap_or(dummy_nf).0.to_vec(),
            cmx,
            ephemeral_key: vec![0u8; 32],
            ciphertext,
        }
    }
}

/// A linear chain of fake compact blocks starting at a fixed height.
#[derive(Clone, Debug)]
pub struct FakeBlockSource {
    start: BlockHeight,
    seed: u8,
    blocks: Vec<CompactBlock>,
    dummy_counter: u64,
}

impl FakeBlockSource {
    /// Constructs an empty chain whose first block will be at height `start`.
    pub fn new(start: BlockHeight) -> Self {
        FakeBlockSource {
            start,
            seed: 0,
            blocks: vec![],
            dummy_counter: 0,
        }
    }

    fn next_height(&self) -> BlockHeight {
        self.start + u32::try_from(self.blocks.len()).unwrap()
    }

    /// The height of the last block, if any.
    pub fn tip(&self) -> Option<BlockHeight> {
        self.blocks.last().and_then(|b| b.height())
    }

    /// Appends a block containing one transaction per action.
    pub fn push_block(&mut self, actions: Vec<FakeAction>) -> BlockHash {
        let height = self.next_height();
        let prev_hash = self
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| block_hash(height.saturating_sub(1), self.seed).0.to_vec());
        let hash = block_hash(height, self.seed);

        let vtx = actions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                self.dummy_counter += 1;
                let mut dummy = [0xddu8; 32];
                dummy[1..9].copy_from_slice(&self.dummy_counter.to_le_bytes());
                CompactTx {
                    index: i as u64,
                    hash: vec![i as u8; 32],
                    fee: 0,
                    actions: vec![a.to_compact(Nullifier(dummy))],
                }
            })
            .collect();

        self.blocks.push(CompactBlock {
            proto_version: PROTO_VERSION,
            height: u64::from(u32::from(height)),
            hash: hash.0.to_vec(),
            prev_hash,
            time: 0,
            vtx,
            chain_metadata: None,
        });
        hash
    }

    /// Appends `count` blocks without any Orchard actions.
    pub fn push_empty_blocks(&mut self, count: u32) {
        for _ in 0..count {
            self.push_block(vec![]);
        }
    }

    /// Appends empty blocks until the chain tip is at `height`.
    pub fn extend_to(&mut self, height: BlockHeight) {
        while self.tip().map_or(true, |tip| tip < height) {
            self.push_block(vec![]);
        }
    }

    /// Removes all blocks at heights `>= height` and switches to a new fork, so that
    /// blocks subsequently pushed have hashes that differ from those removed.
    pub fn fork_at(&mut self, height: BlockHeight, seed: u8) {
        let keep = u32::from(height).saturating_sub(u32::from(self.start));
        self.blocks.truncate(keep as usize);
        self.seed = seed;
    }

    pub fn block_at(&self, height: BlockHeight) -> Option<&CompactBlock> {
        let index = u32::from(height).checked_sub(u32::from(self.start))?;
        self.blocks.get(index as usize)
    }

    pub fn hash_at(&self, height: BlockHeight) -> Option<BlockHash> {
        self.block_at(height).and_then(|b| b.hash())
    }

    /// Returns the blocks in `[from, to]`; blocks missing from the chain are omitted.
    pub fn blocks_in(&self, from: BlockHeight, to: BlockHeight) -> Vec<CompactBlock> {
        self.blocks
            .iter()
            .filter(|b| b.height().is_some_and(|h| from <= h && h <= to))
            .cloned()
            .collect()
    }

    pub fn all_blocks(&self) -> Vec<CompactBlock> {
        self.blocks.clone()
    }

    pub fn tree_state_at(&self, height: BlockHeight) -> Option<TreeState> {
        self.hash_at(height).map(|hash| TreeState {
            network: "regtest".to_string(),
            height: u64::from(u32::from(height)),
            hash: hash.to_string(),
            time: 0,
            sapling_tree: String::new(),
            orchard_tree: String::new(),
        })
    }
}

/// The error type of [`MockChain`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockChainError(pub String);

impl fmt::Display for MockChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock chain error: {}", self.0)
    }
}

impl std::error::Error for MockChainError {}

#[derive(Debug)]
struct MockChainState {
    source: FakeBlockSource,
    reported_tip: Option<BlockHeight>,
    hash_overrides: BTreeMap<BlockHeight, BlockHash>,
    fail_latest_block: bool,
    fail_tree_state: bool,
    fail_blocks: bool,
    tree_state_requests: Vec<BlockHeight>,
    block_requests: Vec<(BlockHeight, BlockHeight)>,
}

/// A [`ChainClient`] serving a [`FakeBlockSource`], with request recording and
/// failure injection.
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<MockChainState>,
}

impl MockChain {
    pub fn new(source: FakeBlockSource) -> Self {
        MockChain {
            state: Mutex::new(MockChainState {
                source,
                reported_tip: None,
                hash_overrides: BTreeMap::new(),
                fail_latest_block: false,
                fail_tree_state: false,
                fail_blocks: false,
                tree_state_requests: vec![],
                block_requests: vec![],
            }),
        }
    }

    /// Reports `tip` as the chain tip instead of the last block of the source.
    pub fn set_reported_tip(&self, tip: Option<BlockHeight>) {
        self.state.lock().unwrap().reported_tip = tip;
    }

    /// Reports `hash` in the tree state at `height`.
    pub fn override_hash(&self, height: BlockHeight, hash: BlockHash) {
        self.state
            .lock()
            .unwrap()
            .hash_overrides
            .insert(height, hash);
    }

    pub fn set_fail_latest_block(&self, fail: bool) {
        self.state.lock().unwrap().fail_latest_block = fail;
    }

    pub fn set_fail_tree_state(&self, fail: bool) {
        self.state.lock().unwrap().fail_tree_state = fail;
    }

    pub fn set_fail_blocks(&self, fail: bool) {
        self.state.lock().unwrap().fail_blocks = fail;
    }

    /// Applies `f` to the underlying block source.
    pub fn update_source<F: FnOnce(&mut FakeBlockSource)>(&self, f: F) {
        f(&mut self.state.lock().unwrap().source)
    }

    /// The heights of all tree states requested so far.
    pub fn tree_state_requests(&self) -> Vec<BlockHeight> {
        self.state.lock().unwrap().tree_state_requests.clone()
    }

    /// The ranges of all block downloads requested so far.
    pub fn block_requests(&self) -> Vec<(BlockHeight, BlockHeight)> {
        self.state.lock().unwrap().block_requests.clone()
    }

    pub fn clear_requests(&self) {
        let mut state = self.state.lock().unwrap();
        state.tree_state_requests.clear();
        state.block_requests.clear();
    }
}

#[async_trait]
impl ChainClient for MockChain {
    type Error = MockChainError;

    async fn get_latest_block(&self, _chain_id: &str) -> Result<BlockId, Self::Error> {
        let state = self.state.lock().unwrap();
        if state.fail_latest_block {
            return Err(MockChainError("latest block unavailable".to_string()));
        }
        let tip = state
            .reported_tip
            .or_else(|| state.source.tip())
            .ok_or_else(|| MockChainError("empty chain".to_string()))?;
        Ok(BlockId {
            height: u64::from(u32::from(tip)),
            hash: state
                .source
                .hash_at(tip)
                .map(|h| h.0.to_vec())
                .unwrap_or_default(),
        })
    }

    async fn get_tree_state(
        &self,
        _chain_id: &str,
        block: BlockId,
    ) -> Result<TreeState, Self::Error> {
        let mut state = self.state.lock().unwrap();
        let height = block
            .block_height()
            .ok_or_else(|| MockChainError("invalid height".to_string()))?;
        state.tree_state_requests.push(height);
        if state.fail_tree_state {
            return Err(MockChainError("tree state unavailable".to_string()));
        }
        let mut treestate = state
            .source
            .tree_state_at(height)
            .ok_or_else(|| MockChainError(format!("no block at height {}", height)))?;
        if let Some(hash) = state.hash_overrides.get(&height) {
            treestate.hash = hash.to_string();
        }
        Ok(treestate)
    }

    async fn get_compact_blocks(
        &self,
        _chain_id: &str,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<CompactBlock>, Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.block_requests.push((from, to));
        if state.fail_blocks {
            return Err(MockChainError("block download failed".to_string()));
        }
        let blocks = state.source.blocks_in(from, to);
        if blocks.len() as u64 != u64::from(u32::from(to)) + 1 - u64::from(u32::from(from)) {
            return Err(MockChainError(format!(
                "blocks {}..={} unavailable",
                from, to
            )));
        }
        Ok(blocks)
    }
}

/// An event received by a [`RecordingObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverEvent {
    Started,
    Status(SyncStatus),
    Stopped,
    Error(SyncError),
}

/// A [`SyncObserver`] that records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
    pause_after_updates: Option<(usize, PauseHandle)>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pause through `handle` once `updates` status updates have been
    /// received.
    pub fn pausing_after(updates: usize, handle: PauseHandle) -> Self {
        RecordingObserver {
            events: Mutex::new(vec![]),
            pause_after_updates: Some((updates, handle)),
        }
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<SyncError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_sync_start(&self, _account: &AccountId) {
        self.events.lock().unwrap().push(ObserverEvent::Started);
    }

    fn on_sync_status_update(&self, _account: &AccountId, status: &SyncStatus) {
        let mut events = self.events.lock().unwrap();
        events.push(ObserverEvent::Status(status.clone()));
        if let Some((updates, handle)) = &self.pause_after_updates {
            let received = events
                .iter()
                .filter(|e| matches!(e, ObserverEvent::Status(_)))
                .count();
            if received >= *updates {
                handle.pause();
            }
        }
    }

    fn on_sync_stop(&self, _account: &AccountId) {
        self.events.lock().unwrap().push(ObserverEvent::Stopped);
    }

    fn on_sync_error(&self, _account: &AccountId, error: &SyncError) {
        self.events
            .lock()
            .unwrap()
            .push(ObserverEvent::Error(error.clone()));
    }
}

/// Errors produced by [`FaultyStore`].
#[derive(Debug, thiserror::Error)]
pub enum FaultyStoreError<E: fmt::Display + fmt::Debug> {
    #[error("injected store failure: {0}")]
    Injected(&'static str),
    #[error("{0}")]
    Inner(E),
}

/// A note store wrapper that records write calls and can be made to fail.
#[derive(Debug)]
pub struct FaultyStore<S> {
    inner: S,
    failing_applies: u32,
    fail_reorgs: bool,
    fail_meta_reads: bool,
    apply_calls: Vec<Checkpoint>,
    reorg_calls: Vec<Checkpoint>,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        FaultyStore {
            inner,
            failing_applies: 0,
            fail_reorgs: false,
            fail_meta_reads: false,
            apply_calls: vec![],
            reorg_calls: vec![],
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Makes the next `count` calls to `apply_scan_results` fail.
    pub fn fail_next_applies(&mut self, count: u32) {
        self.failing_applies = count;
    }

    pub fn set_fail_reorgs(&mut self, fail: bool) {
        self.fail_reorgs = fail;
    }

    pub fn set_fail_meta_reads(&mut self, fail: bool) {
        self.fail_meta_reads = fail;
    }

    /// The last block passed to every `apply_scan_results` call, including failed ones.
    pub fn apply_calls(&self) -> &[Checkpoint] {
        &self.apply_calls
    }

    /// The checkpoints passed to every `handle_chain_reorg` call, including failed ones.
    pub fn reorg_calls(&self) -> &[Checkpoint] {
        &self.reorg_calls
    }
}

impl<S: NoteStoreRead> NoteStoreRead for FaultyStore<S> {
    type Error = FaultyStoreError<S::Error>;

    fn get_account_meta(&self, account: &AccountId) -> Result<Option<AccountMeta>, Self::Error> {
        if self.fail_meta_reads {
            return Err(FaultyStoreError::Injected("account meta read"));
        }
        self.inner
            .get_account_meta(account)
            .map_err(FaultyStoreError::Inner)
    }

    fn get_received_notes(&self, account: &AccountId) -> Result<Vec<DiscoveredNote>, Self::Error> {
        self.inner
            .get_received_notes(account)
            .map_err(FaultyStoreError::Inner)
    }

    fn get_spendable_notes(
        &self,
        account: &AccountId,
    ) -> Result<Vec<DiscoveredNote>, Self::Error> {
        self.inner
            .get_spendable_notes(account)
            .map_err(FaultyStoreError::Inner)
    }

    fn get_nullifiers(&self, account: &AccountId) -> Result<Vec<SpentMarker>, Self::Error> {
        self.inner
            .get_nullifiers(account)
            .map_err(FaultyStoreError::Inner)
    }

    fn get_checkpoint_at_or_below(
        &self,
        account: &AccountId,
        height: BlockHeight,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        self.inner
            .get_checkpoint_at_or_below(account, height)
            .map_err(FaultyStoreError::Inner)
    }
}

impl<S: NoteStoreWrite> NoteStoreWrite for FaultyStore<S> {
    fn register_account(
        &mut self,
        account: &AccountId,
        birthday: &AccountBirthday,
    ) -> Result<AccountMeta, Self::Error> {
        self.inner
            .register_account(account, birthday)
            .map_err(FaultyStoreError::Inner)
    }

    fn apply_scan_results(
        &mut self,
        account: &AccountId,
        notes: &[DiscoveredNote],
        spent: &[SpentMarker],
        blocks: &[Checkpoint],
    ) -> Result<(), Self::Error> {
        self.apply_calls.extend(blocks.last().copied());
        if self.failing_applies > 0 {
            self.failing_applies -= 1;
            return Err(FaultyStoreError::Injected("apply scan results"));
        }
        self.inner
            .apply_scan_results(account, notes, spent, blocks)
            .map_err(FaultyStoreError::Inner)
    }

    fn handle_chain_reorg(
        &mut self,
        account: &AccountId,
        rewind_to: &Checkpoint,
    ) -> Result<(), Self::Error> {
        self.reorg_calls.push(*rewind_to);
        if self.fail_reorgs {
            return Err(FaultyStoreError::Injected("chain reorg"));
        }
        self.inner
            .handle_chain_reorg(account, rewind_to)
            .map_err(FaultyStoreError::Inner)
    }

    fn reset_account_sync_state(&mut self, account: &AccountId) -> Result<(), Self::Error> {
        self.inner
            .reset_account_sync_state(account)
            .map_err(FaultyStoreError::Inner)
    }
}

/// Behavioral checks shared by all note store implementations.
pub mod store {
    use std::collections::BTreeSet;

    use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

    use super::{account, birthday};
    use crate::{
        block::BlockHash,
        data_api::{spendable_summary, NoteStoreWrite},
        wallet::{total_value, Checkpoint, DiscoveredNote, Nullifier, SpentMarker},
    };

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    fn note(height: u32, nf: u8, value: u64) -> DiscoveredNote {
        DiscoveredNote::from_parts(h(height), Nullifier([nf; 32]), Zatoshis::const_from_u64(value))
    }

    fn marker(height: u32, nf: u8) -> SpentMarker {
        SpentMarker::from_parts(h(height), Nullifier([nf; 32]))
    }

    fn checkpoint(height: u32, hash: u8) -> Checkpoint {
        Checkpoint::new(h(height), BlockHash([hash; 32]))
    }

    pub fn register_is_idempotent<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        let first = store.register_account(&account, &birthday(100)).unwrap();
        assert_eq!(first.birthday(), &birthday(100));
        assert_eq!(first.latest_scanned(), None);

        store
            .apply_scan_results(&account, &[], &[], &[checkpoint(150, 1)])
            .unwrap();

        let again = store.register_account(&account, &birthday(120)).unwrap();
        assert_eq!(again.birthday(), &birthday(100));
        assert_eq!(again.latest_scanned(), Some(&checkpoint(150, 1)));
        assert_eq!(store.get_account_meta(&account).unwrap(), Some(again));

        // Accounts are independent.
        let other = super::account(1);
        assert_eq!(store.get_account_meta(&other).unwrap(), None);
        let other_meta = store.register_account(&other, &birthday(200)).unwrap();
        assert_eq!(other_meta.latest_scanned(), None);
    }

    pub fn spendable_notes_exclude_spent<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();

        store
            .apply_scan_results(
                &account,
                &[note(105, 1, 10), note(110, 2, 20)],
                &[],
                &[checkpoint(115, 1)],
            )
            .unwrap();
        store
            .apply_scan_results(&account, &[], &[marker(600, 1)], &[checkpoint(700, 2)])
            .unwrap();

        assert_eq!(
            store.get_received_notes(&account).unwrap(),
            vec![note(105, 1, 10), note(110, 2, 20)]
        );
        assert_eq!(
            store.get_spendable_notes(&account).unwrap(),
            vec![note(110, 2, 20)]
        );
        assert_eq!(store.get_nullifiers(&account).unwrap(), vec![marker(600, 1)]);

        let summary = spendable_summary(&*store, &account).unwrap();
        assert_eq!(summary.note_count(), 1);
        assert_eq!(summary.balance(), Zatoshis::const_from_u64(20));
    }

    pub fn checkpoint_is_monotonic<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();

        store
            .apply_scan_results(&account, &[], &[], &[checkpoint(150, 1)])
            .unwrap();
        store
            .apply_scan_results(&account, &[], &[], &[checkpoint(200, 2)])
            .unwrap();
        store
            .apply_scan_results(&account, &[], &[], &[checkpoint(200, 2)])
            .unwrap();

        assert!(store
            .apply_scan_results(&account, &[note(180, 9, 1)], &[], &[checkpoint(180, 3)])
            .is_err());

        let meta = store.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned(), Some(&checkpoint(200, 2)));
        assert!(store.get_received_notes(&account).unwrap().is_empty());

        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(199)).unwrap(),
            Some(checkpoint(150, 1))
        );
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(149)).unwrap(),
            None
        );
    }

    pub fn reorg_rewind_is_complete<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();

        store
            .apply_scan_results(&account, &[note(105, 1, 10)], &[], &[checkpoint(200, 1)])
            .unwrap();
        store
            .apply_scan_results(
                &account,
                &[note(300, 2, 20)],
                &[marker(250, 1), marker(310, 2)],
                &[checkpoint(320, 2)],
            )
            .unwrap();
        assert!(store.get_spendable_notes(&account).unwrap().is_empty());

        let rewind_to = checkpoint(220, 7);
        store.handle_chain_reorg(&account, &rewind_to).unwrap();

        let meta = store.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned(), Some(&rewind_to));
        assert_eq!(meta.birthday(), &birthday(100));

        let received = store.get_received_notes(&account).unwrap();
        assert!(received.iter().all(|n| n.height() <= h(220)));
        assert_eq!(received, vec![note(105, 1, 10)]);
        assert!(store.get_nullifiers(&account).unwrap().is_empty());
        assert_eq!(
            store.get_spendable_notes(&account).unwrap(),
            vec![note(105, 1, 10)]
        );

        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(400)).unwrap(),
            Some(rewind_to)
        );
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(219)).unwrap(),
            Some(checkpoint(200, 1))
        );

        // Forward sync resumes from the rewound checkpoint.
        store
            .apply_scan_results(&account, &[note(230, 3, 30)], &[], &[checkpoint(240, 3)])
            .unwrap();
        assert_eq!(store.get_spendable_notes(&account).unwrap().len(), 2);
    }

    pub fn failed_apply_is_atomic<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();
        store
            .apply_scan_results(&account, &[note(105, 1, 10)], &[], &[checkpoint(200, 1)])
            .unwrap();

        // The second note reuses an existing nullifier, so the whole batch is rejected.
        assert!(store
            .apply_scan_results(
                &account,
                &[note(210, 2, 20), note(220, 1, 30)],
                &[marker(215, 1)],
                &[checkpoint(300, 2)],
            )
            .is_err());

        let meta = store.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned(), Some(&checkpoint(200, 1)));
        assert_eq!(
            store.get_received_notes(&account).unwrap(),
            vec![note(105, 1, 10)]
        );
        assert!(store.get_nullifiers(&account).unwrap().is_empty());
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(300)).unwrap(),
            Some(checkpoint(200, 1))
        );

        // A duplicated spent marker is rejected in the same way.
        store
            .apply_scan_results(&account, &[], &[marker(250, 1)], &[checkpoint(260, 3)])
            .unwrap();
        assert!(store
            .apply_scan_results(
                &account,
                &[note(270, 4, 40)],
                &[marker(280, 1)],
                &[checkpoint(290, 4)],
            )
            .is_err());
        assert_eq!(store.get_received_notes(&account).unwrap().len(), 1);
        assert_eq!(
            store
                .get_account_meta(&account)
                .unwrap()
                .unwrap()
                .latest_scanned(),
            Some(&checkpoint(260, 3))
        );
    }

    pub fn reset_clears_sync_state<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();
        store
            .apply_scan_results(
                &account,
                &[note(105, 1, 10), note(106, 2, 5)],
                &[marker(107, 1)],
                &[checkpoint(200, 1)],
            )
            .unwrap();

        store.reset_account_sync_state(&account).unwrap();

        let meta = store.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.birthday(), &birthday(100));
        assert_eq!(meta.latest_scanned(), None);
        assert!(store.get_received_notes(&account).unwrap().is_empty());
        assert!(store.get_nullifiers(&account).unwrap().is_empty());
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(1000)).unwrap(),
            None
        );
    }

    pub fn block_history_is_recorded<S: NoteStoreWrite>(store: &mut S) {
        let account = account(0);
        store.register_account(&account, &birthday(100)).unwrap();

        let blocks = (100..=110)
            .map(|height| checkpoint(height, height as u8))
            .collect::<Vec<_>>();
        store
            .apply_scan_results(&account, &[note(104, 1, 10)], &[], &blocks)
            .unwrap();

        let meta = store.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned(), Some(&checkpoint(110, 110)));
        for height in 100..=110 {
            assert_eq!(
                store.get_checkpoint_at_or_below(&account, h(height)).unwrap(),
                Some(checkpoint(height, height as u8))
            );
        }
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(99)).unwrap(),
            None
        );

        store
            .handle_chain_reorg(&account, &checkpoint(105, 0xaa))
            .unwrap();
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(110)).unwrap(),
            Some(checkpoint(105, 0xaa))
        );
        assert_eq!(
            store.get_checkpoint_at_or_below(&account, h(104)).unwrap(),
            Some(checkpoint(104, 104))
        );
    }

    /// Records `notes` and spends those selected by `spent_mask`, then checks that the
    /// spendable set and balance are consistent with the recorded data.
    pub fn balance_is_consistent<S: NoteStoreWrite>(
        store: &mut S,
        notes: &[DiscoveredNote],
        spent_mask: &[bool],
    ) {
        let account = account(0);
        store.register_account(&account, &birthday(1)).unwrap();

        let markers = notes
            .iter()
            .zip(spent_mask.iter())
            .filter(|(_, spent)| **spent)
            .map(|(n, _)| SpentMarker::from_parts(h(10_000), *n.nullifier()))
            .collect::<Vec<_>>();
        store
            .apply_scan_results(&account, notes, &[], &[checkpoint(5_000, 1)])
            .unwrap();
        store
            .apply_scan_results(&account, &[], &markers, &[checkpoint(10_000, 2)])
            .unwrap();

        let spent: BTreeSet<Nullifier> = markers.iter().map(|m| *m.nullifier()).collect();
        let mut expected = notes
            .iter()
            .filter(|n| !spent.contains(n.nullifier()))
            .cloned()
            .collect::<Vec<_>>();
        expected.sort_by_key(|n| *n.nullifier());

        let mut spendable = store.get_spendable_notes(&account).unwrap();
        spendable.sort_by_key(|n| *n.nullifier());
        assert_eq!(spendable, expected);

        let summary = spendable_summary(&*store, &account).unwrap();
        assert_eq!(summary.note_count(), expected.len());
        assert_eq!(Some(summary.balance()), total_value(&expected));
    }
}
