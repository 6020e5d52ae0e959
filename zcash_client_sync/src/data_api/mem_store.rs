//! An in-memory implementation of the note store.

use std::collections::BTreeMap;

use zcash_protocol::consensus::BlockHeight;

use crate::{
    block::BlockHash,
    data_api::{NoteStoreRead, NoteStoreWrite},
    wallet::{
        AccountBirthday, AccountId, AccountMeta, Checkpoint, DiscoveredNote, Nullifier,
        SpentMarker,
    },
};

/// Errors produced by [`MemoryNoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Account not found: {0}")]
    AccountUnknown(AccountId),
    #[error(
        "Scan results at height {proposed} would move the checkpoint back from height {current}"
    )]
    CheckpointRegression {
        current: BlockHeight,
        proposed: BlockHeight,
    },
    #[error("Requested rewind to height {requested} is above the checkpoint at height {current}")]
    RequestedRewindInvalid {
        current: BlockHeight,
        requested: BlockHeight,
    },
    #[error("Nullifier already recorded: {0:?}")]
    DuplicateNullifier(Nullifier),
    #[error("Scan results must cover at least one block, in ascending height order")]
    InvalidBlockRange,
}

#[derive(Clone, Debug)]
struct AccountState {
    birthday: AccountBirthday,
    latest_scanned: Option<Checkpoint>,
    notes: BTreeMap<Nullifier, DiscoveredNote>,
    spent: BTreeMap<Nullifier, SpentMarker>,
    block_hashes: BTreeMap<BlockHeight, BlockHash>,
}

impl AccountState {
    fn new(birthday: AccountBirthday) -> Self {
        AccountState {
            birthday,
            latest_scanned: None,
            notes: BTreeMap::new(),
            spent: BTreeMap::new(),
            block_hashes: BTreeMap::new(),
        }
    }

    fn meta(&self) -> AccountMeta {
        AccountMeta::from_parts(self.birthday, self.latest_scanned)
    }
}

fn is_ascending(blocks: &[Checkpoint]) -> bool {
    blocks.windows(2).all(|w| w[0].height() < w[1].height())
}

/// A [`NoteStoreWrite`] implementation that holds all state in memory.
///
/// Mutating operations build the updated account state separately and swap it in only
/// once every check has passed, so a failed operation leaves the store unchanged.
#[derive(Clone, Debug, Default)]
pub struct MemoryNoteStore {
    accounts: BTreeMap<AccountId, AccountState>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, account: &AccountId) -> Result<&AccountState, Error> {
        self.accounts
            .get(account)
            .ok_or_else(|| Error::AccountUnknown(account.clone()))
    }

    /// Applies `f` to a copy of the account's state, and replaces the stored state with
    /// the copy only if `f` succeeds.
    fn update_account<F>(&mut self, account: &AccountId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut AccountState) -> Result<(), Error>,
    {
        let mut state = self.account(account)?.clone();
        f(&mut state)?;
        self.accounts.insert(account.clone(), state);
        Ok(())
    }
}

impl NoteStoreRead for MemoryNoteStore {
    type Error = Error;

    fn get_account_meta(&self, account: &AccountId) -> Result<Option<AccountMeta>, Self::Error> {
        Ok(self.accounts.get(account).map(|s| s.meta()))
    }

    fn get_received_notes(&self, account: &AccountId) -> Result<Vec<DiscoveredNote>, Self::Error> {
        let mut notes = self
            .account(account)?
            .notes
            .values()
            .cloned()
            .collect::<Vec<_>>();
        notes.sort_by_key(|n| n.height());
        Ok(notes)
    }

    fn get_spendable_notes(
        &self,
        account: &AccountId,
    ) -> Result<Vec<DiscoveredNote>, Self::Error> {
        let state = self.account(account)?;
        let mut notes = state
            .notes
            .values()
            .filter(|n| !state.spent.contains_key(n.nullifier()))
            .cloned()
            .collect::<Vec<_>>();
        notes.sort_by_key(|n| n.height());
        Ok(notes)
    }

    fn get_nullifiers(&self, account: &AccountId) -> Result<Vec<SpentMarker>, Self::Error> {
        let mut spent = self
            .account(account)?
            .spent
            .values()
            .cloned()
            .collect::<Vec<_>>();
        spent.sort_by_key(|s| s.height());
        Ok(spent)
    }

    fn get_checkpoint_at_or_below(
        &self,
        account: &AccountId,
        height: BlockHeight,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        Ok(self
            .account(account)?
            .block_hashes
            .range(..=height)
            .next_back()
            .map(|(h, hash)| Checkpoint::new(*h, *hash)))
    }
}

impl NoteStoreWrite for MemoryNoteStore {
    fn register_account(
        &mut self,
        account: &AccountId,
        birthday: &AccountBirthday,
    ) -> Result<AccountMeta, Self::Error> {
        Ok(self
            .accounts
            .entry(account.clone())
            .or_insert_with(|| AccountState::new(*birthday))
            .meta())
    }

    fn apply_scan_results(
        &mut self,
        account: &AccountId,
        notes: &[DiscoveredNote],
        spent: &[SpentMarker],
        blocks: &[Checkpoint],
    ) -> Result<(), Self::Error> {
        let checkpoint = match blocks.last() {
            Some(last) if is_ascending(blocks) => *last,
            _ => return Err(Error::InvalidBlockRange),
        };
        self.update_account(account, |state| {
            if let Some(current) = state.latest_scanned {
                if checkpoint.height() < current.height() {
                    return Err(Error::CheckpointRegression {
                        current: current.height(),
                        proposed: checkpoint.height(),
                    });
                }
            }

            for note in notes {
                if state
                    .notes
                    .insert(*note.nullifier(), note.clone())
                    .is_some()
                {
                    return Err(Error::DuplicateNullifier(*note.nullifier()));
                }
            }
            for marker in spent {
                if state
                    .spent
                    .insert(*marker.nullifier(), marker.clone())
                    .is_some()
                {
                    return Err(Error::DuplicateNullifier(*marker.nullifier()));
                }
            }

            state.latest_scanned = Some(checkpoint);
            state
                .block_hashes
                .extend(blocks.iter().map(|b| (b.height(), *b.hash())));
            Ok(())
        })
    }

    fn handle_chain_reorg(
        &mut self,
        account: &AccountId,
        rewind_to: &Checkpoint,
    ) -> Result<(), Self::Error> {
        let height = rewind_to.height();
        self.update_account(account, |state| {
            if let Some(current) = state.latest_scanned {
                if height > current.height() {
                    return Err(Error::RequestedRewindInvalid {
                        current: current.height(),
                        requested: height,
                    });
                }
            }

            state.notes.retain(|_, n| n.height() <= height);
            state.spent.retain(|_, s| s.height() <= height);
            state.block_hashes.retain(|h, _| *h <= height);
            state.block_hashes.insert(height, *rewind_to.hash());
            state.latest_scanned = Some(*rewind_to);
            Ok(())
        })
    }

    fn reset_account_sync_state(&mut self, account: &AccountId) -> Result<(), Self::Error> {
        self.update_account(account, |state| {
            *state = AccountState::new(state.birthday);
            Ok(())
        })
    }
}
