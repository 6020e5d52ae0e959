//! Interfaces for persistent storage of an account's notes and sync state.
//!
//! The [`NoteStoreRead`] and [`NoteStoreWrite`] traits define the storage interface
//! atop which the sync engine is implemented. They serve to allow the engine to be
//! abstracted away from any particular data storage substrate.
//!
//! # Consistency
//!
//! Implementations must uphold the following for each account:
//!
//! - The sync checkpoint never refers to a height for which note or spent-marker data
//!   is incomplete. [`NoteStoreWrite::apply_scan_results`] and
//!   [`NoteStoreWrite::handle_chain_reorg`] are each all-or-nothing.
//! - [`NoteStoreWrite::apply_scan_results`] is the only operation that moves the
//!   checkpoint forward, and [`NoteStoreWrite::handle_chain_reorg`] is the only operation
//!   that moves it backward (apart from a full [`NoteStoreWrite::reset_account_sync_state`]).
//! - A nullifier identifies at most one note and at most one spent marker.

use std::fmt;

use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::wallet::{
    total_value, AccountBirthday, AccountId, AccountMeta, Checkpoint, DiscoveredNote,
    SpentMarker,
};

pub mod mem_store;

/// Read-only operations on the note store.
pub trait NoteStoreRead {
    /// The type of errors produced by the store.
    type Error: fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Returns the sync metadata for the given account, or `None` if the account has not
    /// been registered.
    fn get_account_meta(&self, account: &AccountId) -> Result<Option<AccountMeta>, Self::Error>;

    /// Returns all notes received by the account, whether or not they have been spent.
    fn get_received_notes(&self, account: &AccountId) -> Result<Vec<DiscoveredNote>, Self::Error>;

    /// Returns the notes received by the account for which no spent marker exists.
    fn get_spendable_notes(&self, account: &AccountId)
        -> Result<Vec<DiscoveredNote>, Self::Error>;

    /// Returns the spent markers recorded for the account.
    fn get_nullifiers(&self, account: &AccountId) -> Result<Vec<SpentMarker>, Self::Error>;

    /// Returns the height and hash of the highest block in the account's block history
    /// at a height less than or equal to `height`.
    ///
    /// Every block passed to [`NoteStoreWrite::apply_scan_results`], and every rewind
    /// target of [`NoteStoreWrite::handle_chain_reorg`], is recorded in the history;
    /// entries above a rewind height are discarded by the rewind.
    fn get_checkpoint_at_or_below(
        &self,
        account: &AccountId,
        height: BlockHeight,
    ) -> Result<Option<Checkpoint>, Self::Error>;
}

/// Operations that mutate the note store.
pub trait NoteStoreWrite: NoteStoreRead {
    /// Registers an account with the given birthday.
    ///
    /// Registering an account that is already known has no effect; the existing
    /// metadata (including its original birthday) is returned.
    fn register_account(
        &mut self,
        account: &AccountId,
        birthday: &AccountBirthday,
    ) -> Result<AccountMeta, Self::Error>;

    /// Atomically records the notes and spent markers detected in a range of blocks,
    /// adds the height and hash of each of `blocks` to the account's block history, and
    /// advances the account's checkpoint to the last of `blocks`.
    ///
    /// Fails without modifying the store if `blocks` is empty or not in ascending height
    /// order, if the account is unknown, if the last block is below the current
    /// checkpoint, or if any nullifier is already recorded.
    fn apply_scan_results(
        &mut self,
        account: &AccountId,
        notes: &[DiscoveredNote],
        spent: &[SpentMarker],
        blocks: &[Checkpoint],
    ) -> Result<(), Self::Error>;

    /// Atomically deletes all notes and spent markers with a height greater than the
    /// height of `rewind_to`, and sets the account's checkpoint to `rewind_to`.
    ///
    /// Fails without modifying the store if the account is unknown or if `rewind_to` is
    /// above the current checkpoint.
    fn handle_chain_reorg(
        &mut self,
        account: &AccountId,
        rewind_to: &Checkpoint,
    ) -> Result<(), Self::Error>;

    /// Atomically deletes all notes, spent markers and recorded checkpoints for the
    /// account, and clears its checkpoint. The account's birthday is retained.
    fn reset_account_sync_state(&mut self, account: &AccountId) -> Result<(), Self::Error>;
}

/// The spendable notes of an account, and their total value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendableSummary {
    note_count: usize,
    balance: Zatoshis,
}

impl SpendableSummary {
    /// Summarizes the given set of spendable notes.
    ///
    /// Returns `None` if the total value overflows the valid range of zatoshi amounts,
    /// which indicates corrupted store contents.
    pub fn from_notes(notes: &[DiscoveredNote]) -> Option<Self> {
        total_value(notes).map(|balance| SpendableSummary {
            note_count: notes.len(),
            balance,
        })
    }

    pub fn note_count(&self) -> usize {
        self.note_count
    }

    pub fn balance(&self) -> Zatoshis {
        self.balance
    }
}

/// Returns the spendable summary of the given account.
pub fn spendable_summary<S: NoteStoreRead + ?Sized>(
    store: &S,
    account: &AccountId,
) -> Result<SpendableSummary, SummaryError<S::Error>> {
    let notes = store
        .get_spendable_notes(account)
        .map_err(SummaryError::Store)?;
    SpendableSummary::from_notes(&notes).ok_or(SummaryError::BalanceOverflow)
}

/// Errors that can occur in computing a [`SpendableSummary`] from a store.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError<E: fmt::Display + fmt::Debug> {
    #[error("{0}")]
    Store(E),
    #[error("Spendable note values overflow the maximum money amount")]
    BalanceOverflow,
}

#[cfg(test)]
mod tests {
    use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

    use super::SpendableSummary;
    use crate::wallet::{DiscoveredNote, Nullifier};

    #[test]
    fn summary_counts_and_sums() {
        let notes = vec![
            DiscoveredNote::from_parts(
                BlockHeight::from_u32(1),
                Nullifier([1; 32]),
                Zatoshis::const_from_u64(7),
            ),
            DiscoveredNote::from_parts(
                BlockHeight::from_u32(2),
                Nullifier([2; 32]),
                Zatoshis::const_from_u64(8),
            ),
        ];
        let summary = SpendableSummary::from_notes(&notes).unwrap();
        assert_eq!(summary.note_count(), 2);
        assert_eq!(summary.balance(), Zatoshis::const_from_u64(15));

        let overflow = vec![
            DiscoveredNote::from_parts(
                BlockHeight::from_u32(1),
                Nullifier([1; 32]),
                Zatoshis::const_from_u64(zcash_protocol::value::MAX_MONEY),
            ),
            DiscoveredNote::from_parts(
                BlockHeight::from_u32(2),
                Nullifier([2; 32]),
                Zatoshis::const_from_u64(1),
            ),
        ];
        assert_eq!(SpendableSummary::from_notes(&overflow), None);
    }
}
