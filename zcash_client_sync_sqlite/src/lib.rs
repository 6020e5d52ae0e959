//! *An SQLite-based note store for the Zcash Orchard sync engine.*
//!
//! `zcash_client_sync_sqlite` contains complete SQLite-based implementations of the
//! [`NoteStoreRead`] and [`NoteStoreWrite`] traits from the [`zcash_client_sync`] crate.
//! Every mutating operation runs in its own SQLite transaction, so a failed operation
//! leaves the database unchanged.
//!
//! A database must be initialized with [`wallet::init::init_note_db`] before use.
//!
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::Path;

use rusqlite::{Connection, Transaction};
use tracing::debug;
use zcash_client_sync::{
    data_api::{NoteStoreRead, NoteStoreWrite},
    wallet::Checkpoint,
    AccountBirthday, AccountId, AccountMeta, DiscoveredNote, SpentMarker,
};
use zcash_protocol::consensus::BlockHeight;

pub mod error;
pub mod wallet;

use error::SqliteStoreError;

/// A wrapper for the SQLite connection to the note database.
pub struct NoteDb {
    conn: Connection,
}

impl NoteDb {
    /// Construct a connection to the note database stored at the specified path.
    pub fn for_path<F: AsRef<Path>>(path: F) -> Result<Self, rusqlite::Error> {
        Connection::open(path).and_then(Self::from_connection)
    }

    /// Construct a connection to a new, private in-memory note database.
    pub fn for_memory() -> Result<Self, rusqlite::Error> {
        Connection::open_in_memory().and_then(Self::from_connection)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(NoteDb { conn })
    }

    fn transactionally<F, A>(&mut self, f: F) -> Result<A, SqliteStoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<A, SqliteStoreError>,
    {
        let tx = self.conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl NoteStoreRead for NoteDb {
    type Error = SqliteStoreError;

    fn get_account_meta(&self, account: &AccountId) -> Result<Option<AccountMeta>, Self::Error> {
        wallet::get_account_meta(&self.conn, account)
    }

    fn get_received_notes(&self, account: &AccountId) -> Result<Vec<DiscoveredNote>, Self::Error> {
        wallet::get_received_notes(&self.conn, account)
    }

    fn get_spendable_notes(
        &self,
        account: &AccountId,
    ) -> Result<Vec<DiscoveredNote>, Self::Error> {
        wallet::get_spendable_notes(&self.conn, account)
    }

    fn get_nullifiers(&self, account: &AccountId) -> Result<Vec<SpentMarker>, Self::Error> {
        wallet::get_nullifiers(&self.conn, account)
    }

    fn get_checkpoint_at_or_below(
        &self,
        account: &AccountId,
        height: BlockHeight,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        wallet::get_checkpoint_at_or_below(&self.conn, account, height)
    }
}

impl NoteStoreWrite for NoteDb {
    fn register_account(
        &mut self,
        account: &AccountId,
        birthday: &AccountBirthday,
    ) -> Result<AccountMeta, Self::Error> {
        self.transactionally(|tx| wallet::register_account(tx, account, birthday))
    }

    #[tracing::instrument(skip_all, fields(account = %account))]
    fn apply_scan_results(
        &mut self,
        account: &AccountId,
        notes: &[DiscoveredNote],
        spent: &[SpentMarker],
        blocks: &[Checkpoint],
    ) -> Result<(), Self::Error> {
        self.transactionally(|tx| wallet::apply_scan_results(tx, account, notes, spent, blocks))?;
        debug!(
            blocks = blocks.len(),
            notes = notes.len(),
            spends = spent.len(),
            "Stored scan results"
        );
        Ok(())
    }

    fn handle_chain_reorg(
        &mut self,
        account: &AccountId,
        rewind_to: &Checkpoint,
    ) -> Result<(), Self::Error> {
        self.transactionally(|tx| wallet::handle_chain_reorg(tx, account, rewind_to))?;
        debug!(account = %account, height = %rewind_to.height(), "Rewound note database");
        Ok(())
    }

    fn reset_account_sync_state(&mut self, account: &AccountId) -> Result<(), Self::Error> {
        self.transactionally(|tx| wallet::reset_account_sync_state(tx, account))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use tempfile::NamedTempFile;
    use zcash_client_sync::{
        data_api::{NoteStoreRead, NoteStoreWrite},
        sync::{SyncConfig, SyncEngine, SyncOutcome},
        testing::{
            self, store as store_checks, FakeAction, FakeBlockSource, MockChain,
            RecordingObserver, TestDecoder,
        },
        wallet::Checkpoint,
        BlockHash, DiscoveredNote, Nullifier,
    };
    use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

    use crate::{error::SqliteStoreError, wallet::init::init_note_db, NoteDb};

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    fn test_db() -> NoteDb {
        let mut db = NoteDb::for_memory().unwrap();
        init_note_db(&mut db).unwrap();
        db
    }

    #[test]
    fn register_is_idempotent() {
        store_checks::register_is_idempotent(&mut test_db());
    }

    #[test]
    fn spendable_notes_exclude_spent() {
        store_checks::spendable_notes_exclude_spent(&mut test_db());
    }

    #[test]
    fn checkpoint_is_monotonic() {
        store_checks::checkpoint_is_monotonic(&mut test_db());
    }

    #[test]
    fn reorg_rewind_is_complete() {
        store_checks::reorg_rewind_is_complete(&mut test_db());
    }

    #[test]
    fn failed_apply_is_atomic() {
        store_checks::failed_apply_is_atomic(&mut test_db());
    }

    #[test]
    fn reset_clears_sync_state() {
        store_checks::reset_clears_sync_state(&mut test_db());
    }

    #[test]
    fn block_history_is_recorded() {
        store_checks::block_history_is_recorded(&mut test_db());
    }

    #[test]
    fn errors_identify_their_cause() {
        let mut db = test_db();
        let account = testing::account(0);
        let checkpoint = Checkpoint::new(h(200), BlockHash([2; 32]));

        assert_matches!(
            db.apply_scan_results(&account, &[], &[], &[checkpoint]),
            Err(SqliteStoreError::AccountUnknown(_))
        );

        db.register_account(&account, &testing::birthday(100))
            .unwrap();
        assert_matches!(
            db.apply_scan_results(&account, &[], &[], &[]),
            Err(SqliteStoreError::InvalidBlockRange)
        );
        let note = DiscoveredNote::from_parts(h(150), Nullifier([1; 32]), Zatoshis::ZERO);
        db.apply_scan_results(&account, &[note.clone()], &[], &[checkpoint])
            .unwrap();

        assert_matches!(
            db.apply_scan_results(
                &account,
                &[note],
                &[],
                &[Checkpoint::new(h(300), BlockHash([3; 32]))]
            ),
            Err(SqliteStoreError::DuplicateNullifier(nf)) if nf == Nullifier([1; 32])
        );
        assert_matches!(
            db.apply_scan_results(
                &account,
                &[],
                &[],
                &[Checkpoint::new(h(199), BlockHash([3; 32]))]
            ),
            Err(SqliteStoreError::CheckpointRegression(current, proposed))
                if current == h(200) && proposed == h(199)
        );
        assert_matches!(
            db.handle_chain_reorg(&account, &Checkpoint::new(h(201), BlockHash([3; 32]))),
            Err(SqliteStoreError::RequestedRewindInvalid(current, requested))
                if current == h(200) && requested == h(201)
        );
    }

    #[test]
    fn data_persists_across_connections() {
        let data_file = NamedTempFile::new().unwrap();
        let account = testing::account(3);
        let checkpoint = Checkpoint::new(h(500), BlockHash([5; 32]));
        let note = DiscoveredNote::from_parts(
            h(450),
            Nullifier([4; 32]),
            Zatoshis::const_from_u64(12_345),
        );

        {
            let mut db = NoteDb::for_path(data_file.path()).unwrap();
            init_note_db(&mut db).unwrap();
            db.register_account(&account, &testing::birthday(400))
                .unwrap();
            db.apply_scan_results(&account, &[note.clone()], &[], &[checkpoint])
                .unwrap();
        }

        let mut db = NoteDb::for_path(data_file.path()).unwrap();
        init_note_db(&mut db).unwrap();
        let meta = db.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.birthday(), &testing::birthday(400));
        assert_eq!(meta.latest_scanned(), Some(&checkpoint));
        assert_eq!(db.get_spendable_notes(&account).unwrap(), vec![note]);
        assert_eq!(
            db.get_checkpoint_at_or_below(&account, h(600)).unwrap(),
            Some(checkpoint)
        );
    }

    #[tokio::test]
    async fn engine_syncs_into_sqlite() {
        let mut source = FakeBlockSource::new(h(1));
        source.extend_to(h(104));
        source.push_block(vec![FakeAction::received(7, Nullifier([1; 32]), 10)]);
        source.extend_to(h(599));
        source.push_block(vec![FakeAction::spend(Nullifier([1; 32]))]);
        source.extend_to(h(700));
        let chain = Arc::new(MockChain::new(source));

        let store = Arc::new(Mutex::new(test_db()));
        let engine = SyncEngine::new(
            SyncConfig::new("zcash_regtest", h(1)).with_batch_size(250),
            testing::account(0),
            testing::birthday(100),
            Arc::clone(&chain),
            Arc::clone(&store),
            TestDecoder::new(7),
        );

        let observer = RecordingObserver::new();
        assert_eq!(engine.run(&observer).await, Ok(SyncOutcome::CaughtUp));

        let db = store.lock().unwrap();
        let account = testing::account(0);
        let meta = db.get_account_meta(&account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned().map(|c| c.height()), Some(h(700)));
        assert_eq!(db.get_received_notes(&account).unwrap().len(), 1);
        assert!(db.get_spendable_notes(&account).unwrap().is_empty());
        assert_eq!(db.get_nullifiers(&account).unwrap().len(), 1);
        assert_eq!(
            engine.get_sync_status().spendable_balance(),
            Zatoshis::ZERO
        );
    }

    proptest! {
        #[test]
        fn balance_is_consistent(
            notes in prop::collection::vec(testing::arb_discovered_note(1..5_000), 0..20),
            spent_mask in prop::collection::vec(any::<bool>(), 20),
        ) {
            store_checks::balance_is_consistent(&mut test_db(), &notes, &spent_mask);
        }
    }
}

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
