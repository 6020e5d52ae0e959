//! The migration that performs the initial setup of the note database.

use std::collections::HashSet;

use schemerz_rusqlite::RusqliteMigration;
use uuid::Uuid;

use crate::wallet::init::NoteMigrationError;

pub(super) const MIGRATION_ID: Uuid = Uuid::from_u128(0x3f1c9a52_7e0b_4d8e_a6c1_52b9e07d41a3);

pub(super) struct Migration;

impl schemerz::Migration<Uuid> for Migration {
    fn id(&self) -> Uuid {
        MIGRATION_ID
    }

    fn dependencies(&self) -> HashSet<Uuid> {
        HashSet::new()
    }

    fn description(&self) -> &'static str {
        "Initialize the note database."
    }
}

impl RusqliteMigration for Migration {
    type Error = NoteMigrationError;

    fn up(&self, transaction: &rusqlite::Transaction) -> Result<(), Self::Error> {
        transaction.execute_batch(
            "CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                account_key TEXT NOT NULL UNIQUE,
                birthday_height INTEGER NOT NULL,
                birthday_hash BLOB NOT NULL,
                latest_scanned_height INTEGER,
                latest_scanned_hash BLOB,
                CONSTRAINT latest_scanned_consistency CHECK (
                    (latest_scanned_height IS NULL) = (latest_scanned_hash IS NULL)
                )
            );
            CREATE TABLE received_notes (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                height INTEGER NOT NULL,
                nf BLOB NOT NULL,
                value INTEGER NOT NULL,
                CONSTRAINT nf_uniq UNIQUE (account_id, nf)
            );
            CREATE INDEX received_notes_height ON received_notes (account_id, height);
            CREATE TABLE spent_notes (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                height INTEGER NOT NULL,
                nf BLOB NOT NULL,
                CONSTRAINT nf_uniq UNIQUE (account_id, nf)
            );
            CREATE INDEX spent_notes_height ON spent_notes (account_id, height);",
        )?;
        Ok(())
    }

    fn down(&self, _transaction: &rusqlite::Transaction) -> Result<(), Self::Error> {
        Err(NoteMigrationError::CannotRevert(MIGRATION_ID))
    }
}
