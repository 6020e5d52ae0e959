//! Adds a history of the height and hash of every scanned block, so that the depth of a
//! chain reorg can be determined.

use std::collections::HashSet;

use schemerz_rusqlite::RusqliteMigration;
use uuid::Uuid;

use crate::wallet::init::{migrations::initial_setup, NoteMigrationError};

pub(super) const MIGRATION_ID: Uuid = Uuid::from_u128(0x8b2e64d0_19fa_4c57_b3e8_0d6a2f91c7b5);

const DEPENDENCIES: &[Uuid] = &[initial_setup::MIGRATION_ID];

pub(super) struct Migration;

impl schemerz::Migration<Uuid> for Migration {
    fn id(&self) -> Uuid {
        MIGRATION_ID
    }

    fn dependencies(&self) -> HashSet<Uuid> {
        DEPENDENCIES.iter().copied().collect()
    }

    fn description(&self) -> &'static str {
        "Adds a table recording the hash of each scanned block."
    }
}

impl RusqliteMigration for Migration {
    type Error = NoteMigrationError;

    fn up(&self, transaction: &rusqlite::Transaction) -> Result<(), Self::Error> {
        transaction.execute_batch(
            "CREATE TABLE scan_checkpoints (
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                height INTEGER NOT NULL,
                hash BLOB NOT NULL,
                PRIMARY KEY (account_id, height)
            );
            INSERT INTO scan_checkpoints (account_id, height, hash)
            SELECT id, latest_scanned_height, latest_scanned_hash
            FROM accounts
            WHERE latest_scanned_height IS NOT NULL;",
        )?;
        Ok(())
    }

    fn down(&self, _transaction: &rusqlite::Transaction) -> Result<(), Self::Error> {
        Err(NoteMigrationError::CannotRevert(MIGRATION_ID))
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::named_params;
    use schemerz::Migrator;
    use schemerz_rusqlite::RusqliteAdapter;

    use crate::{
        wallet::init::{migrations::initial_setup, NoteMigrationError},
        NoteDb,
    };

    #[test]
    fn existing_checkpoints_are_carried_over() {
        let mut db = NoteDb::for_memory().unwrap();
        {
            let adapter = RusqliteAdapter::<NoteMigrationError>::new(
                &mut db.conn,
                Some("schemer_migrations".to_string()),
            );
            adapter.init().unwrap();
            let mut migrator = Migrator::new(adapter);
            migrator.register(Box::new(initial_setup::Migration)).unwrap();
            migrator.up(None).unwrap();
        }

        db.conn
            .execute(
                "INSERT INTO accounts
                    (account_key, birthday_height, birthday_hash,
                     latest_scanned_height, latest_scanned_hash)
                VALUES (:key, 100, :hash, 250, :hash)",
                named_params![":key": "133_0_derived_0", ":hash": &[1u8; 32][..]],
            )
            .unwrap();

        crate::wallet::init::init_note_db(&mut db).unwrap();

        let height: u32 = db
            .conn
            .query_row("SELECT height FROM scan_checkpoints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(height, 250);
    }
}
