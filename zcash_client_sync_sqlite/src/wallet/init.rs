//! Functions for initializing the note database.

use std::fmt;

use schemerz::Migrator;
use schemerz_rusqlite::RusqliteAdapter;
use tracing::debug;
use uuid::Uuid;

use crate::{error::SqliteStoreError, NoteDb};

mod migrations;

/// Errors that may occur while applying a migration to the note database.
#[derive(Debug)]
pub enum NoteMigrationError {
    /// Wrapper for rusqlite errors.
    DbError(rusqlite::Error),

    /// Reverting the specified migration is not supported.
    CannotRevert(Uuid),
}

impl From<rusqlite::Error> for NoteMigrationError {
    fn from(e: rusqlite::Error) -> Self {
        NoteMigrationError::DbError(e)
    }
}

impl fmt::Display for NoteMigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            NoteMigrationError::DbError(e) => write!(f, "{}", e),
            NoteMigrationError::CannotRevert(uuid) => {
                write!(f, "Reverting migration {} is not supported", uuid)
            }
        }
    }
}

impl std::error::Error for NoteMigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            NoteMigrationError::DbError(e) => Some(e),
            _ => None,
        }
    }
}

/// Sets up the internal structure of the note database, applying any migrations that
/// have not yet been applied.
///
/// # Examples
///
/// ```
/// use tempfile::NamedTempFile;
/// use zcash_client_sync_sqlite::{wallet::init::init_note_db, NoteDb};
///
/// let data_file = NamedTempFile::new().unwrap();
/// let mut db = NoteDb::for_path(data_file.path()).unwrap();
/// init_note_db(&mut db).unwrap();
/// ```
pub fn init_note_db(db: &mut NoteDb) -> Result<(), SqliteStoreError> {
    let adapter = RusqliteAdapter::<NoteMigrationError>::new(
        &mut db.conn,
        Some("schemer_migrations".to_string()),
    );
    adapter.init()?;

    let mut migrator = Migrator::new(adapter);
    migrator.register_multiple(migrations::all_migrations().into_iter())?;
    migrator.up(None)?;
    debug!("Note database migrations applied");

    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::{named_params, OptionalExtension};

    use super::init_note_db;
    use crate::NoteDb;

    #[test]
    fn init_is_idempotent() {
        let mut db = NoteDb::for_memory().unwrap();
        init_note_db(&mut db).unwrap();
        init_note_db(&mut db).unwrap();

        for table in ["accounts", "received_notes", "spent_notes", "scan_checkpoints"] {
            let found = db
                .conn
                .query_row(
                    "SELECT name FROM sqlite_schema WHERE type = 'table' AND name = :name",
                    named_params![":name": table],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .unwrap();
            assert_eq!(found.as_deref(), Some(table));
        }
    }
}
