//! Error types for problems that may arise when reading or storing sync data to SQLite.

use std::error;
use std::fmt;

use schemerz::MigratorError;
use uuid::Uuid;
use zcash_client_sync::{AccountId, Nullifier};
use zcash_protocol::consensus::BlockHeight;

use crate::wallet::init::NoteMigrationError;

/// The primary error type for the SQLite note store.
#[derive(Debug)]
pub enum SqliteStoreError {
    /// Decoding of a stored value from its serialized form has failed.
    CorruptedData(String),

    /// Wrapper for rusqlite errors.
    DbError(rusqlite::Error),

    /// A migration of the database schema failed.
    Migration(MigratorError<Uuid, NoteMigrationError>),

    /// The account for which information was requested has not been registered.
    AccountUnknown(AccountId),

    /// Scan results would move the account's checkpoint to a lower height. The payload is
    /// (current checkpoint height, proposed height).
    CheckpointRegression(BlockHeight, BlockHeight),

    /// A requested rewind is above the account's checkpoint. The payload is (current
    /// checkpoint height, requested height).
    RequestedRewindInvalid(BlockHeight, BlockHeight),

    /// A note or spent marker with this nullifier is already recorded for the account.
    DuplicateNullifier(Nullifier),

    /// Scan results were provided for an empty or unordered sequence of blocks.
    InvalidBlockRange,
}

impl error::Error for SqliteStoreError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            SqliteStoreError::DbError(e) => Some(e),
            SqliteStoreError::Migration(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SqliteStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            SqliteStoreError::CorruptedData(reason) => {
                write!(f, "Note DB is corrupted: {}", reason)
            }
            SqliteStoreError::DbError(e) => write!(f, "{}", e),
            SqliteStoreError::Migration(e) => write!(f, "Note DB migration failed: {}", e),
            SqliteStoreError::AccountUnknown(account) => {
                write!(f, "Account {} has not been registered.", account)
            }
            SqliteStoreError::CheckpointRegression(current, proposed) => write!(
                f,
                "Scan results ending at height {} cannot be applied to an account scanned to height {}.",
                proposed, current
            ),
            SqliteStoreError::RequestedRewindInvalid(current, requested) => write!(
                f,
                "A rewind must not be above the account's checkpoint at height {}; the requested height was {}.",
                current, requested
            ),
            SqliteStoreError::DuplicateNullifier(nf) => {
                write!(f, "Nullifier {:?} is already recorded for this account.", nf)
            }
            SqliteStoreError::InvalidBlockRange => write!(
                f,
                "Scan results must cover at least one block, in ascending height order."
            ),
        }
    }
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(e: rusqlite::Error) -> Self {
        SqliteStoreError::DbError(e)
    }
}

impl From<MigratorError<Uuid, NoteMigrationError>> for SqliteStoreError {
    fn from(e: MigratorError<Uuid, NoteMigrationError>) -> Self {
        SqliteStoreError::Migration(e)
    }
}
