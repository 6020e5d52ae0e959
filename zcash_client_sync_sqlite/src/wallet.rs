//! Functions for querying and updating the note database.
//!
//! Each function operates on a borrowed connection; callers that modify the database are
//! responsible for wrapping the calls for a single store operation in a transaction.

use rusqlite::{named_params, Connection, Row};
use zcash_client_sync::{
    wallet::Checkpoint, AccountBirthday, AccountId, AccountMeta, BlockHash, DiscoveredNote,
    Nullifier, SpentMarker,
};
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::error::SqliteStoreError;

pub mod init;

fn parse_hash(bytes: &[u8]) -> Result<BlockHash, SqliteStoreError> {
    BlockHash::try_from_slice(bytes).ok_or_else(|| {
        SqliteStoreError::CorruptedData(format!("Invalid block hash length {}", bytes.len()))
    })
}

fn parse_nullifier(bytes: &[u8]) -> Result<Nullifier, SqliteStoreError> {
    Nullifier::from_slice(bytes).ok_or_else(|| {
        SqliteStoreError::CorruptedData(format!("Invalid nullifier length {}", bytes.len()))
    })
}

fn map_duplicate(nf: Nullifier) -> impl FnOnce(rusqlite::Error) -> SqliteStoreError {
    move |e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SqliteStoreError::DuplicateNullifier(nf)
        }
        e => SqliteStoreError::DbError(e),
    }
}

fn read_note(row: &Row) -> Result<DiscoveredNote, SqliteStoreError> {
    let height = BlockHeight::from_u32(row.get("height")?);
    let nf = parse_nullifier(&row.get::<_, Vec<u8>>("nf")?)?;
    let value: u64 = row.get("value")?;
    let value = Zatoshis::from_u64(value).map_err(|_| {
        SqliteStoreError::CorruptedData(format!("Invalid note value {}", value))
    })?;
    Ok(DiscoveredNote::from_parts(height, nf, value))
}

/// Returns the internal identifier of the account along with its sync metadata.
fn account_row(
    conn: &Connection,
    account: &AccountId,
) -> Result<Option<(i64, AccountMeta)>, SqliteStoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, birthday_height, birthday_hash, latest_scanned_height, latest_scanned_hash
         FROM accounts
         WHERE account_key = :account_key",
    )?;
    let mut rows = stmt.query_and_then(
        named_params![":account_key": account.unique_key()],
        |row| -> Result<_, SqliteStoreError> {
            let id: i64 = row.get("id")?;
            let birthday = AccountBirthday::from_parts(
                BlockHeight::from_u32(row.get("birthday_height")?),
                parse_hash(&row.get::<_, Vec<u8>>("birthday_hash")?)?,
            );
            let latest_height: Option<u32> = row.get("latest_scanned_height")?;
            let latest_hash: Option<Vec<u8>> = row.get("latest_scanned_hash")?;
            let latest_scanned = match (latest_height, latest_hash) {
                (Some(height), Some(hash)) => Some(Checkpoint::new(
                    BlockHeight::from_u32(height),
                    parse_hash(&hash)?,
                )),
                (None, None) => None,
                _ => {
                    return Err(SqliteStoreError::CorruptedData(
                        "Incomplete latest scanned block".to_string(),
                    ))
                }
            };
            Ok((id, AccountMeta::from_parts(birthday, latest_scanned)))
        },
    )?;
    rows.next().transpose()
}

fn require_account(
    conn: &Connection,
    account: &AccountId,
) -> Result<(i64, AccountMeta), SqliteStoreError> {
    account_row(conn, account)?.ok_or_else(|| SqliteStoreError::AccountUnknown(account.clone()))
}

pub(crate) fn get_account_meta(
    conn: &Connection,
    account: &AccountId,
) -> Result<Option<AccountMeta>, SqliteStoreError> {
    Ok(account_row(conn, account)?.map(|(_, meta)| meta))
}

pub(crate) fn get_received_notes(
    conn: &Connection,
    account: &AccountId,
) -> Result<Vec<DiscoveredNote>, SqliteStoreError> {
    let (account_id, _) = require_account(conn, account)?;
    let mut stmt = conn.prepare_cached(
        "SELECT height, nf, value
         FROM received_notes
         WHERE account_id = :account_id
         ORDER BY height, id",
    )?;
    let notes = stmt
        .query_and_then(named_params![":account_id": account_id], read_note)?
        .collect::<Result<_, _>>()?;
    Ok(notes)
}

pub(crate) fn get_spendable_notes(
    conn: &Connection,
    account: &AccountId,
) -> Result<Vec<DiscoveredNote>, SqliteStoreError> {
    let (account_id, _) = require_account(conn, account)?;
    let mut stmt = conn.prepare_cached(
        "SELECT rn.height, rn.nf, rn.value
         FROM received_notes rn
         WHERE rn.account_id = :account_id
         AND NOT EXISTS (
            SELECT 1 FROM spent_notes sn
            WHERE sn.account_id = rn.account_id
            AND sn.nf = rn.nf
         )
         ORDER BY rn.height, rn.id",
    )?;
    let notes = stmt
        .query_and_then(named_params![":account_id": account_id], read_note)?
        .collect::<Result<_, _>>()?;
    Ok(notes)
}

pub(crate) fn get_nullifiers(
    conn: &Connection,
    account: &AccountId,
) -> Result<Vec<SpentMarker>, SqliteStoreError> {
    let (account_id, _) = require_account(conn, account)?;
    let mut stmt = conn.prepare_cached(
        "SELECT height, nf
         FROM spent_notes
         WHERE account_id = :account_id
         ORDER BY height, id",
    )?;
    let markers = stmt
        .query_and_then(named_params![":account_id": account_id], |row| {
            let height = BlockHeight::from_u32(row.get("height")?);
            let nf = parse_nullifier(&row.get::<_, Vec<u8>>("nf")?)?;
            Ok::<_, SqliteStoreError>(SpentMarker::from_parts(height, nf))
        })?
        .collect::<Result<_, _>>()?;
    Ok(markers)
}

pub(crate) fn get_checkpoint_at_or_below(
    conn: &Connection,
    account: &AccountId,
    height: BlockHeight,
) -> Result<Option<Checkpoint>, SqliteStoreError> {
    let (account_id, _) = require_account(conn, account)?;
    let mut stmt = conn.prepare_cached(
        "SELECT height, hash
         FROM scan_checkpoints
         WHERE account_id = :account_id
         AND height <= :height
         ORDER BY height DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query_and_then(
        named_params![
            ":account_id": account_id,
            ":height": u32::from(height),
        ],
        |row| -> Result<_, SqliteStoreError> {
            let height = BlockHeight::from_u32(row.get("height")?);
            let hash = parse_hash(&row.get::<_, Vec<u8>>("hash")?)?;
            Ok(Checkpoint::new(height, hash))
        },
    )?;
    rows.next().transpose()
}

pub(crate) fn register_account(
    conn: &Connection,
    account: &AccountId,
    birthday: &AccountBirthday,
) -> Result<AccountMeta, SqliteStoreError> {
    if let Some(meta) = get_account_meta(conn, account)? {
        return Ok(meta);
    }

    conn.execute(
        "INSERT INTO accounts (account_key, birthday_height, birthday_hash)
         VALUES (:account_key, :birthday_height, :birthday_hash)",
        named_params![
            ":account_key": account.unique_key(),
            ":birthday_height": u32::from(birthday.height()),
            ":birthday_hash": &birthday.hash().0[..],
        ],
    )?;

    Ok(AccountMeta::from_parts(*birthday, None))
}

/// Adds a block to the account's block history, replacing any entry at the same height.
fn record_block(
    conn: &Connection,
    account_id: i64,
    block: &Checkpoint,
) -> Result<(), SqliteStoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO scan_checkpoints (account_id, height, hash)
         VALUES (:account_id, :height, :hash)
         ON CONFLICT (account_id, height) DO UPDATE SET hash = :hash",
    )?;
    stmt.execute(named_params![
        ":account_id": account_id,
        ":height": u32::from(block.height()),
        ":hash": &block.hash().0[..],
    ])?;
    Ok(())
}

fn set_checkpoint(
    conn: &Connection,
    account_id: i64,
    checkpoint: &Checkpoint,
) -> Result<(), SqliteStoreError> {
    conn.execute(
        "UPDATE accounts
         SET latest_scanned_height = :height, latest_scanned_hash = :hash
         WHERE id = :account_id",
        named_params![
            ":account_id": account_id,
            ":height": u32::from(checkpoint.height()),
            ":hash": &checkpoint.hash().0[..],
        ],
    )?;
    record_block(conn, account_id, checkpoint)
}

pub(crate) fn apply_scan_results(
    conn: &Connection,
    account: &AccountId,
    notes: &[DiscoveredNote],
    spent: &[SpentMarker],
    blocks: &[Checkpoint],
) -> Result<(), SqliteStoreError> {
    let checkpoint = match blocks.last() {
        Some(last) if blocks.windows(2).all(|w| w[0].height() < w[1].height()) => last,
        _ => return Err(SqliteStoreError::InvalidBlockRange),
    };
    let (account_id, meta) = require_account(conn, account)?;
    if let Some(current) = meta.latest_scanned() {
        if checkpoint.height() < current.height() {
            return Err(SqliteStoreError::CheckpointRegression(
                current.height(),
                checkpoint.height(),
            ));
        }
    }

    let mut insert_note = conn.prepare_cached(
        "INSERT INTO received_notes (account_id, height, nf, value)
         VALUES (:account_id, :height, :nf, :value)",
    )?;
    for note in notes {
        insert_note
            .execute(named_params![
                ":account_id": account_id,
                ":height": u32::from(note.height()),
                ":nf": &note.nullifier().0[..],
                ":value": u64::from(note.value()),
            ])
            .map_err(map_duplicate(*note.nullifier()))?;
    }

    let mut insert_spend = conn.prepare_cached(
        "INSERT INTO spent_notes (account_id, height, nf)
         VALUES (:account_id, :height, :nf)",
    )?;
    for marker in spent {
        insert_spend
            .execute(named_params![
                ":account_id": account_id,
                ":height": u32::from(marker.height()),
                ":nf": &marker.nullifier().0[..],
            ])
            .map_err(map_duplicate(*marker.nullifier()))?;
    }

    for block in blocks {
        record_block(conn, account_id, block)?;
    }
    set_checkpoint(conn, account_id, checkpoint)
}

pub(crate) fn handle_chain_reorg(
    conn: &Connection,
    account: &AccountId,
    rewind_to: &Checkpoint,
) -> Result<(), SqliteStoreError> {
    let (account_id, meta) = require_account(conn, account)?;
    if let Some(current) = meta.latest_scanned() {
        if rewind_to.height() > current.height() {
            return Err(SqliteStoreError::RequestedRewindInvalid(
                current.height(),
                rewind_to.height(),
            ));
        }
    }

    let height = u32::from(rewind_to.height());
    for table in ["received_notes", "spent_notes", "scan_checkpoints"] {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE account_id = :account_id AND height > :height",
                table
            ),
            named_params![":account_id": account_id, ":height": height],
        )?;
    }

    set_checkpoint(conn, account_id, rewind_to)
}

pub(crate) fn reset_account_sync_state(
    conn: &Connection,
    account: &AccountId,
) -> Result<(), SqliteStoreError> {
    let (account_id, _) = require_account(conn, account)?;
    for table in ["received_notes", "spent_notes", "scan_checkpoints"] {
        conn.execute(
            &format!("DELETE FROM {} WHERE account_id = :account_id", table),
            named_params![":account_id": account_id],
        )?;
    }
    conn.execute(
        "UPDATE accounts
         SET latest_scanned_height = NULL, latest_scanned_hash = NULL
         WHERE id = :account_id",
        named_params![":account_id": account_id],
    )?;
    Ok(())
}
