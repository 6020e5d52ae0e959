//! Structs representing the notes and sync state of a shielded account.

use std::fmt;

use subtle::{Choice, ConstantTimeEq};
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::{block::BlockHash, proto::service::TreeState};

/// The kind of key derivation that produced an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountKind {
    /// An account derived from the wallet's seed.
    Derived,
    /// An account whose keys were imported.
    Imported,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountKind::Derived => write!(f, "derived"),
            AccountKind::Imported => write!(f, "imported"),
        }
    }
}

/// An opaque identifier for a shielded account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId {
    coin_type: u32,
    keyring: u32,
    kind: AccountKind,
    index: u32,
}

impl AccountId {
    /// Constructs an account identifier from its parts.
    pub fn new(coin_type: u32, keyring: u32, kind: AccountKind, index: u32) -> Self {
        AccountId {
            coin_type,
            keyring,
            kind,
            index,
        }
    }

    /// The SLIP-44 coin type of the account.
    pub fn coin_type(&self) -> u32 {
        self.coin_type
    }

    /// The keyring the account belongs to.
    pub fn keyring(&self) -> u32 {
        self.keyring
    }

    /// How the account's keys were obtained.
    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    /// The account index within its keyring.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the canonical string key for this account, used as the primary key in
    /// persistent storage.
    pub fn unique_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.coin_type, self.keyring, self.kind, self.index
        )
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_key())
    }
}

/// An Orchard nullifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nullifier(pub [u8; 32]);

impl Nullifier {
    /// Parses a nullifier from its encoding in a compact action.
    ///
    /// Returns `None` if the slice is not 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Nullifier)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nullifier({})", hex::encode(self.0))
    }
}

impl ConstantTimeEq for Nullifier {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

/// A note received by the account, detected by trial decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredNote {
    height: BlockHeight,
    nullifier: Nullifier,
    value: Zatoshis,
}

impl DiscoveredNote {
    pub fn from_parts(height: BlockHeight, nullifier: Nullifier, value: Zatoshis) -> Self {
        DiscoveredNote {
            height,
            nullifier,
            value,
        }
    }

    /// The height of the block in which the note was created.
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// The nullifier that will be revealed when the note is spent.
    pub fn nullifier(&self) -> &Nullifier {
        &self.nullifier
    }

    pub fn value(&self) -> Zatoshis {
        self.value
    }
}

/// An observation of one of the account's nullifiers on chain, marking the
/// corresponding note as spent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentMarker {
    height: BlockHeight,
    nullifier: Nullifier,
}

impl SpentMarker {
    pub fn from_parts(height: BlockHeight, nullifier: Nullifier) -> Self {
        SpentMarker { height, nullifier }
    }

    /// The height of the block in which the nullifier was revealed.
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn nullifier(&self) -> &Nullifier {
        &self.nullifier
    }
}

/// A block height and hash pair identifying a point on the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    height: BlockHeight,
    hash: BlockHash,
}

impl Checkpoint {
    pub fn new(height: BlockHeight, hash: BlockHash) -> Self {
        Checkpoint { height, hash }
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }
}

/// Errors that can occur in parsing a [`TreeState`] returned by a chain data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeStateError {
    /// The tree state height does not fit in a [`BlockHeight`].
    InvalidHeight(u64),
    /// The tree state hash could not be parsed.
    InvalidHash(String),
}

impl fmt::Display for TreeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeStateError::InvalidHeight(h) => write!(f, "Tree state height {} is out of range", h),
            TreeStateError::InvalidHash(e) => write!(f, "Tree state hash is invalid: {}", e),
        }
    }
}

impl std::error::Error for TreeStateError {}

impl TreeState {
    /// Returns the height and hash of the block this tree state describes.
    pub fn checkpoint(&self) -> Result<Checkpoint, TreeStateError> {
        let height = u32::try_from(self.height)
            .map(BlockHeight::from_u32)
            .map_err(|_| TreeStateError::InvalidHeight(self.height))?;
        let hash = self
            .hash
            .parse::<BlockHash>()
            .map_err(|e| TreeStateError::InvalidHash(e.to_string()))?;
        Ok(Checkpoint::new(height, hash))
    }
}

/// The height (and hash) below which an account cannot have received funds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountBirthday {
    height: BlockHeight,
    hash: BlockHash,
}

impl AccountBirthday {
    pub fn from_parts(height: BlockHeight, hash: BlockHash) -> Self {
        AccountBirthday { height, hash }
    }

    /// Constructs an account birthday from the tree state of the block at the birthday
    /// height.
    pub fn from_treestate(treestate: &TreeState) -> Result<Self, TreeStateError> {
        let checkpoint = treestate.checkpoint()?;
        Ok(AccountBirthday::from_parts(
            checkpoint.height(),
            *checkpoint.hash(),
        ))
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    /// The height immediately below the birthday: the scan cursor of an account that
    /// has not yet scanned any blocks.
    pub fn scan_floor(&self) -> BlockHeight {
        self.height.saturating_sub(1)
    }
}

/// The persisted sync state of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountMeta {
    birthday: AccountBirthday,
    latest_scanned: Option<Checkpoint>,
}

impl AccountMeta {
    pub fn from_parts(birthday: AccountBirthday, latest_scanned: Option<Checkpoint>) -> Self {
        AccountMeta {
            birthday,
            latest_scanned,
        }
    }

    pub fn birthday(&self) -> &AccountBirthday {
        &self.birthday
    }

    /// The last block whose scan results have been committed, if any.
    pub fn latest_scanned(&self) -> Option<&Checkpoint> {
        self.latest_scanned.as_ref()
    }
}

/// Sums the values of the given notes.
///
/// Returns `None` if the sum overflows the valid range of [`Zatoshis`].
pub fn total_value<'a, I>(notes: I) -> Option<Zatoshis>
where
    I: IntoIterator<Item = &'a DiscoveredNote>,
{
    notes
        .into_iter()
        .try_fold(Zatoshis::ZERO, |acc, note| acc + note.value())
}

#[cfg(test)]
mod tests {
    use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

    use super::{
        total_value, AccountBirthday, AccountId, AccountKind, DiscoveredNote, Nullifier,
    };
    use crate::{block::BlockHash, proto::service::TreeState};

    #[test]
    fn unique_key_format() {
        let account = AccountId::new(133, 0, AccountKind::Derived, 2);
        assert_eq!(account.unique_key(), "133_0_derived_2");
    }

    #[test]
    fn birthday_from_treestate() {
        let hash = BlockHash([7; 32]);
        let treestate = TreeState {
            network: "main".to_string(),
            height: 1_700_000,
            hash: hash.to_string(),
            ..Default::default()
        };
        let birthday = AccountBirthday::from_treestate(&treestate).unwrap();
        assert_eq!(birthday.height(), BlockHeight::from_u32(1_700_000));
        assert_eq!(birthday.hash(), &hash);
        assert_eq!(birthday.scan_floor(), BlockHeight::from_u32(1_699_999));

        let bad = TreeState {
            hash: "not hex".to_string(),
            ..treestate
        };
        assert!(AccountBirthday::from_treestate(&bad).is_err());
    }

    #[test]
    fn total_value_sums_notes() {
        let notes = [3u64, 4, 5]
            .iter()
            .enumerate()
            .map(|(i, v)| {
                DiscoveredNote::from_parts(
                    BlockHeight::from_u32(10),
                    Nullifier([i as u8; 32]),
                    Zatoshis::const_from_u64(*v),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(total_value(&notes), Some(Zatoshis::const_from_u64(12)));
        assert_eq!(total_value(&Vec::<DiscoveredNote>::new()), Some(Zatoshis::ZERO));
    }
}
