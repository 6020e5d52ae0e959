use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};

use crate::{data_api::SpendableSummary, sync::SyncError, wallet::AccountId};

/// A snapshot of the progress of an account's sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    last_scanned_height: Option<BlockHeight>,
    chain_tip_height: Option<BlockHeight>,
    spendable_note_count: usize,
    spendable_balance: Zatoshis,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            last_scanned_height: None,
            chain_tip_height: None,
            spendable_note_count: 0,
            spendable_balance: Zatoshis::ZERO,
        }
    }
}

impl SyncStatus {
    pub fn from_parts(
        last_scanned_height: Option<BlockHeight>,
        chain_tip_height: Option<BlockHeight>,
        spendable_note_count: usize,
        spendable_balance: Zatoshis,
    ) -> Self {
        SyncStatus {
            last_scanned_height,
            chain_tip_height,
            spendable_note_count,
            spendable_balance,
        }
    }

    /// The height of the last block whose scan results have been committed.
    pub fn last_scanned_height(&self) -> Option<BlockHeight> {
        self.last_scanned_height
    }

    /// The chain tip height as of the most recent chain tip request.
    pub fn chain_tip_height(&self) -> Option<BlockHeight> {
        self.chain_tip_height
    }

    pub fn spendable_note_count(&self) -> usize {
        self.spendable_note_count
    }

    /// The sum of the values of the account's spendable notes.
    pub fn spendable_balance(&self) -> Zatoshis {
        self.spendable_balance
    }

    /// Returns whether the account has been scanned up to the chain tip.
    pub fn is_caught_up(&self) -> bool {
        matches!(
            (self.last_scanned_height, self.chain_tip_height),
            (Some(scanned), Some(tip)) if scanned >= tip
        )
    }

    pub(crate) fn set_chain_tip(&mut self, tip: BlockHeight) {
        self.chain_tip_height = Some(tip);
    }

    pub(crate) fn set_last_scanned(&mut self, height: Option<BlockHeight>) {
        self.last_scanned_height = height;
    }

    pub(crate) fn set_spendable(&mut self, summary: &SpendableSummary) {
        self.spendable_note_count = summary.note_count();
        self.spendable_balance = summary.balance();
    }
}

/// Receives notifications about the progress of a sync session.
///
/// Notifications are delivered from the task running the session. Implementations
/// should return promptly.
pub trait SyncObserver: Send + Sync {
    /// Called once when a session starts.
    fn on_sync_start(&self, _account: &AccountId) {}

    /// Called whenever the observable sync state changes: the chain tip becomes known,
    /// the account is initialized or rewound, or a batch of blocks is committed.
    fn on_sync_status_update(&self, _account: &AccountId, _status: &SyncStatus) {}

    /// Called once when a session ends because the account is caught up or because a
    /// pause was requested.
    fn on_sync_stop(&self, _account: &AccountId) {}

    /// Called once when a session ends with an error.
    fn on_sync_error(&self, _account: &AccountId, _error: &SyncError) {}
}

/// An observer that ignores all notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
