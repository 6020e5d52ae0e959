//! Sync engine errors.

/// The class of failure that produced a [`SyncError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// A request to the chain data source failed.
    Network,
    /// A read from or write to the note store failed.
    Storage,
    /// The account's configuration is inconsistent with the chain.
    Consistency,
    /// The block scanner failed.
    Scanner,
    /// The engine was used incorrectly.
    Usage,
}

/// The terminal error of a sync session.
///
/// Every variant other than [`SyncError::SyncAlreadyRunning`] corresponds to a failure
/// at one step of the sync state machine, and carries a human-readable description of
/// the underlying cause.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The chain tip could not be obtained.
    #[error("Failed to update chain tip: {0}")]
    FailedToUpdateChainTip(String),
    /// The account's sync metadata could not be read from the store.
    #[error("Failed to retrieve account: {0}")]
    FailedToRetrieveAccount(String),
    /// The account could not be registered with the store.
    ///
    /// `retryable` is false when the account's birthday is invalid.
    #[error("Failed to initialize account: {message}")]
    FailedToInitAccount { message: String, retryable: bool },
    /// A tree state required to verify the account's checkpoint could not be obtained.
    #[error("Failed to receive tree state: {0}")]
    FailedToReceiveTreeState(String),
    /// A range of compact blocks could not be downloaded.
    #[error("Failed to download blocks: {0}")]
    FailedToDownloadBlocks(String),
    /// The account's spendable notes could not be read from the store.
    #[error("Failed to retrieve spendable notes: {0}")]
    FailedToRetrieveSpendableNotes(String),
    /// The block scanner failed.
    #[error("Scanner error: {0}")]
    ScannerError(String),
    /// A write to the store failed.
    #[error("Failed to update database: {0}")]
    FailedToUpdateDatabase(String),
    /// A session is already running on this engine.
    #[error("A sync session is already running for this account")]
    SyncAlreadyRunning,
}

impl SyncError {
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            SyncError::FailedToUpdateChainTip(_)
            | SyncError::FailedToReceiveTreeState(_)
            | SyncError::FailedToDownloadBlocks(_) => ErrorOrigin::Network,
            SyncError::FailedToRetrieveAccount(_)
            | SyncError::FailedToRetrieveSpendableNotes(_)
            | SyncError::FailedToUpdateDatabase(_) => ErrorOrigin::Storage,
            SyncError::FailedToInitAccount { retryable, .. } => {
                if *retryable {
                    ErrorOrigin::Storage
                } else {
                    ErrorOrigin::Consistency
                }
            }
            SyncError::ScannerError(_) => ErrorOrigin::Scanner,
            SyncError::SyncAlreadyRunning => ErrorOrigin::Usage,
        }
    }

    /// Returns whether starting a new session may succeed without any change to the
    /// account's configuration.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.origin(), ErrorOrigin::Consistency | ErrorOrigin::Usage)
    }
}
