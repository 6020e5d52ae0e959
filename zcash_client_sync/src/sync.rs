//! The sync engine.
//!
//! A [`SyncEngine`] keeps a single account's note store consistent with the chain. Each
//! session runs the following state machine until the account is caught up with the
//! chain tip, a pause is requested, or a step fails:
//!
//! ```text
//! Uninitialized ─▶ TipKnown ─┬─▶ Provisioning ─────────┐
//!                            └─────────────────────────┴─▶ VerifyingChainState
//!                                                             │        ▲
//!                                                             ▼        │
//!                                                         ReorgRecovery┘
//!                                                             │
//!   VerifyingChainState ─▶ Scanning ─▶ BlocksDownloaded ─▶ BlocksScanned
//!                            ▲   │                              │
//!                            │   └─▶ CaughtUp                   │
//!                            └──────────────────────────────────┘
//! ```
//!
//! The account's checkpoint is compared against the chain before any block is scanned.
//! If the chain no longer contains the checkpointed block, the account is rewound to the
//! highest block of its scan history at least `reorg_delta` blocks below it that is still
//! on the chain, and scanning resumes from there. Scan results for a batch of blocks are
//! committed to the store atomically, together with the hash of every scanned block.
//!
//! Pause requests are honored between steps; a step that is in progress always runs to
//! completion, so a paused session never leaves a batch partially committed.

use std::cmp::max;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use tracing::{debug, info, trace, warn};
use zcash_protocol::consensus::{BlockHeight, NetworkType, NetworkUpgrade, Parameters};

use crate::{
    data_api::{spendable_summary, NoteStoreWrite, SpendableSummary},
    proto::{compact_formats::CompactBlock, service::BlockId},
    rpc::ChainClient,
    scanning::{scan_blocks, ActionDecoder},
    wallet::{AccountBirthday, AccountId, AccountMeta, Checkpoint, DiscoveredNote},
};

mod error;
mod observer;
pub(crate) mod state;

pub use error::{ErrorOrigin, SyncError};
pub use observer::{NoopObserver, SyncObserver, SyncStatus};

use state::{
    next_batch, recovery_height_below, verification_for, ScanCursor, SyncState, Verification,
};

/// The number of blocks below a stale checkpoint to which an account is rewound when a
/// reorg is detected.
pub const REORG_DELTA: u32 = 150;

/// The default maximum number of blocks downloaded and scanned as a single batch.
pub const DEFAULT_BATCH_SIZE: u32 = 1024;

/// The default number of times a failed commit of scan results is retried before the
/// session fails.
pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

/// Configuration of a [`SyncEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    chain_id: String,
    reorg_delta: u32,
    batch_size: u32,
    max_commit_retries: u32,
    orchard_activation_height: BlockHeight,
}

impl SyncConfig {
    /// Constructs a configuration with default tuning for the chain identified by
    /// `chain_id`, on which Orchard activated at `orchard_activation_height`.
    pub fn new(chain_id: impl Into<String>, orchard_activation_height: BlockHeight) -> Self {
        SyncConfig {
            chain_id: chain_id.into(),
            reorg_delta: REORG_DELTA,
            batch_size: DEFAULT_BATCH_SIZE,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            orchard_activation_height,
        }
    }

    /// Constructs a configuration for the given consensus parameters.
    ///
    /// Returns `None` if NU5 has no activation height on the network.
    pub fn for_network<P: Parameters>(params: &P) -> Option<Self> {
        let chain_id = match params.network_type() {
            NetworkType::Main => "zcash_mainnet",
            NetworkType::Test => "zcash_testnet",
            NetworkType::Regtest => "zcash_regtest",
        };
        params
            .activation_height(NetworkUpgrade::Nu5)
            .map(|activation| SyncConfig::new(chain_id, activation))
    }

    /// Sets the reorg rewind distance. Values below 1 are treated as 1.
    pub fn with_reorg_delta(mut self, reorg_delta: u32) -> Self {
        self.reorg_delta = max(reorg_delta, 1);
        self
    }

    /// Sets the maximum batch size. Values below 1 are treated as 1.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = max(batch_size, 1);
        self
    }

    pub fn with_max_commit_retries(mut self, max_commit_retries: u32) -> Self {
        self.max_commit_retries = max_commit_retries;
        self
    }

    /// The identifier of the chain passed to every [`ChainClient`] request.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn reorg_delta(&self) -> u32 {
        self.reorg_delta
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn max_commit_retries(&self) -> u32 {
        self.max_commit_retries
    }

    /// The lowest valid account birthday height.
    pub fn orchard_activation_height(&self) -> BlockHeight {
        self.orchard_activation_height
    }
}

/// A handle that may be used to request that a running session stop.
///
/// A paused session stops at the next step boundary and reports
/// [`SyncOutcome::Paused`]. Starting a new session clears the request.
#[derive(Clone, Debug, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The way in which a sync session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The account is scanned up to the chain tip observed at the start of the session.
    CaughtUp,
    /// A pause was requested.
    Paused,
}

/// Marks an engine as running a session for as long as it is held.
struct SessionGuard(Arc<AtomicBool>);

impl SessionGuard {
    fn acquire(running: &Arc<AtomicBool>) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SessionGuard(Arc::clone(running)))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Synchronizes one account against a chain data source.
///
/// The store is shared behind a mutex so that other parts of an application may read it
/// while a session is running. Store calls and block scanning run on Tokio's blocking
/// thread pool.
pub struct SyncEngine<C, S, D> {
    config: SyncConfig,
    account: AccountId,
    birthday: AccountBirthday,
    client: C,
    store: Arc<Mutex<S>>,
    decoder: Arc<D>,
    pause: PauseHandle,
    running: Arc<AtomicBool>,
    status: Mutex<SyncStatus>,
}

impl<C, S, D> SyncEngine<C, S, D>
where
    C: ChainClient,
    S: NoteStoreWrite + Send + 'static,
    D: ActionDecoder + Send + Sync + 'static,
{
    /// Constructs an engine for `account`.
    ///
    /// `birthday` is used only if the account is not yet known to the store; an
    /// existing account keeps the birthday it was registered with.
    pub fn new(
        config: SyncConfig,
        account: AccountId,
        birthday: AccountBirthday,
        client: C,
        store: Arc<Mutex<S>>,
        decoder: D,
    ) -> Self {
        SyncEngine {
            config,
            account,
            birthday,
            client,
            store,
            decoder: Arc::new(decoder),
            pause: PauseHandle::default(),
            running: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns a handle that can pause sessions of this engine from another task.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Requests that the running session, if any, stop at the next step boundary.
    pub fn pause_syncing(&self) {
        self.pause.pause();
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the most recent status of this engine's account.
    pub fn get_sync_status(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawns a session on the current Tokio runtime.
    ///
    /// The session is registered before this returns, so a pause requested after this
    /// call stops the spawned session. If another session is in progress, the returned
    /// task resolves to [`SyncError::SyncAlreadyRunning`].
    pub fn start_syncing(
        self: &Arc<Self>,
        observer: Arc<dyn SyncObserver>,
    ) -> tokio::task::JoinHandle<Result<SyncOutcome, SyncError>>
    where
        C: 'static,
    {
        match self.begin_session() {
            Some(session) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.run_session(session, observer.as_ref()).await })
            }
            None => tokio::spawn(async { Err(SyncError::SyncAlreadyRunning) }),
        }
    }

    /// Runs a session to completion.
    ///
    /// Returns [`SyncError::SyncAlreadyRunning`] without notifying `observer` if another
    /// session of this engine is in progress.
    pub async fn run(&self, observer: &dyn SyncObserver) -> Result<SyncOutcome, SyncError> {
        let session = self.begin_session().ok_or(SyncError::SyncAlreadyRunning)?;
        self.run_session(session, observer).await
    }

    /// Marks the engine as running and clears any earlier pause request.
    fn begin_session(&self) -> Option<SessionGuard> {
        let session = SessionGuard::acquire(&self.running)?;
        self.pause.reset();
        Some(session)
    }

    #[tracing::instrument(skip_all, fields(account = %self.account))]
    async fn run_session(
        &self,
        _session: SessionGuard,
        observer: &dyn SyncObserver,
    ) -> Result<SyncOutcome, SyncError> {
        info!("Starting sync");
        observer.on_sync_start(&self.account);

        let mut state = SyncState::Uninitialized;
        loop {
            if self.pause.is_paused() {
                info!(state = state.name(), "Sync paused");
                observer.on_sync_stop(&self.account);
                return Ok(SyncOutcome::Paused);
            }

            trace!(?state, "Sync step");
            state = match self.step(state, observer).await {
                Ok(SyncState::CaughtUp { tip, .. }) => {
                    info!(%tip, "Sync caught up");
                    observer.on_sync_stop(&self.account);
                    return Ok(SyncOutcome::CaughtUp);
                }
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "Sync failed");
                    observer.on_sync_error(&self.account, &e);
                    return Err(e);
                }
            };
        }
    }

    async fn step(
        &self,
        state: SyncState,
        observer: &dyn SyncObserver,
    ) -> Result<SyncState, SyncError> {
        match state {
            SyncState::Uninitialized => {
                let latest = self
                    .client
                    .get_latest_block(self.config.chain_id())
                    .await
                    .map_err(|e| SyncError::FailedToUpdateChainTip(e.to_string()))?;
                let tip = latest.block_height().ok_or_else(|| {
                    SyncError::FailedToUpdateChainTip(format!(
                        "Chain tip height {} is out of range",
                        latest.height
                    ))
                })?;
                debug!(%tip, "Chain tip updated");
                self.update_status(observer, |s| s.set_chain_tip(tip));
                Ok(SyncState::TipKnown { tip })
            }

            SyncState::TipKnown { tip } => {
                let account = self.account.clone();
                let meta = self
                    .with_store(move |s| s.get_account_meta(&account))
                    .await
                    .map_err(SyncError::FailedToRetrieveAccount)?;
                match meta {
                    None => Ok(SyncState::Provisioning { tip }),
                    Some(meta) => {
                        let summary = self.spendable_summary().await?;
                        let scanned = meta.latest_scanned().map(|c| c.height());
                        self.update_status(observer, |s| {
                            s.set_last_scanned(scanned);
                            s.set_spendable(&summary);
                        });
                        Ok(SyncState::VerifyingChainState { tip, meta })
                    }
                }
            }

            SyncState::Provisioning { tip } => {
                let activation = self.config.orchard_activation_height();
                if self.birthday.height() < activation {
                    return Err(SyncError::FailedToInitAccount {
                        message: format!(
                            "Account birthday height {} is below the Orchard activation height {}",
                            self.birthday.height(),
                            activation
                        ),
                        retryable: false,
                    });
                }

                let account = self.account.clone();
                let birthday = self.birthday;
                let meta = self
                    .with_store(move |s| s.register_account(&account, &birthday))
                    .await
                    .map_err(|message| SyncError::FailedToInitAccount {
                        message,
                        retryable: true,
                    })?;
                info!(birthday = %meta.birthday().height(), "Registered account");

                let scanned = meta.latest_scanned().map(|c| c.height());
                self.update_status(observer, |s| s.set_last_scanned(scanned));
                Ok(SyncState::VerifyingChainState { tip, meta })
            }

            SyncState::VerifyingChainState { tip, meta } => {
                let birthday = *meta.birthday();
                match verification_for(tip, &meta, self.config.reorg_delta()) {
                    Verification::StartFromBirthday => Ok(SyncState::Scanning {
                        tip,
                        cursor: ScanCursor::new(birthday, None),
                    }),
                    Verification::ChainBehindCheckpoint { recovery_height } => {
                        warn!(
                            %tip,
                            checkpoint = ?meta.latest_scanned().map(|c| c.height()),
                            %recovery_height,
                            "Chain tip is below the account checkpoint"
                        );
                        Ok(SyncState::ReorgRecovery {
                            tip,
                            recovery_height,
                            birthday,
                        })
                    }
                    Verification::CompareHash(checkpoint) => {
                        let on_chain = self.chain_checkpoint(checkpoint.height()).await?;
                        if on_chain.hash() == checkpoint.hash() {
                            debug!(height = %checkpoint.height(), "Checkpoint is on the chain");
                            Ok(SyncState::Scanning {
                                tip,
                                cursor: ScanCursor::new(birthday, Some(checkpoint)),
                            })
                        } else {
                            let recovery_height = recovery_height_below(
                                checkpoint.height(),
                                self.config.reorg_delta(),
                                &birthday,
                            );
                            warn!(
                                height = %checkpoint.height(),
                                stored = %checkpoint.hash(),
                                chain = %on_chain.hash(),
                                %recovery_height,
                                "Checkpoint hash mismatch; chain reorg detected"
                            );
                            Ok(SyncState::ReorgRecovery {
                                tip,
                                recovery_height,
                                birthday,
                            })
                        }
                    }
                }
            }

            SyncState::ReorgRecovery {
                tip,
                recovery_height,
                birthday,
            } => self.recover_from_reorg(tip, recovery_height, birthday, observer).await,

            SyncState::Scanning { tip, cursor } => {
                match next_batch(cursor.height(), tip, self.config.batch_size()) {
                    None => {
                        let summary = self.spendable_summary().await?;
                        let scanned = cursor.height();
                        self.update_status(observer, |s| {
                            s.set_last_scanned(Some(scanned));
                            s.set_spendable(&summary);
                        });
                        Ok(SyncState::CaughtUp { tip, cursor })
                    }
                    Some((from, to)) => {
                        let blocks = self.download_blocks(from, to).await?;
                        Ok(SyncState::BlocksDownloaded {
                            tip,
                            cursor,
                            blocks: Arc::new(blocks),
                            attempt: 0,
                        })
                    }
                }
            }

            SyncState::BlocksDownloaded {
                tip,
                cursor,
                blocks,
                attempt,
            } => {
                let known = self.spendable_notes().await?;
                let decoder = Arc::clone(&self.decoder);
                let batch = Arc::clone(&blocks);
                let prior = cursor.position().copied();
                let scanned = tokio::task::spawn_blocking(move || {
                    scan_blocks(decoder.as_ref(), &known, &batch, prior.as_ref())
                })
                .await
                .map_err(|e| SyncError::ScannerError(format!("Scan task failed: {}", e)))?;

                match scanned {
                    Ok(result) => Ok(SyncState::BlocksScanned {
                        tip,
                        cursor,
                        blocks,
                        result,
                        attempt,
                    }),
                    // The first block of the batch does not extend the checkpoint, so the
                    // chain changed after the checkpoint was verified.
                    Err(e)
                        if e.is_continuity_error()
                            && e.at_height() == Some(cursor.height() + 1)
                            && cursor.height() > cursor.birthday().scan_floor() =>
                    {
                        let recovery_height = recovery_height_below(
                            cursor.height(),
                            self.config.reorg_delta(),
                            cursor.birthday(),
                        );
                        warn!(
                            error = %e,
                            %recovery_height,
                            "Downloaded blocks do not extend the checkpoint"
                        );
                        Ok(SyncState::ReorgRecovery {
                            tip,
                            recovery_height,
                            birthday: *cursor.birthday(),
                        })
                    }
                    Err(e) => Err(SyncError::ScannerError(e.to_string())),
                }
            }

            SyncState::BlocksScanned {
                tip,
                cursor,
                blocks,
                result,
                attempt,
            } => {
                let (notes, spent, scanned) = result.into_parts();
                let checkpoint = scanned.last().copied().ok_or_else(|| {
                    SyncError::ScannerError("Scan of a block batch produced no checkpoint".into())
                })?;
                let (note_count, spend_count) = (notes.len(), spent.len());

                let account = self.account.clone();
                let committed = self
                    .with_store(move |s| s.apply_scan_results(&account, &notes, &spent, &scanned))
                    .await;

                match committed {
                    Ok(()) => {
                        info!(
                            height = %checkpoint.height(),
                            notes = note_count,
                            spends = spend_count,
                            "Committed scan results"
                        );
                        let summary = self.spendable_summary().await?;
                        self.update_status(observer, |s| {
                            s.set_last_scanned(Some(checkpoint.height()));
                            s.set_spendable(&summary);
                        });
                        Ok(SyncState::Scanning {
                            tip,
                            cursor: ScanCursor::new(*cursor.birthday(), Some(checkpoint)),
                        })
                    }
                    Err(e) if attempt < self.config.max_commit_retries() => {
                        warn!(
                            error = %e,
                            attempt,
                            "Failed to commit scan results; rescanning batch"
                        );
                        Ok(SyncState::BlocksDownloaded {
                            tip,
                            cursor,
                            blocks,
                            attempt: attempt + 1,
                        })
                    }
                    Err(e) => Err(SyncError::FailedToUpdateDatabase(e)),
                }
            }

            caught_up @ SyncState::CaughtUp { .. } => Ok(caught_up),
        }
    }

    /// Rewinds the account to the highest block of its history at or below
    /// `recovery_height`, provided that block is still on the chain. Otherwise the reorg
    /// extends below `recovery_height`, which is lowered by another `reorg_delta` blocks.
    /// Rewinding to the account's scan floor is unconditional.
    async fn recover_from_reorg(
        &self,
        tip: BlockHeight,
        recovery_height: BlockHeight,
        birthday: AccountBirthday,
        observer: &dyn SyncObserver,
    ) -> Result<SyncState, SyncError> {
        let floor = birthday.scan_floor();
        let recovery_height = max(recovery_height, floor);

        let target = if recovery_height > floor {
            let account = self.account.clone();
            let stored = self
                .with_store(move |s| s.get_checkpoint_at_or_below(&account, recovery_height))
                .await
                .map_err(SyncError::FailedToRetrieveAccount)?;

            match stored {
                Some(stored) => {
                    let on_chain = self.chain_checkpoint(stored.height()).await?;
                    if on_chain.hash() != stored.hash() {
                        let lower = recovery_height_below(
                            recovery_height,
                            self.config.reorg_delta(),
                            &birthday,
                        );
                        warn!(
                            %recovery_height,
                            orphaned = %stored.height(),
                            next = %lower,
                            "Reorg extends below the recovery height"
                        );
                        return Ok(SyncState::ReorgRecovery {
                            tip,
                            recovery_height: lower,
                            birthday,
                        });
                    }
                    on_chain
                }
                None => {
                    debug!(%recovery_height, "No scanned block at or below the recovery height");
                    self.chain_checkpoint(floor).await?
                }
            }
        } else {
            self.chain_checkpoint(floor).await?
        };

        let account = self.account.clone();
        self.with_store(move |s| s.handle_chain_reorg(&account, &target))
            .await
            .map_err(SyncError::FailedToUpdateDatabase)?;
        info!(height = %target.height(), "Rewound account after chain reorg");

        let summary = self.spendable_summary().await?;
        self.update_status(observer, |s| {
            s.set_last_scanned(Some(target.height()));
            s.set_spendable(&summary);
        });

        Ok(SyncState::VerifyingChainState {
            tip,
            meta: AccountMeta::from_parts(birthday, Some(target)),
        })
    }

    /// Fetches the height and hash of the block at `height` on the chain.
    async fn chain_checkpoint(&self, height: BlockHeight) -> Result<Checkpoint, SyncError> {
        let treestate = self
            .client
            .get_tree_state(self.config.chain_id(), BlockId::from_height(height))
            .await
            .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?;
        let checkpoint = treestate
            .checkpoint()
            .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?;
        if checkpoint.height() != height {
            return Err(SyncError::FailedToReceiveTreeState(format!(
                "Requested the tree state at height {}, received height {}",
                height,
                checkpoint.height()
            )));
        }
        Ok(checkpoint)
    }

    async fn download_blocks(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<CompactBlock>, SyncError> {
        let blocks = self
            .client
            .get_compact_blocks(self.config.chain_id(), from, to)
            .await
            .map_err(|e| SyncError::FailedToDownloadBlocks(e.to_string()))?;

        let expected = u64::from(u32::from(to)) + 1 - u64::from(u32::from(from));
        let first = blocks.first().and_then(|b| b.height());
        let last = blocks.last().and_then(|b| b.height());
        if blocks.len() as u64 != expected || first != Some(from) || last != Some(to) {
            return Err(SyncError::FailedToDownloadBlocks(format!(
                "Requested blocks {}..={}, received {} blocks spanning {:?}..={:?}",
                from,
                to,
                blocks.len(),
                first,
                last
            )));
        }

        debug!(%from, %to, "Downloaded blocks");
        Ok(blocks)
    }

    async fn spendable_notes(&self) -> Result<Vec<DiscoveredNote>, SyncError> {
        let account = self.account.clone();
        self.with_store(move |s| s.get_spendable_notes(&account))
            .await
            .map_err(SyncError::FailedToRetrieveSpendableNotes)
    }

    async fn spendable_summary(&self) -> Result<SpendableSummary, SyncError> {
        let account = self.account.clone();
        self.with_store(move |s| spendable_summary(&*s, &account))
            .await
            .map_err(SyncError::FailedToRetrieveSpendableNotes)
    }

    /// Runs `f` against the store on the blocking thread pool.
    async fn with_store<T, E, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: FnOnce(&mut S) -> Result<T, E> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| "Note store lock is poisoned".to_string())?;
            f(&mut *store).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("Note store task failed: {}", e))?
    }

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, observer: &dyn SyncObserver, f: F) {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut status);
            status.clone()
        };
        observer.on_sync_status_update(&self.account, &snapshot);
    }
}
