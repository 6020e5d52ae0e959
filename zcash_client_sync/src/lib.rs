//! *An Orchard shielded-pool sync engine for Zcash light clients.*
//!
//! `zcash_client_sync` incrementally synchronizes a single Orchard account against a
//! remote chain data source. It detects chain reorganizations, trial-decrypts compact
//! blocks to discover the account's notes, tracks which of those notes have been spent,
//! and persists a sync checkpoint after every committed batch of blocks.
//!
//! The crate is organized around a small number of seams:
//!
//! - [`rpc::ChainClient`] is the remote chain data source (usually a `lightwalletd`
//!   server). Only its interface is defined here.
//! - [`scanning::ActionDecoder`] is the trial-decryption capability used by the pure
//!   block scanner in [`scanning::scan_blocks`].
//! - [`data_api::NoteStoreWrite`] is the durable store for notes, spent markers and sync
//!   checkpoints. [`data_api::mem_store::MemoryNoteStore`] is an in-memory
//!   implementation; the `zcash_client_sync_sqlite` crate provides an SQLite one.
//! - [`sync::SyncEngine`] drives the sync state machine and reports progress to a
//!   [`sync::SyncObserver`].
//!
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod block;
pub mod data_api;
pub mod proto;
pub mod rpc;
pub mod scanning;
pub mod sync;
pub mod wallet;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

#[cfg(feature = "orchard")]
pub mod decrypt;

pub use block::BlockHash;
pub use wallet::{AccountBirthday, AccountId, AccountMeta, DiscoveredNote, Nullifier, SpentMarker};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
