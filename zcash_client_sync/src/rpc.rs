//! The interface to a remote source of chain data.
//!
//! Implementations typically wrap a `CompactTxStreamer` gRPC client connected to a
//! `lightwalletd` server. Timeouts and retry policies for individual requests are the
//! responsibility of the implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use zcash_protocol::consensus::BlockHeight;

use crate::proto::{
    compact_formats::CompactBlock,
    service::{BlockId, TreeState},
};

/// A source of chain data for a single sync session.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The error type produced by this client.
    type Error: fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Returns the height and hash of the current chain tip of the given chain.
    async fn get_latest_block(&self, chain_id: &str) -> Result<BlockId, Self::Error>;

    /// Returns the note commitment tree state as of the end of the identified block.
    async fn get_tree_state(&self, chain_id: &str, block: BlockId)
        -> Result<TreeState, Self::Error>;

    /// Returns the compact blocks in the inclusive range `[from, to]`, in ascending
    /// height order.
    async fn get_compact_blocks(
        &self,
        chain_id: &str,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<CompactBlock>, Self::Error>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    type Error = T::Error;

    async fn get_latest_block(&self, chain_id: &str) -> Result<BlockId, Self::Error> {
        (**self).get_latest_block(chain_id).await
    }

    async fn get_tree_state(
        &self,
        chain_id: &str,
        block: BlockId,
    ) -> Result<TreeState, Self::Error> {
        (**self).get_tree_state(chain_id, block).await
    }

    async fn get_compact_blocks(
        &self,
        chain_id: &str,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<CompactBlock>, Self::Error> {
        (**self).get_compact_blocks(chain_id, from, to).await
    }
}
