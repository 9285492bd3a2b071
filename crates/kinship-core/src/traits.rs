//! Trait interfaces for the collaborators of the clustering engine.
//!
//! - [`LedgerSource`]: blocks and transactions by reference (kinship-ingest implements over JSON-RPC)
//! - [`ScriptDecoder`]: locking script to canonical addresses

use async_trait::async_trait;

use crate::constants::Network;
use crate::error::{DecodeError, LedgerError};
use crate::types::{Address, Block, Hash256, ScriptPubKey, Transaction};

/// Read-only access to a ledger.
///
/// Implementations may be called concurrently for transaction lookups; the
/// walker only ever asks for blocks in increasing height order.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Height of the current ledger tip.
    async fn height(&self) -> Result<u64, LedgerError>;

    /// The block at `height`, transactions in ledger order.
    async fn block_at(&self, height: u64) -> Result<Block, LedgerError>;

    /// A confirmed transaction by ID. Used to dereference spent outputs.
    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, LedgerError>;
}

/// Turns a locking script into the addresses that own it.
///
/// A script may yield zero addresses (null-data, non-standard), one, or
/// several (bare multi-signature).
pub trait ScriptDecoder: Send + Sync {
    fn decode_addresses(
        &self,
        script: &ScriptPubKey,
        network: Network,
    ) -> Result<Vec<Address>, DecodeError>;
}
