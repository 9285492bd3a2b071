//! Error types for address clustering.
use thiserror::Error;

use crate::types::{Address, ClusterId};

/// Cluster store misuse. Always a bug in the caller, never a data condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("unknown address: {0}")] UnknownAddress(Address),
    #[error("unknown cluster: {0}")] UnknownCluster(ClusterId),
    #[error("corrupt snapshot: {0}")] CorruptSnapshot(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not found: {0}")] NotFound(String),
    #[error("transient: {0}")] Transient(String),
    #[error("timeout")] Timeout,
    #[error("malformed ledger data: {0}")] Malformed(String),
    #[error("ledger source unavailable: {0}")] Unavailable(String),
}

impl LedgerError {
    /// A single lookup failing this way is skipped, not fatal to the run.
    pub fn is_skippable(&self) -> bool {
        !matches!(self, LedgerError::Unavailable(_))
    }

    /// Worth another attempt before giving up on the lookup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_) | LedgerError::Timeout)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid script hex: {0}")] InvalidHex(String),
    #[error("unsupported script: {0}")] Unsupported(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database: {0}")] Database(String),
    #[error("encoding: {0}")] Encoding(String),
    #[error("missing column family: {0}")] MissingColumnFamily(String),
}

#[derive(Error, Debug)]
pub enum KinshipError {
    #[error(transparent)] Cluster(#[from] ClusterError),
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error(transparent)] Decode(#[from] DecodeError),
    #[error(transparent)] Storage(#[from] StorageError),
}
