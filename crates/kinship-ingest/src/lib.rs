//! # kinship-ingest: ledger replay and persistence.
//!
//! Feeds a ledger into the clustering engine and stores the result:
//! - [`walker::LedgerWalker`]: height-ordered replay with input resolution
//! - [`rpc::RpcLedgerSource`]: bitcoind-compatible JSON-RPC ledger source
//! - [`decoder::NodeScriptDecoder`]: addresses from node-annotated scripts
//! - [`storage::ClusterIndex`]: RocksDB snapshot store and point lookups
//! - [`config::IngestConfig`]: layered configuration

pub mod config;
pub mod decoder;
pub mod rpc;
pub mod storage;
pub mod walker;

pub use config::IngestConfig;
pub use decoder::NodeScriptDecoder;
pub use rpc::RpcLedgerSource;
pub use storage::ClusterIndex;
pub use walker::{LedgerWalker, RunSummary, WalkError, WalkerConfig};
