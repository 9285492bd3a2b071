//! End-to-end and property tests for kinship.
//!
//! Scenarios replay small synthetic ledgers through the walker, engine and
//! RocksDB index together; property tests check the partition invariants
//! under random transaction streams.

pub mod helpers;
