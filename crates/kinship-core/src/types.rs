//! Core types: ledger transactions and blocks, addresses, cluster identities.
//!
//! Ledger types carry only what clustering needs. Values are in satoshis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 32-byte hash value, used for transaction IDs and block hashes.
///
/// Bytes are kept in display order, so `Display` and `FromStr` round-trip
/// the hex string the ledger node reports.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash.
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The output being spent. `None` for a coinbase input.
    pub previous_output: Option<OutPoint>,
}

impl TxInput {
    /// Input spending `txid:index`.
    pub fn spending(txid: Hash256, index: u32) -> Self {
        Self {
            previous_output: Some(OutPoint { txid, index }),
        }
    }

    /// Coinbase input, which references no previous output.
    pub fn coinbase() -> Self {
        Self {
            previous_output: None,
        }
    }
}

/// Locking script of an output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ScriptPubKey {
    /// Raw script bytes, hex encoded.
    pub hex: String,
    /// Addresses the ledger node already derived from the script, if any.
    pub addresses: Vec<Address>,
}

/// A transaction output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: ScriptPubKey,
}

/// A ledger transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction ID.
    pub txid: Hash256,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Check if this is a coinbase transaction (every input lacks a reference).
    pub fn is_coinbase(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|i| i.previous_output.is_none())
    }

    /// Output at `index`, if present.
    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.get(index as usize)
    }
}

/// A block: height, hash, and transactions in ledger order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Height in the ledger.
    pub height: u64,
    /// Block hash.
    pub hash: Hash256,
    /// Transactions in intra-block order.
    pub transactions: Vec<Transaction>,
}

/// Canonical address string. Equality is exact string equality.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap a canonical address string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address bytes, as used for storage keys.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable cluster identity. Allocated sequentially, never reused.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl ClusterId {
    /// Index into dense per-identity tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Label used when none has been set.
    pub fn default_label(self) -> String {
        format!("Cluster {}", self.0)
    }

    /// Big-endian key bytes, so storage iteration follows identity order.
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction with its addresses already resolved.
///
/// Each entry of `inputs` and `outputs` is the address group of one input or
/// output; a multi-signature script yields several addresses in one group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ResolvedTransaction {
    /// Transaction ID.
    pub txid: Hash256,
    /// Address groups of the inputs that could be resolved, in input order.
    pub inputs: Vec<Vec<Address>>,
    /// Address groups of the outputs, in output order.
    pub outputs: Vec<Vec<Address>>,
    /// Inputs whose previous output could not be resolved.
    pub skipped_inputs: usize,
}

impl ResolvedTransaction {
    /// All input addresses, flattened in input order.
    pub fn input_addresses(&self) -> impl Iterator<Item = &Address> {
        self.inputs.iter().flatten()
    }

    /// All output addresses, flattened in output order.
    pub fn output_addresses(&self) -> impl Iterator<Item = &Address> {
        self.outputs.iter().flatten()
    }

    /// Whether `address` appears among the outputs.
    pub fn pays_to(&self, address: &Address) -> bool {
        self.output_addresses().any(|a| a == address)
    }
}

/// A materialized non-empty cluster.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterRecord {
    /// Representative identity.
    pub id: ClusterId,
    /// Human-readable label.
    pub label: String,
    /// Member addresses, sorted.
    pub members: Vec<Address>,
}

/// Answer to a point lookup: which cluster an address belongs to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Label of the cluster.
    pub cluster_name: String,
    /// Total members in the cluster.
    pub cluster_member_count: u64,
    /// One-based page of `cluster_members`.
    pub cluster_page: usize,
    /// Members on this page.
    pub cluster_members: Vec<Address>,
}
