//! Shared test helpers: an in-memory ledger with failure injection and
//! builders for synthetic chains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use kinship_cluster::{ClusterEngine, ClusterStore};
use kinship_core::error::LedgerError;
use kinship_core::traits::LedgerSource;
use kinship_core::types::*;
use kinship_ingest::{LedgerWalker, NodeScriptDecoder, WalkerConfig};

/// Address from a string literal.
pub fn addr(s: &str) -> Address {
    Address::from(s)
}

/// Distinct txid per counter value.
pub fn txid(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    Hash256(bytes)
}

/// Output paying `addrs`; more than one address models a multisig script.
pub fn pay_to(addrs: &[&str]) -> TxOutput {
    TxOutput {
        value: 1_000,
        script_pubkey: ScriptPubKey {
            hex: "51".into(),
            addresses: addrs.iter().map(|a| addr(a)).collect(),
        },
    }
}

/// Provably unspendable output with no owner.
pub fn null_data() -> TxOutput {
    TxOutput {
        value: 0,
        script_pubkey: ScriptPubKey {
            hex: "6a0568656c6c6f".into(),
            addresses: vec![],
        },
    }
}

/// Resolved transaction with one address per input and output group.
pub fn resolved(inputs: &[&str], outputs: &[&str]) -> ResolvedTransaction {
    ResolvedTransaction {
        txid: Hash256::ZERO,
        inputs: inputs.iter().map(|a| vec![addr(a)]).collect(),
        outputs: outputs.iter().map(|a| vec![addr(a)]).collect(),
        skipped_inputs: 0,
    }
}

/// Whether `x` and `y` are in the same cluster.
pub fn same_cluster(store: &mut ClusterStore, x: &str, y: &str) -> bool {
    store.find(&addr(x)).unwrap() == store.find(&addr(y)).unwrap()
}

/// Builds a chain one block at a time.
#[derive(Default)]
pub struct ChainBuilder {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
    next_txid: u64,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a coinbase paying `address`; returns the spendable outpoint.
    pub fn fund(&mut self, address: &str) -> OutPoint {
        let id = self.push(vec![TxInput::coinbase()], vec![pay_to(&[address])]);
        OutPoint { txid: id, index: 0 }
    }

    /// Spend `inputs` to one single-address output per entry of `outputs`.
    pub fn spend(&mut self, inputs: &[OutPoint], outputs: &[&str]) -> Vec<OutPoint> {
        let outs = outputs.iter().map(|a| pay_to(&[*a])).collect();
        let id = self.spend_outputs(inputs, outs);
        (0..outputs.len() as u32)
            .map(|index| OutPoint { txid: id, index })
            .collect()
    }

    /// Spend `inputs` to arbitrary outputs; returns the txid.
    pub fn spend_outputs(&mut self, inputs: &[OutPoint], outputs: Vec<TxOutput>) -> Hash256 {
        let inputs = inputs
            .iter()
            .map(|op| TxInput::spending(op.txid, op.index))
            .collect();
        self.push(inputs, outputs)
    }

    /// Close the current block.
    pub fn seal(&mut self) -> &mut Self {
        let height = self.blocks.len() as u64;
        self.blocks.push(Block {
            height,
            hash: txid(u64::MAX - height),
            transactions: std::mem::take(&mut self.pending),
        });
        self
    }

    /// Seal any pending transactions and hand the chain to a ledger.
    pub fn build(mut self) -> MemoryLedger {
        if !self.pending.is_empty() {
            self.seal();
        }
        MemoryLedger::new(self.blocks)
    }

    fn push(&mut self, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Hash256 {
        self.next_txid += 1;
        let id = txid(self.next_txid);
        self.pending.push(Transaction {
            txid: id,
            inputs,
            outputs,
        });
        id
    }
}

/// In-memory [`LedgerSource`] with injectable failures.
pub struct MemoryLedger {
    blocks: Vec<Block>,
    transactions: HashMap<Hash256, Transaction>,
    block_failures: Mutex<HashMap<u64, LedgerError>>,
    tx_failures: Mutex<HashMap<Hash256, LedgerError>>,
    lookups: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(blocks: Vec<Block>) -> Self {
        let transactions = blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .map(|tx| (tx.txid, tx.clone()))
            .collect();
        Self {
            blocks,
            transactions,
            block_failures: Mutex::new(HashMap::new()),
            tx_failures: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Make every fetch of the block at `height` fail with `err`.
    pub fn fail_block(&self, height: u64, err: LedgerError) {
        self.block_failures.lock().insert(height, err);
    }

    /// Make every lookup of `txid` fail with `err`.
    pub fn fail_transaction(&self, txid: Hash256, err: LedgerError) {
        self.tx_failures.lock().insert(txid, err);
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        self.block_failures.lock().clear();
        self.tx_failures.lock().clear();
    }

    /// Transaction lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn tip(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }
}

#[async_trait]
impl LedgerSource for MemoryLedger {
    async fn height(&self) -> Result<u64, LedgerError> {
        Ok(self.tip())
    }

    async fn block_at(&self, height: u64) -> Result<Block, LedgerError> {
        if let Some(err) = self.block_failures.lock().get(&height) {
            return Err(err.clone());
        }
        self.blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("block at height {height}")))
    }

    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, LedgerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.tx_failures.lock().get(txid) {
            return Err(err.clone());
        }
        self.transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {txid}")))
    }
}

/// Walker config with short timeouts and checkpoints disabled.
pub fn fast_config() -> WalkerConfig {
    WalkerConfig {
        fetch_timeout: Duration::from_millis(500),
        max_retries: 1,
        retry_backoff: Duration::from_millis(1),
        checkpoint_interval: 0,
        ..WalkerConfig::default()
    }
}

/// Walker over `ledger` with the node-annotation decoder.
pub fn walker(
    ledger: Arc<MemoryLedger>,
    engine: ClusterEngine,
) -> LedgerWalker<MemoryLedger, NodeScriptDecoder> {
    LedgerWalker::new(ledger, Arc::new(NodeScriptDecoder), engine, fast_config())
}

/// A shutdown channel that has not fired.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Member sets of every non-empty cluster, ignoring identities and labels.
pub fn groups(store: &ClusterStore) -> Vec<Vec<Address>> {
    let mut groups: Vec<Vec<Address>> = store
        .partition()
        .unwrap()
        .into_iter()
        .map(|record| record.members)
        .collect();
    groups.sort();
    groups
}
