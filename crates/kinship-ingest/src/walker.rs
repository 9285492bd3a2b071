//! Ledger walker: replays the ledger in height order through the engine.
//!
//! Input addresses are resolved by dereferencing the spent outputs, first
//! from an in-run output cache and otherwise through the ledger source.
//! Lookups for one transaction run concurrently on a [`JoinSet`] bounded by
//! a semaphore; the engine itself is only touched from the walker's task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use kinship_cluster::{ClusterEngine, ClusterStore};
use kinship_core::constants::{
    Network, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_MAX_CONCURRENT_LOOKUPS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS,
};
use kinship_core::error::{ClusterError, KinshipError, LedgerError};
use kinship_core::traits::{LedgerSource, ScriptDecoder};
use kinship_core::types::{Address, OutPoint, ResolvedTransaction, Transaction};

use crate::config::IngestConfig;

/// Tuning for a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerConfig {
    pub network: Network,
    /// Upper bound for a single ledger request.
    pub fetch_timeout: Duration,
    /// Extra attempts after a transient failure or timeout.
    pub max_retries: u32,
    /// Delay before the first retry; grows linearly per attempt.
    pub retry_backoff: Duration,
    pub max_concurrent_lookups: usize,
    /// Blocks between checkpoint callbacks; 0 disables them.
    pub checkpoint_interval: u64,
    /// Upper bound on cached unspent outputs.
    pub output_cache_limit: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            output_cache_limit: 1_000_000,
        }
    }
}

impl From<&IngestConfig> for WalkerConfig {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            network: cfg.network,
            fetch_timeout: cfg.fetch_timeout(),
            max_retries: cfg.max_retries,
            retry_backoff: cfg.retry_backoff(),
            max_concurrent_lookups: cfg.max_concurrent_lookups.max(1),
            checkpoint_interval: cfg.checkpoint_interval,
            output_cache_limit: cfg.output_cache_limit,
        }
    }
}

/// Outcome of one walk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// First height this run applied.
    pub start_height: u64,
    /// First height not applied; where the next run resumes.
    pub next_height: u64,
    pub blocks: u64,
    pub transactions: u64,
    /// Inputs whose previous output could not be resolved.
    pub skipped_inputs: u64,
    /// Outputs whose script could not be decoded.
    pub skipped_outputs: u64,
    /// Non-empty clusters after the run.
    pub clusters: usize,
    /// Distinct addresses after the run.
    pub addresses: usize,
    /// Stopped by the shutdown signal before reaching the end height.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("ledger source unavailable at height {height}: {source}")]
    UpstreamUnavailable { height: u64, source: LedgerError },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("checkpoint before height {height} failed: {source}")]
    Checkpoint { height: u64, source: KinshipError },
}

impl WalkError {
    /// Height a later run should resume from, when the failure is external.
    pub fn resume_height(&self) -> Option<u64> {
        match self {
            WalkError::UpstreamUnavailable { height, .. } | WalkError::Checkpoint { height, .. } => {
                Some(*height)
            }
            WalkError::Cluster(_) => None,
        }
    }
}

/// Replays blocks from a [`LedgerSource`] into a [`ClusterEngine`].
pub struct LedgerWalker<L, D> {
    source: Arc<L>,
    decoder: Arc<D>,
    engine: ClusterEngine,
    config: WalkerConfig,
    /// Unspent outputs seen this run; removed when spent.
    outputs: HashMap<OutPoint, Vec<Address>>,
    next_height: u64,
}

impl<L, D> LedgerWalker<L, D>
where
    L: LedgerSource + 'static,
    D: ScriptDecoder + 'static,
{
    /// Walker starting at height 0.
    pub fn new(source: Arc<L>, decoder: Arc<D>, engine: ClusterEngine, config: WalkerConfig) -> Self {
        Self {
            source,
            decoder,
            engine,
            config,
            outputs: HashMap::new(),
            next_height: 0,
        }
    }

    /// Resume at `height`, e.g. from a persisted checkpoint.
    pub fn starting_at(mut self, height: u64) -> Self {
        self.next_height = height;
        self
    }

    pub fn engine(&self) -> &ClusterEngine {
        &self.engine
    }

    pub fn into_engine(self) -> ClusterEngine {
        self.engine
    }

    /// First height not yet applied.
    pub fn next_height(&self) -> u64 {
        self.next_height
    }

    /// Walk up to `end` inclusive, or the tip at start when `None`.
    pub async fn run(
        &mut self,
        end: Option<u64>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, WalkError> {
        self.run_with_checkpoints(end, shutdown, |_, _| Ok(())).await
    }

    /// Like [`run`](Self::run), calling `checkpoint` with the store and the
    /// resume height every `checkpoint_interval` blocks.
    pub async fn run_with_checkpoints<F>(
        &mut self,
        end: Option<u64>,
        shutdown: watch::Receiver<bool>,
        mut checkpoint: F,
    ) -> Result<RunSummary, WalkError>
    where
        F: FnMut(&ClusterStore, u64) -> Result<(), KinshipError>,
    {
        let started_at = Utc::now();
        let start_height = self.next_height;

        let tip = match end {
            Some(end) => end,
            None => {
                let source = &self.source;
                fetch_with_retry(&self.config, || source.height())
                    .await
                    .map_err(|source| WalkError::UpstreamUnavailable {
                        height: start_height,
                        source,
                    })?
            }
        };
        info!(from = start_height, to = tip, "starting ledger walk");

        let mut blocks = 0u64;
        let mut transactions = 0u64;
        let mut skipped_inputs = 0u64;
        let mut skipped_outputs = 0u64;
        let mut cancelled = false;

        while self.next_height <= tip {
            if *shutdown.borrow() {
                info!(height = self.next_height, "shutdown requested; stopping at block boundary");
                cancelled = true;
                break;
            }

            let height = self.next_height;
            let source = &self.source;
            let block = fetch_with_retry(&self.config, || source.block_at(height))
                .await
                .map_err(|source| WalkError::UpstreamUnavailable { height, source })?;

            for tx in &block.transactions {
                let (resolved, undecoded) = self
                    .resolve(tx)
                    .await
                    .map_err(|source| WalkError::UpstreamUnavailable { height, source })?;
                self.engine.apply(&resolved)?;
                self.cache_outputs(&resolved);

                transactions += 1;
                skipped_inputs += resolved.skipped_inputs as u64;
                skipped_outputs += undecoded;
            }

            self.next_height = height + 1;
            blocks += 1;
            debug!(height, txs = block.transactions.len(), "applied block");

            if self.config.checkpoint_interval > 0 && blocks % self.config.checkpoint_interval == 0 {
                checkpoint(self.engine.store(), self.next_height).map_err(|source| {
                    WalkError::Checkpoint {
                        height: self.next_height,
                        source,
                    }
                })?;
                info!(
                    next_height = self.next_height,
                    clusters = self.engine.store().cluster_count(),
                    "checkpoint written"
                );
            }
        }

        let store = self.engine.store();
        let summary = RunSummary {
            start_height,
            next_height: self.next_height,
            blocks,
            transactions,
            skipped_inputs,
            skipped_outputs,
            clusters: store.cluster_count(),
            addresses: store.address_count(),
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            blocks,
            transactions,
            skipped_inputs,
            clusters = summary.clusters,
            cancelled,
            "ledger walk finished"
        );
        Ok(summary)
    }

    /// Resolve input and output addresses of `tx`.
    ///
    /// Returns the resolved transaction and the number of outputs that could
    /// not be decoded. Only an unavailable source is an error.
    async fn resolve(&mut self, tx: &Transaction) -> Result<(ResolvedTransaction, u64), LedgerError> {
        let mut slots: Vec<Option<Vec<Address>>> = vec![None; tx.inputs.len()];
        let mut pending = Vec::new();
        if tx.is_coinbase() {
            debug!(txid = %tx.txid, "coinbase; no inputs to resolve");
        } else {
            for (slot, input) in tx.inputs.iter().enumerate() {
                let Some(outpoint) = input.previous_output else {
                    continue;
                };
                match self.outputs.remove(&outpoint) {
                    Some(group) => slots[slot] = Some(group),
                    None => pending.push((slot, outpoint)),
                }
            }
        }

        let mut skipped = 0;
        if !pending.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_lookups.max(1)));
            let mut lookups = JoinSet::new();
            for (slot, outpoint) in pending {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
                let source = Arc::clone(&self.source);
                let decoder = Arc::clone(&self.decoder);
                let config = self.config;
                lookups.spawn(async move {
                    let _permit = permit;
                    (slot, outpoint, lookup_output(&*source, &*decoder, &config, outpoint).await)
                });
            }

            while let Some(joined) = lookups.join_next().await {
                match joined {
                    Ok((slot, _, Ok(group))) => slots[slot] = Some(group),
                    Ok((_, _, Err(KinshipError::Ledger(e)))) if !e.is_skippable() => return Err(e),
                    Ok((_, outpoint, Err(e))) => {
                        warn!(txid = %tx.txid, %outpoint, error = %e, "skipping unresolved input");
                        skipped += 1;
                    }
                    Err(e) => {
                        warn!(txid = %tx.txid, error = %e, "input lookup task failed");
                        skipped += 1;
                    }
                }
            }
        }

        let mut undecoded = 0;
        let outputs = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                match self.decoder.decode_addresses(&output.script_pubkey, self.config.network) {
                    Ok(group) => group,
                    Err(e) => {
                        warn!(txid = %tx.txid, index, error = %e, "skipping undecodable output");
                        undecoded += 1;
                        Vec::new()
                    }
                }
            })
            .collect();

        let resolved = ResolvedTransaction {
            txid: tx.txid,
            inputs: slots.into_iter().flatten().collect(),
            outputs,
            skipped_inputs: skipped,
        };
        Ok((resolved, undecoded))
    }

    fn cache_outputs(&mut self, tx: &ResolvedTransaction) {
        for (index, group) in tx.outputs.iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            if self.outputs.len() >= self.config.output_cache_limit {
                break;
            }
            let outpoint = OutPoint {
                txid: tx.txid,
                index: index as u32,
            };
            self.outputs.insert(outpoint, group.clone());
        }
    }
}

/// Dereference `outpoint` to the addresses of the output it names.
async fn lookup_output<L, D>(
    source: &L,
    decoder: &D,
    config: &WalkerConfig,
    outpoint: OutPoint,
) -> Result<Vec<Address>, KinshipError>
where
    L: LedgerSource + ?Sized,
    D: ScriptDecoder + ?Sized,
{
    let prev = fetch_with_retry(config, || source.transaction(&outpoint.txid)).await?;
    let output = prev
        .output(outpoint.index)
        .ok_or_else(|| LedgerError::NotFound(format!("output {outpoint}")))?;
    Ok(decoder.decode_addresses(&output.script_pubkey, config.network)?)
}

/// Run `request` under the fetch timeout, retrying transient failures
/// with linear backoff.
async fn fetch_with_retry<T, F, Fut>(config: &WalkerConfig, mut request: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(config.fetch_timeout, request()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        };
        match result {
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                debug!(attempt, error = %e, "retrying ledger request");
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            other => return other,
        }
    }
}
