//! Heuristic engine: turns one resolved transaction into cluster operations.
//!
//! Common-input ownership: every address spent as an input of the same
//! transaction is merged into one cluster. Outputs start clusters of their
//! own unless the configured change heuristic claims one of them for the
//! spender.

use tracing::{debug, warn};

use kinship_core::error::ClusterError;
use kinship_core::types::{Address, ClusterId, ResolvedTransaction};

use crate::change::{ChangeHeuristic, NoChange};
use crate::store::ClusterStore;

/// What applying one transaction did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    /// Cluster of the inputs after merging; an empty placeholder when no input resolved.
    pub spender: ClusterId,
    /// Output identified as change and merged into `spender`.
    pub change: Option<Address>,
    /// Cluster of each output, `None` for outputs without addresses.
    pub output_clusters: Vec<Option<ClusterId>>,
    /// Distinct input clusters merged away.
    pub merges: usize,
    /// Inputs the resolver could not dereference.
    pub skipped_inputs: usize,
}

/// Applies ownership heuristics to a [`ClusterStore`] it exclusively owns.
pub struct ClusterEngine {
    store: ClusterStore,
    change: Box<dyn ChangeHeuristic>,
}

impl Default for ClusterEngine {
    fn default() -> Self {
        Self::new(ClusterStore::new())
    }
}

impl ClusterEngine {
    /// Engine over `store` with change detection disabled.
    pub fn new(store: ClusterStore) -> Self {
        Self {
            store,
            change: Box::new(NoChange),
        }
    }

    /// Replace the change heuristic.
    pub fn with_change(mut self, change: Box<dyn ChangeHeuristic>) -> Self {
        self.change = change;
        self
    }

    /// Read access to the store.
    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    /// Mutable access to the store, e.g. for labelling.
    pub fn store_mut(&mut self) -> &mut ClusterStore {
        &mut self.store
    }

    /// Give up the engine and keep the store.
    pub fn into_store(self) -> ClusterStore {
        self.store
    }

    /// Apply the heuristics to one transaction.
    ///
    /// Transactions must be applied in ledger order. An error means the
    /// store was asked about an identity it never minted.
    pub fn apply(&mut self, tx: &ResolvedTransaction) -> Result<TxOutcome, ClusterError> {
        let store = &mut self.store;

        // Common-input ownership: fold every input cluster into the first one.
        let mut target: Option<ClusterId> = None;
        let mut merges = 0;
        for address in tx.input_addresses() {
            let cluster = if store.contains(address) {
                store.find(address)?
            } else {
                store.new_cluster(address)
            };
            target = Some(match target {
                None => cluster,
                Some(t) => {
                    let current = store.representative(t)?;
                    if current == cluster {
                        current
                    } else {
                        merges += 1;
                        store.union(current, cluster)?
                    }
                }
            });
        }
        let mut spender = match target {
            Some(t) => t,
            None => store.mint(),
        };

        // Inputs become direct members of the merged cluster.
        for address in tx.input_addresses() {
            store.find(address)?;
        }

        let change = self
            .change
            .identify_change(tx, store)
            .filter(|candidate| {
                let present = tx.pays_to(candidate);
                if !present {
                    warn!(txid = %tx.txid, %candidate, "change heuristic picked a non-output; ignored");
                }
                present
            });
        let change_output = change
            .as_ref()
            .and_then(|c| tx.outputs.iter().position(|group| group.contains(c)));

        let mut output_clusters = Vec::with_capacity(tx.outputs.len());
        for (index, group) in tx.outputs.iter().enumerate() {
            let Some((first, rest)) = group.split_first() else {
                output_clusters.push(None);
                continue;
            };
            let cluster = if change_output == Some(index) {
                for address in group {
                    spender = store.assign(address, spender)?;
                }
                spender
            } else {
                let mut cluster = store.new_cluster(first);
                for address in rest {
                    cluster = store.assign(address, cluster)?;
                }
                cluster
            };
            output_clusters.push(Some(cluster));
        }

        // Later outputs may have merged earlier ones; report representatives.
        let spender = store.representative(spender)?;
        for slot in output_clusters.iter_mut().flatten() {
            *slot = store.representative(*slot)?;
        }

        debug!(
            txid = %tx.txid,
            spender = %spender,
            merges,
            skipped = tx.skipped_inputs,
            change = change.is_some(),
            "applied transaction"
        );

        Ok(TxOutcome {
            spender,
            change,
            output_clusters,
            merges,
            skipped_inputs: tx.skipped_inputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::FreshOutputChange;
    use kinship_core::types::Hash256;

    fn a(s: &str) -> Address {
        Address::from(s)
    }

    fn tx(inputs: &[&str], outputs: &[&str]) -> ResolvedTransaction {
        ResolvedTransaction {
            txid: Hash256::ZERO,
            inputs: inputs.iter().map(|s| vec![a(s)]).collect(),
            outputs: outputs.iter().map(|s| vec![a(s)]).collect(),
            skipped_inputs: 0,
        }
    }

    /// Always claims the given address as change.
    struct Fixed(&'static str);

    impl ChangeHeuristic for Fixed {
        fn identify_change(&self, _tx: &ResolvedTransaction, _store: &ClusterStore) -> Option<Address> {
            Some(a(self.0))
        }
    }

    fn same(engine: &mut ClusterEngine, x: &str, y: &str) -> bool {
        let store = engine.store_mut();
        store.find(&a(x)).unwrap() == store.find(&a(y)).unwrap()
    }

    #[test]
    fn inputs_merge_outputs_stay_apart() {
        let mut engine = ClusterEngine::default();
        let out = engine.apply(&tx(&["A", "B"], &["C", "D"])).unwrap();

        assert!(same(&mut engine, "A", "B"));
        assert!(!same(&mut engine, "A", "C"));
        assert!(!same(&mut engine, "C", "D"));
        assert_eq!(engine.store().cluster_count(), 3);
        assert_eq!(out.merges, 1);
        assert_eq!(out.output_clusters.len(), 2);
        assert_ne!(out.output_clusters[0], Some(out.spender));
    }

    #[test]
    fn later_spend_merges_earlier_clusters() {
        let mut engine = ClusterEngine::default();
        engine.apply(&tx(&["A", "B"], &["C", "D"])).unwrap();
        let out = engine.apply(&tx(&["C", "A"], &[])).unwrap();

        assert!(same(&mut engine, "A", "C"));
        assert!(same(&mut engine, "B", "C"));
        assert!(!same(&mut engine, "A", "D"));
        assert_eq!(engine.store().cluster_count(), 2);
        assert_eq!(out.merges, 1);
    }

    #[test]
    fn single_input_single_output_not_merged() {
        let mut engine = ClusterEngine::default();
        engine.apply(&tx(&["A"], &["B"])).unwrap();
        assert!(!same(&mut engine, "A", "B"));
        assert_eq!(engine.store().cluster_count(), 2);
    }

    #[test]
    fn self_spend_creates_no_duplicate() {
        let mut engine = ClusterEngine::default();
        let out = engine.apply(&tx(&["A"], &["A", "B"])).unwrap();
        assert_eq!(out.output_clusters[0], Some(out.spender));
        assert_eq!(engine.store().address_count(), 2);
        assert_eq!(engine.store().identity_count(), 2);
    }

    #[test]
    fn zero_inputs_mint_a_placeholder() {
        let mut engine = ClusterEngine::default();
        let out = engine.apply(&tx(&[], &["M"])).unwrap();
        assert_eq!(engine.store().identity_count(), 2);
        assert_eq!(engine.store().member_count(out.spender).unwrap(), 0);
        assert_eq!(engine.store().cluster_count(), 1);
        assert_ne!(out.output_clusters[0], Some(out.spender));
    }

    #[test]
    fn change_output_joins_spender() {
        let mut engine = ClusterEngine::default().with_change(Box::new(Fixed("E")));
        let out = engine.apply(&tx(&["K1", "K2"], &["E", "F"])).unwrap();
        assert_eq!(out.change, Some(a("E")));
        assert!(same(&mut engine, "K1", "E"));
        assert!(!same(&mut engine, "K1", "F"));
        assert_eq!(out.output_clusters[0], Some(out.spender));
    }

    #[test]
    fn change_not_among_outputs_is_ignored() {
        let mut engine = ClusterEngine::default().with_change(Box::new(Fixed("elsewhere")));
        let out = engine.apply(&tx(&["A"], &["B"])).unwrap();
        assert_eq!(out.change, None);
        assert!(!engine.store().contains(&a("elsewhere")));
        assert!(!same(&mut engine, "A", "B"));
    }

    #[test]
    fn change_on_placeholder_spender() {
        let mut engine = ClusterEngine::default().with_change(Box::new(Fixed("E")));
        let out = engine.apply(&tx(&[], &["E", "F"])).unwrap();
        assert_eq!(engine.store().member_count(out.spender).unwrap(), 1);
        assert_eq!(engine.store().cluster_count(), 2);
    }

    #[test]
    fn multisig_output_shares_one_cluster() {
        let mut engine = ClusterEngine::default();
        let t = ResolvedTransaction {
            txid: Hash256::ZERO,
            inputs: vec![vec![a("A")]],
            outputs: vec![vec![a("M1"), a("M2")], vec![]],
            skipped_inputs: 0,
        };
        let out = engine.apply(&t).unwrap();
        assert!(same(&mut engine, "M1", "M2"));
        assert!(!same(&mut engine, "A", "M1"));
        assert_eq!(out.output_clusters[1], None);
    }

    #[test]
    fn multisig_input_merges_all_signers() {
        let mut engine = ClusterEngine::default();
        let t = ResolvedTransaction {
            txid: Hash256::ZERO,
            inputs: vec![vec![a("S1"), a("S2")], vec![a("S3")]],
            outputs: vec![],
            skipped_inputs: 1,
        };
        let out = engine.apply(&t).unwrap();
        assert!(same(&mut engine, "S1", "S3"));
        assert!(same(&mut engine, "S2", "S3"));
        assert_eq!(out.skipped_inputs, 1);
    }

    #[test]
    fn transitive_merging_across_transactions() {
        let mut engine = ClusterEngine::default();
        engine.apply(&tx(&["X", "Y"], &[])).unwrap();
        engine.apply(&tx(&["Y", "Z"], &[])).unwrap();
        assert!(same(&mut engine, "X", "Z"));
        assert_eq!(engine.store().cluster_count(), 1);
    }

    #[test]
    fn fresh_output_change_end_to_end() {
        let mut engine = ClusterEngine::default().with_change(Box::new(FreshOutputChange));
        engine.apply(&tx(&[], &["A"])).unwrap();
        engine.apply(&tx(&[], &["shop"])).unwrap();
        let out = engine.apply(&tx(&["A"], &["shop", "fresh"])).unwrap();
        assert_eq!(out.change, Some(a("fresh")));
        assert!(same(&mut engine, "A", "fresh"));
        assert!(!same(&mut engine, "A", "shop"));
    }

    #[test]
    fn spender_is_reported_as_representative() {
        let mut engine = ClusterEngine::default();
        engine.apply(&tx(&[], &["big1"])).unwrap();
        engine.apply(&tx(&["big1"], &["big2"])).unwrap();
        engine.apply(&tx(&["big1", "big2"], &[])).unwrap();
        let out = engine.apply(&tx(&["solo", "big1"], &[])).unwrap();
        let rep = engine.store_mut().find(&a("solo")).unwrap();
        assert_eq!(out.spender, rep);
    }
}
