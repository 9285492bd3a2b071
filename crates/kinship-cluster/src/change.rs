//! Change-address heuristics.
//!
//! A change heuristic picks at most one output of a transaction as the
//! spender's own change. The engine only trusts a pick that actually
//! appears among the transaction's outputs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use kinship_core::types::{Address, ResolvedTransaction};

use crate::store::ClusterStore;

/// Decides whether one output of a transaction returns change to the spender.
pub trait ChangeHeuristic: Send + Sync {
    /// The change address, if one is identified.
    ///
    /// Called before the transaction's outputs are registered, so `store`
    /// reflects what was known prior to this transaction's outputs.
    fn identify_change(&self, tx: &ResolvedTransaction, store: &ClusterStore) -> Option<Address>;
}

/// Never identifies change.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChange;

impl ChangeHeuristic for NoChange {
    fn identify_change(&self, _tx: &ResolvedTransaction, _store: &ClusterStore) -> Option<Address> {
        None
    }
}

/// Address-reuse avoidance: wallets send change to a fresh address.
///
/// With two or more outputs, none paying back to an input address, and
/// exactly one output whose addresses have never been observed, that output
/// is the change.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshOutputChange;

impl ChangeHeuristic for FreshOutputChange {
    fn identify_change(&self, tx: &ResolvedTransaction, store: &ClusterStore) -> Option<Address> {
        if tx.outputs.len() < 2 || tx.inputs.is_empty() {
            return None;
        }
        if tx
            .output_addresses()
            .any(|out| tx.input_addresses().any(|inp| inp == out))
        {
            return None;
        }

        let mut fresh = tx
            .outputs
            .iter()
            .filter(|group| !group.is_empty() && group.iter().all(|a| !store.contains(a)));
        let candidate = fresh.next()?;
        if fresh.next().is_some() {
            return None;
        }
        candidate.first().cloned()
    }
}

/// Configured change heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeMode {
    /// [`NoChange`].
    #[default]
    None,
    /// [`FreshOutputChange`].
    FreshOutput,
}

impl ChangeMode {
    /// Instantiate the heuristic.
    pub fn heuristic(self) -> Box<dyn ChangeHeuristic> {
        match self {
            ChangeMode::None => Box::new(NoChange),
            ChangeMode::FreshOutput => Box::new(FreshOutputChange),
        }
    }
}

impl fmt::Display for ChangeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeMode::None => f.write_str("none"),
            ChangeMode::FreshOutput => f.write_str("fresh-output"),
        }
    }
}

impl FromStr for ChangeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ChangeMode::None),
            "fresh-output" => Ok(ChangeMode::FreshOutput),
            other => Err(format!("unknown change heuristic: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinship_core::types::Hash256;

    fn tx(inputs: &[&[&str]], outputs: &[&[&str]]) -> ResolvedTransaction {
        let groups = |g: &[&[&str]]| -> Vec<Vec<Address>> {
            g.iter()
                .map(|grp| grp.iter().map(|a| Address::from(*a)).collect())
                .collect()
        };
        ResolvedTransaction {
            txid: Hash256::ZERO,
            inputs: groups(inputs),
            outputs: groups(outputs),
            skipped_inputs: 0,
        }
    }

    fn store_with(known: &[&str]) -> ClusterStore {
        let mut store = ClusterStore::new();
        for a in known {
            store.new_cluster(&Address::from(*a));
        }
        store
    }

    #[test]
    fn no_change_never_picks() {
        let store = store_with(&["a", "shop"]);
        let t = tx(&[&["a"]], &[&["shop"], &["fresh"]]);
        assert_eq!(NoChange.identify_change(&t, &store), None);
    }

    #[test]
    fn fresh_output_picks_the_single_unseen_output() {
        let store = store_with(&["a", "shop"]);
        let t = tx(&[&["a"]], &[&["shop"], &["fresh"]]);
        assert_eq!(
            FreshOutputChange.identify_change(&t, &store),
            Some(Address::from("fresh"))
        );
    }

    #[test]
    fn fresh_output_ambiguous_when_two_unseen() {
        let store = store_with(&["a"]);
        let t = tx(&[&["a"]], &[&["x"], &["y"]]);
        assert_eq!(FreshOutputChange.identify_change(&t, &store), None);
    }

    #[test]
    fn fresh_output_needs_two_outputs() {
        let store = store_with(&["a"]);
        let t = tx(&[&["a"]], &[&["x"]]);
        assert_eq!(FreshOutputChange.identify_change(&t, &store), None);
    }

    #[test]
    fn fresh_output_skips_coinbase_like_transactions() {
        let store = store_with(&["shop"]);
        let t = tx(&[], &[&["shop"], &["fresh"]]);
        assert_eq!(FreshOutputChange.identify_change(&t, &store), None);
    }

    #[test]
    fn fresh_output_defers_to_address_reuse() {
        let store = store_with(&["a"]);
        let t = tx(&[&["a"]], &[&["a"], &["fresh"]]);
        assert_eq!(FreshOutputChange.identify_change(&t, &store), None);
    }

    #[test]
    fn pick_is_always_an_output() {
        let store = store_with(&["a", "shop"]);
        let t = tx(&[&["a"]], &[&["shop"], &["m1", "m2"]]);
        let picked = FreshOutputChange.identify_change(&t, &store).unwrap();
        assert!(t.pays_to(&picked));
    }

    #[test]
    fn mode_parse_and_display() {
        for mode in [ChangeMode::None, ChangeMode::FreshOutput] {
            assert_eq!(mode.to_string().parse::<ChangeMode>().unwrap(), mode);
        }
        assert!("largest".parse::<ChangeMode>().is_err());
        assert_eq!(ChangeMode::default(), ChangeMode::None);
    }
}
