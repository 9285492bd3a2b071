//! # kinship-cluster: address clustering engine.
//!
//! - **Cluster store**: a disjoint-set forest over cluster identities with
//!   path compression on `find` and union-by-size on `union`. Absorbed
//!   identities stay valid as forwarding aliases; member lists are
//!   materialized on demand rather than maintained per merge.
//! - **Heuristic engine**: applies the common-input-ownership heuristic to
//!   one resolved transaction at a time, plus an optional change heuristic.
//! - **Change heuristics**: pluggable; disabled by default.

pub mod change;
pub mod engine;
pub mod store;

pub use change::{ChangeHeuristic, ChangeMode, FreshOutputChange, NoChange};
pub use engine::{ClusterEngine, TxOutcome};
pub use store::{ClusterStore, StoreSnapshot};
