//! Disjoint-set cluster store.
//!
//! Addresses point at a cluster identity; identities form a forest whose
//! roots are the current representatives. `find` compresses paths and
//! re-points the address at the root, `union` attaches the smaller set under
//! the larger one (ties keep the smaller identity). Together these keep the
//! amortized cost per operation near constant.
//!
//! Identities are dense `u64`s handed out in order. An absorbed identity is
//! never reused: it remains a forwarding alias to its survivor.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use kinship_core::error::ClusterError;
use kinship_core::types::{Address, ClusterId, ClusterRecord};

/// Flattened, self-contained store state for persistence and resume.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Representative of every identity ever minted, indexed by identity.
    pub forwards: Vec<ClusterId>,
    /// Custom labels, keyed by representative.
    pub labels: Vec<(ClusterId, String)>,
    /// Every observed address with its representative, sorted by address.
    pub addresses: Vec<(Address, ClusterId)>,
}

/// In-memory address clusters.
#[derive(Debug, Default, Clone)]
pub struct ClusterStore {
    /// Address to an identity in its set; the representative after `find`.
    addresses: HashMap<Address, ClusterId>,
    /// Identity forest. `parent[i] == i` marks a representative.
    parent: Vec<ClusterId>,
    /// Member count, meaningful at representatives only.
    size: Vec<u64>,
    /// Custom labels, keyed by representative.
    labels: HashMap<ClusterId, String>,
    /// Representatives with at least one member.
    live: usize,
}

impl ClusterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current representative cluster of a known address.
    pub fn find(&mut self, address: &Address) -> Result<ClusterId, ClusterError> {
        let id = match self.addresses.get(address) {
            Some(id) => *id,
            None => return Err(ClusterError::UnknownAddress(address.clone())),
        };
        let root = self.root(id)?;
        if root != id {
            if let Some(slot) = self.addresses.get_mut(address) {
                *slot = root;
            }
        }
        Ok(root)
    }

    /// Cluster of `address`, allocating a fresh one if the address is unseen.
    ///
    /// Idempotent: a known address gets its current representative back.
    pub fn new_cluster(&mut self, address: &Address) -> ClusterId {
        if let Ok(id) = self.find(address) {
            return id;
        }
        let id = self.allocate(1);
        self.addresses.insert(address.clone(), id);
        trace!(%address, cluster = %id, "new cluster");
        id
    }

    /// Allocate an empty identity, e.g. a spender with no resolvable inputs.
    pub fn mint(&mut self) -> ClusterId {
        self.allocate(0)
    }

    /// Merge the clusters of `a` and `b`, returning the survivor.
    ///
    /// The larger set survives; on equal sizes the smaller identity does.
    /// The absorbed identity forwards to the survivor from then on.
    pub fn union(&mut self, a: ClusterId, b: ClusterId) -> Result<ClusterId, ClusterError> {
        let ra = self.root(a)?;
        let rb = self.root(b)?;
        if ra == rb {
            return Ok(ra);
        }

        let (size_a, size_b) = (self.size[ra.index()], self.size[rb.index()]);
        let (keep, absorb) = if size_a > size_b || (size_a == size_b && ra < rb) {
            (ra, rb)
        } else {
            (rb, ra)
        };

        self.parent[absorb.index()] = keep;
        if size_a > 0 && size_b > 0 {
            self.live -= 1;
        }
        self.size[keep.index()] = size_a + size_b;

        if let Some(label) = self.labels.remove(&absorb) {
            self.labels.entry(keep).or_insert(label);
        }

        trace!(keep = %keep, absorb = %absorb, "union");
        Ok(keep)
    }

    /// Attach `address` to `cluster`.
    ///
    /// An unseen address becomes a direct member. A known address has its
    /// current cluster merged with `cluster`. Returns the resulting representative.
    pub fn assign(&mut self, address: &Address, cluster: ClusterId) -> Result<ClusterId, ClusterError> {
        let target = self.root(cluster)?;
        if self.addresses.contains_key(address) {
            let current = self.find(address)?;
            return self.union(current, target);
        }

        self.addresses.insert(address.clone(), target);
        let size = &mut self.size[target.index()];
        if *size == 0 {
            self.live += 1;
        }
        *size += 1;
        Ok(target)
    }

    /// Current representative of an identity.
    pub fn representative(&mut self, cluster: ClusterId) -> Result<ClusterId, ClusterError> {
        self.root(cluster)
    }

    /// Whether `address` has been observed.
    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains_key(address)
    }

    /// Number of observed addresses.
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    /// Number of identities ever minted, including aliases and empty placeholders.
    pub fn identity_count(&self) -> usize {
        self.parent.len()
    }

    /// Number of non-empty clusters.
    pub fn cluster_count(&self) -> usize {
        self.live
    }

    /// Number of addresses in the cluster of `cluster`.
    pub fn member_count(&self, cluster: ClusterId) -> Result<u64, ClusterError> {
        let root = self.root_of(cluster)?;
        Ok(self.size[root.index()])
    }

    /// Label of the cluster of `cluster`.
    pub fn label(&self, cluster: ClusterId) -> Result<String, ClusterError> {
        let root = self.root_of(cluster)?;
        Ok(self
            .labels
            .get(&root)
            .cloned()
            .unwrap_or_else(|| root.default_label()))
    }

    /// Override the label of the cluster of `cluster`.
    pub fn set_label(&mut self, cluster: ClusterId, label: impl Into<String>) -> Result<(), ClusterError> {
        let root = self.root(cluster)?;
        self.labels.insert(root, label.into());
        Ok(())
    }

    /// Members of the cluster of `cluster`, sorted.
    pub fn members_of(&self, cluster: ClusterId) -> Result<Vec<Address>, ClusterError> {
        let root = self.root_of(cluster)?;
        let mut members = Vec::new();
        for (address, id) in &self.addresses {
            if self.root_of(*id)? == root {
                members.push(address.clone());
            }
        }
        members.sort();
        Ok(members)
    }

    /// Every non-empty cluster, ordered by identity, members sorted.
    pub fn partition(&self) -> Result<Vec<ClusterRecord>, ClusterError> {
        let mut groups: BTreeMap<ClusterId, Vec<Address>> = BTreeMap::new();
        for (address, id) in &self.addresses {
            groups
                .entry(self.root_of(*id)?)
                .or_default()
                .push(address.clone());
        }

        Ok(groups
            .into_iter()
            .map(|(id, mut members)| {
                members.sort();
                ClusterRecord {
                    id,
                    label: self
                        .labels
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| id.default_label()),
                    members,
                }
            })
            .collect())
    }

    /// Flattened copy of the store state.
    pub fn snapshot(&self) -> Result<StoreSnapshot, ClusterError> {
        let forwards = (0..self.parent.len() as u64)
            .map(|i| self.root_of(ClusterId(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut labels: Vec<(ClusterId, String)> =
            self.labels.iter().map(|(id, l)| (*id, l.clone())).collect();
        labels.sort();

        let mut addresses = Vec::with_capacity(self.addresses.len());
        for (address, id) in &self.addresses {
            addresses.push((address.clone(), forwards[id.index()]));
        }
        addresses.sort();

        Ok(StoreSnapshot {
            forwards,
            labels,
            addresses,
        })
    }

    /// Rebuild a store from a snapshot.
    ///
    /// The snapshot must be flat: every forward and every address points at
    /// an identity that is its own representative.
    pub fn restore(snapshot: StoreSnapshot) -> Result<Self, ClusterError> {
        let len = snapshot.forwards.len();
        let is_root = |id: ClusterId| id.index() < len && snapshot.forwards[id.index()] == id;

        for (i, fwd) in snapshot.forwards.iter().enumerate() {
            if !is_root(*fwd) {
                return Err(ClusterError::CorruptSnapshot(format!(
                    "identity {i} forwards to non-representative {fwd}"
                )));
            }
        }

        let mut size = vec![0u64; len];
        let mut addresses = HashMap::with_capacity(snapshot.addresses.len());
        for (address, id) in snapshot.addresses {
            if !is_root(id) {
                return Err(ClusterError::CorruptSnapshot(format!(
                    "address {address} points at non-representative {id}"
                )));
            }
            size[id.index()] += 1;
            if addresses.insert(address.clone(), id).is_some() {
                return Err(ClusterError::CorruptSnapshot(format!(
                    "address {address} listed twice"
                )));
            }
        }

        let mut labels = HashMap::with_capacity(snapshot.labels.len());
        for (id, label) in snapshot.labels {
            if !is_root(id) {
                return Err(ClusterError::CorruptSnapshot(format!(
                    "label on non-representative {id}"
                )));
            }
            labels.insert(id, label);
        }

        let live = size.iter().filter(|s| **s > 0).count();
        Ok(Self {
            addresses,
            parent: snapshot.forwards,
            size,
            labels,
            live,
        })
    }

    fn allocate(&mut self, members: u64) -> ClusterId {
        let id = ClusterId(self.parent.len() as u64);
        self.parent.push(id);
        self.size.push(members);
        if members > 0 {
            self.live += 1;
        }
        id
    }

    /// Representative of `id` with full path compression.
    fn root(&mut self, id: ClusterId) -> Result<ClusterId, ClusterError> {
        let root = self.root_of(id)?;
        let mut cur = id;
        while cur != root {
            let next = self.parent[cur.index()];
            self.parent[cur.index()] = root;
            cur = next;
        }
        Ok(root)
    }

    /// Representative of `id` without mutating the forest.
    fn root_of(&self, id: ClusterId) -> Result<ClusterId, ClusterError> {
        if id.index() >= self.parent.len() {
            return Err(ClusterError::UnknownCluster(id));
        }
        let mut cur = id;
        loop {
            let next = self.parent[cur.index()];
            if next == cur {
                return Ok(cur);
            }
            cur = next;
        }
    }
}
