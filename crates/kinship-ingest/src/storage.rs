//! RocksDB-backed cluster index.
//!
//! Persists a flattened [`StoreSnapshot`] in column families and serves
//! point lookups after a run:
//!
//! - `addresses`: address → representative id
//! - `members`: representative id (BE) ‖ address → ()
//! - `clusters`: representative id → label and member count (non-empty only)
//! - `forwards`: every minted id → its representative, for resuming
//! - `labels`: custom labels by representative
//! - `metadata`: resume height, identity count, last run summary
//!
//! Every persist replaces the previous snapshot in one atomic [`WriteBatch`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, SliceTransform, WriteBatch, DB};
use tracing::info;

use kinship_cluster::{ClusterStore, StoreSnapshot};
use kinship_core::constants::MEMBER_PAGE_SIZE;
use kinship_core::error::{KinshipError, StorageError};
use kinship_core::types::{Address, ClusterId, ClusterInfo, ClusterRecord};

use crate::walker::RunSummary;

// --- Column family names ---

const CF_ADDRESSES: &str = "addresses";
const CF_MEMBERS: &str = "members";
const CF_CLUSTERS: &str = "clusters";
const CF_FORWARDS: &str = "forwards";
const CF_LABELS: &str = "labels";
const CF_METADATA: &str = "metadata";

/// Column families rewritten by every snapshot.
const SNAPSHOT_CFS: &[&str] = &[CF_ADDRESSES, CF_MEMBERS, CF_CLUSTERS, CF_FORWARDS, CF_LABELS];

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_ADDRESSES,
    CF_MEMBERS,
    CF_CLUSTERS,
    CF_FORWARDS,
    CF_LABELS,
    CF_METADATA,
];

// --- Metadata keys ---

const META_NEXT_HEIGHT: &[u8] = b"next_height";
const META_IDENTITY_COUNT: &[u8] = b"identity_count";
const META_LAST_RUN: &[u8] = b"last_run";

/// Exclusive upper bound for range deletes. No key starts with `0xff`:
/// addresses are ASCII and identities stay far below 2^56.
const KEY_CEILING: [u8; 16] = [0xff; 16];

/// Per-cluster row in `clusters`.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
struct ClusterMeta {
    label: String,
    member_count: u64,
}

/// Durable cluster membership with point lookups.
pub struct ClusterIndex {
    db: DB,
}

impl ClusterIndex {
    /// Open or create the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Members are scanned by the 8-byte cluster id prefix.
                if *name == CF_MEMBERS {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(8));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(Self { db })
    }

    /// Replace the stored state with `snapshot`, resuming at `next_height`.
    pub fn persist(&self, snapshot: &StoreSnapshot, next_height: u64) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for name in SNAPSHOT_CFS {
            let cf = self.cf_handle(name)?;
            batch.delete_range_cf(cf, b"".as_slice(), KEY_CEILING.as_slice());
        }

        let cf_forwards = self.cf_handle(CF_FORWARDS)?;
        for (i, fwd) in snapshot.forwards.iter().enumerate() {
            batch.put_cf(cf_forwards, ClusterId(i as u64).to_key(), fwd.to_key());
        }

        let cf_labels = self.cf_handle(CF_LABELS)?;
        let labels: HashMap<ClusterId, &str> = snapshot
            .labels
            .iter()
            .map(|(id, label)| (*id, label.as_str()))
            .collect();
        for (id, label) in &labels {
            batch.put_cf(cf_labels, id.to_key(), label.as_bytes());
        }

        let cf_addresses = self.cf_handle(CF_ADDRESSES)?;
        let cf_members = self.cf_handle(CF_MEMBERS)?;
        let mut counts: BTreeMap<ClusterId, u64> = BTreeMap::new();
        for (address, id) in &snapshot.addresses {
            batch.put_cf(cf_addresses, address.as_bytes(), id.to_key());
            batch.put_cf(cf_members, Self::member_key(*id, address), b"");
            *counts.entry(*id).or_default() += 1;
        }

        let cf_clusters = self.cf_handle(CF_CLUSTERS)?;
        for (id, member_count) in &counts {
            let meta = ClusterMeta {
                label: labels
                    .get(id)
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| id.default_label()),
                member_count: *member_count,
            };
            batch.put_cf(cf_clusters, id.to_key(), Self::encode(&meta)?);
        }

        let cf_meta = self.cf_handle(CF_METADATA)?;
        batch.put_cf(cf_meta, META_NEXT_HEIGHT, next_height.to_le_bytes());
        batch.put_cf(
            cf_meta,
            META_IDENTITY_COUNT,
            (snapshot.forwards.len() as u64).to_le_bytes(),
        );

        self.db
            .write(batch)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        info!(
            next_height,
            clusters = counts.len(),
            addresses = snapshot.addresses.len(),
            "persisted cluster snapshot"
        );
        Ok(())
    }

    /// Snapshot `store` and persist it.
    pub fn checkpoint(&self, store: &ClusterStore, next_height: u64) -> Result<(), KinshipError> {
        let snapshot = store.snapshot()?;
        self.persist(&snapshot, next_height)?;
        Ok(())
    }

    /// Rebuild the stored cluster state and its resume height, if any was persisted.
    pub fn load(&self) -> Result<Option<(ClusterStore, u64)>, StorageError> {
        let Some(next_height) = self.next_height()? else {
            return Ok(None);
        };

        let mut forwards = Vec::new();
        for item in self.db.iterator_cf(self.cf_handle(CF_FORWARDS)?, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            let id = Self::decode_id(&key)?;
            if id.index() != forwards.len() {
                return Err(StorageError::Encoding(format!(
                    "identity gap: expected {}, found {id}",
                    forwards.len()
                )));
            }
            forwards.push(Self::decode_id(&value)?);
        }

        let mut labels = Vec::new();
        for item in self.db.iterator_cf(self.cf_handle(CF_LABELS)?, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            let label = String::from_utf8(value.into_vec())
                .map_err(|e| StorageError::Encoding(e.to_string()))?;
            labels.push((Self::decode_id(&key)?, label));
        }

        let mut addresses = Vec::new();
        for item in self.db.iterator_cf(self.cf_handle(CF_ADDRESSES)?, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            addresses.push((Self::decode_address(&key)?, Self::decode_id(&value)?));
        }

        let store = ClusterStore::restore(StoreSnapshot {
            forwards,
            labels,
            addresses,
        })
        .map_err(|e| StorageError::Encoding(e.to_string()))?;
        Ok(Some((store, next_height)))
    }

    /// Cluster of `address` with one page of its members. Pages start at 1.
    pub fn lookup(&self, address: &Address, page: usize) -> Result<Option<ClusterInfo>, StorageError> {
        let page = page.max(1);
        let Some(raw) = self
            .db
            .get_cf(self.cf_handle(CF_ADDRESSES)?, address.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let id = Self::decode_id(&raw)?;
        let meta = self.cluster_meta(id)?;
        let skip = (page - 1).saturating_mul(MEMBER_PAGE_SIZE);
        let members = self.members(id, skip, MEMBER_PAGE_SIZE)?;

        Ok(Some(ClusterInfo {
            cluster_name: meta.label,
            cluster_member_count: meta.member_count,
            cluster_page: page,
            cluster_members: members,
        }))
    }

    /// Rename the cluster holding `address` and persist it at the stored
    /// resume height. `None` when the address is not indexed.
    pub fn set_label(&self, address: &Address, label: &str) -> Result<Option<ClusterId>, KinshipError> {
        let Some((mut store, next_height)) = self.load()? else {
            return Ok(None);
        };
        if !store.contains(address) {
            return Ok(None);
        }
        let id = store.find(address)?;
        store.set_label(id, label)?;
        self.checkpoint(&store, next_height)?;
        info!(cluster = %id, label, "cluster relabelled");
        Ok(Some(id))
    }

    /// Non-empty clusters in identity order, with all members.
    pub fn clusters(&self, limit: Option<usize>) -> Result<Vec<ClusterRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.db.iterator_cf(self.cf_handle(CF_CLUSTERS)?, IteratorMode::Start) {
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            let id = Self::decode_id(&key)?;
            let meta: ClusterMeta = Self::decode(&value)?;
            records.push(ClusterRecord {
                id,
                label: meta.label,
                members: self.members(id, 0, usize::MAX)?,
            });
        }
        Ok(records)
    }

    /// Height the next run should start at, if a snapshot exists.
    pub fn next_height(&self) -> Result<Option<u64>, StorageError> {
        self.get_meta_u64(META_NEXT_HEIGHT)
    }

    /// Identities minted so far, if a snapshot exists.
    pub fn identity_count(&self) -> Result<Option<u64>, StorageError> {
        self.get_meta_u64(META_IDENTITY_COUNT)
    }

    /// Record the summary of a finished run.
    pub fn record_run(&self, summary: &RunSummary) -> Result<(), StorageError> {
        let json = serde_json::to_vec(summary).map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.db
            .put_cf(self.cf_handle(CF_METADATA)?, META_LAST_RUN, json)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    /// Summary of the last recorded run.
    pub fn last_run(&self) -> Result<Option<RunSummary>, StorageError> {
        match self
            .db
            .get_cf(self.cf_handle(CF_METADATA)?, META_LAST_RUN)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string())),
            None => Ok(None),
        }
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    // --- Private helpers ---

    fn cluster_meta(&self, id: ClusterId) -> Result<ClusterMeta, StorageError> {
        let bytes = self
            .db
            .get_cf(self.cf_handle(CF_CLUSTERS)?, id.to_key())
            .map_err(|e| StorageError::Database(e.to_string()))?
            .ok_or_else(|| StorageError::Encoding(format!("address points at missing cluster {id}")))?;
        Self::decode(&bytes)
    }

    fn members(&self, id: ClusterId, skip: usize, take: usize) -> Result<Vec<Address>, StorageError> {
        let prefix = id.to_key();
        let mut members = Vec::new();
        for item in self
            .db
            .prefix_iterator_cf(self.cf_handle(CF_MEMBERS)?, prefix)
            .skip(skip)
        {
            if members.len() >= take {
                break;
            }
            let (key, _) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            // The prefix iterator may run past the prefix.
            if !key.starts_with(&prefix) {
                break;
            }
            members.push(Self::decode_address(&key[prefix.len()..])?);
        }
        Ok(members)
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        match self
            .db
            .get_cf(self.cf_handle(CF_METADATA)?, key)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Encoding("invalid metadata value length".into()))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::MissingColumnFamily(name.to_string()))
    }

    /// Member key: cluster id (BE) ‖ address bytes.
    fn member_key(id: ClusterId, address: &Address) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + address.as_bytes().len());
        key.extend_from_slice(&id.to_key());
        key.extend_from_slice(address.as_bytes());
        key
    }

    fn decode_id(bytes: &[u8]) -> Result<ClusterId, StorageError> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StorageError::Encoding(format!("invalid cluster id length {}", bytes.len())))?;
        Ok(ClusterId(u64::from_be_bytes(arr)))
    }

    fn decode_address(bytes: &[u8]) -> Result<Address, StorageError> {
        std::str::from_utf8(bytes)
            .map(Address::from)
            .map_err(|e| StorageError::Encoding(e.to_string()))
    }

    fn encode(meta: &ClusterMeta) -> Result<Vec<u8>, StorageError> {
        bincode::encode_to_vec(meta, bincode::config::standard())
            .map_err(|e| StorageError::Encoding(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<ClusterMeta, StorageError> {
        let (meta, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::from(s)
    }

    fn sample_store() -> ClusterStore {
        let mut store = ClusterStore::new();
        let a = store.new_cluster(&addr("A"));
        let b = store.new_cluster(&addr("B"));
        store.union(a, b).unwrap();
        store.new_cluster(&addr("C"));
        store.mint();
        store
    }

    fn open() -> (tempfile::TempDir, ClusterIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = ClusterIndex::open(dir.path().join("clusters")).unwrap();
        (dir, index)
    }

    #[test]
    fn empty_index_has_nothing() {
        let (_dir, index) = open();
        assert_eq!(index.next_height().unwrap(), None);
        assert!(index.load().unwrap().is_none());
        assert!(index.lookup(&addr("A"), 1).unwrap().is_none());
        assert!(index.clusters(None).unwrap().is_empty());
    }

    #[test]
    fn lookup_after_persist() {
        let (_dir, index) = open();
        index.checkpoint(&sample_store(), 7).unwrap();

        let info = index.lookup(&addr("B"), 1).unwrap().unwrap();
        assert_eq!(info.cluster_name, "Cluster 0");
        assert_eq!(info.cluster_member_count, 2);
        assert_eq!(info.cluster_page, 1);
        assert_eq!(info.cluster_members, vec![addr("A"), addr("B")]);
        assert!(index.lookup(&addr("Z"), 1).unwrap().is_none());
        assert_eq!(index.next_height().unwrap(), Some(7));
        assert_eq!(index.identity_count().unwrap(), Some(4));
    }

    #[test]
    fn clusters_lists_non_empty_only() {
        let (_dir, index) = open();
        index.checkpoint(&sample_store(), 1).unwrap();
        let records = index.clusters(None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].members, vec![addr("C")]);
        assert_eq!(index.clusters(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn load_restores_partition() {
        let (_dir, index) = open();
        let mut store = sample_store();
        store.set_label(ClusterId(2), "faucet").unwrap();
        index.checkpoint(&store, 12).unwrap();

        let (mut loaded, next) = index.load().unwrap().unwrap();
        assert_eq!(next, 12);
        assert_eq!(loaded.partition().unwrap(), store.partition().unwrap());
        assert_eq!(loaded.identity_count(), 4);
        assert_eq!(loaded.label(ClusterId(2)).unwrap(), "faucet");
        assert_eq!(loaded.new_cluster(&addr("D")), ClusterId(4));
    }

    #[test]
    fn persist_replaces_previous_snapshot() {
        let (_dir, index) = open();
        let mut store = sample_store();
        index.checkpoint(&store, 1).unwrap();

        let c = store.find(&addr("C")).unwrap();
        let a = store.find(&addr("A")).unwrap();
        store.union(c, a).unwrap();
        index.checkpoint(&store, 2).unwrap();

        assert_eq!(index.clusters(None).unwrap().len(), 1);
        let info = index.lookup(&addr("C"), 1).unwrap().unwrap();
        assert_eq!(info.cluster_member_count, 3);
        assert_eq!(info.cluster_members.len(), 3);
    }

    #[test]
    fn lookup_pages_members() {
        let (_dir, index) = open();
        let mut store = ClusterStore::new();
        let root = store.new_cluster(&addr("m000"));
        for i in 1..250 {
            store.assign(&addr(&format!("m{i:03}")), root).unwrap();
        }
        index.checkpoint(&store, 1).unwrap();

        let first = index.lookup(&addr("m007"), 1).unwrap().unwrap();
        assert_eq!(first.cluster_member_count, 250);
        assert_eq!(first.cluster_members.len(), MEMBER_PAGE_SIZE);
        assert_eq!(first.cluster_members[0], addr("m000"));

        let third = index.lookup(&addr("m007"), 3).unwrap().unwrap();
        assert_eq!(third.cluster_page, 3);
        assert_eq!(third.cluster_members.len(), 50);
        assert_eq!(third.cluster_members[0], addr("m200"));

        let beyond = index.lookup(&addr("m007"), 9).unwrap().unwrap();
        assert!(beyond.cluster_members.is_empty());
    }

    #[test]
    fn page_zero_is_first_page() {
        let (_dir, index) = open();
        index.checkpoint(&sample_store(), 1).unwrap();
        assert_eq!(index.lookup(&addr("A"), 0).unwrap().unwrap().cluster_page, 1);
    }

    #[test]
    fn huge_page_is_empty_not_overflow() {
        let (_dir, index) = open();
        index.checkpoint(&sample_store(), 1).unwrap();
        let info = index.lookup(&addr("A"), usize::MAX).unwrap().unwrap();
        assert_eq!(info.cluster_page, usize::MAX);
        assert_eq!(info.cluster_member_count, 2);
        assert!(info.cluster_members.is_empty());
    }

    #[test]
    fn set_label_renames_cluster_of_address() {
        let (_dir, index) = open();
        index.checkpoint(&sample_store(), 9).unwrap();

        assert_eq!(index.set_label(&addr("B"), "exchange").unwrap(), Some(ClusterId(0)));
        let info = index.lookup(&addr("A"), 1).unwrap().unwrap();
        assert_eq!(info.cluster_name, "exchange");
        assert_eq!(index.clusters(None).unwrap()[1].label, "Cluster 2");
        assert_eq!(index.next_height().unwrap(), Some(9));

        let (loaded, _) = index.load().unwrap().unwrap();
        assert_eq!(loaded.label(ClusterId(0)).unwrap(), "exchange");
    }

    #[test]
    fn set_label_of_unknown_address_is_none() {
        let (_dir, index) = open();
        assert_eq!(index.set_label(&addr("A"), "x").unwrap(), None);
        index.checkpoint(&sample_store(), 1).unwrap();
        assert_eq!(index.set_label(&addr("Z"), "x").unwrap(), None);
        assert_eq!(index.clusters(None).unwrap()[0].label, "Cluster 0");
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters");
        {
            let index = ClusterIndex::open(&path).unwrap();
            index.checkpoint(&sample_store(), 5).unwrap();
            index.flush().unwrap();
        }
        let index = ClusterIndex::open(&path).unwrap();
        assert_eq!(index.next_height().unwrap(), Some(5));
        assert!(index.lookup(&addr("C"), 1).unwrap().is_some());
    }
}
