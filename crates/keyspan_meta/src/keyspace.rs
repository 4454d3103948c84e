//! The ordered meta key-space.
//!
//! A single fjall partition holds every piece of cluster metadata, segmented
//! by string prefix. Each manager owns its prefix; the whole namespace sits
//! inside `[CLUSTER, MAX)` so snapshots are one range dump and snapshot
//! install is one range delete plus one ingest.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

pub const CLUSTER_PREFIX: &str = "CLUSTER/";
pub const CLUSTER_LOGICAL_KEY: &str = "CLUSTER/logical";
pub const CLUSTER_PHYSICAL_PREFIX: &str = "CLUSTER/physical/";
pub const CLUSTER_INSTANCE_PREFIX: &str = "CLUSTER/instance/";

pub const PRIVILEGE_PREFIX: &str = "PRIVILEGE/";
pub const PRIVILEGE_USER_PREFIX: &str = "PRIVILEGE/user/";

pub const SCHEMA_PREFIX: &str = "SCHEMA/";
pub const SCHEMA_MAX_ID_PREFIX: &str = "SCHEMA/max_id/";
pub const SCHEMA_NAMESPACE_PREFIX: &str = "SCHEMA/namespace/";
pub const SCHEMA_DATABASE_PREFIX: &str = "SCHEMA/database/";
pub const SCHEMA_TABLE_PREFIX: &str = "SCHEMA/table/";
pub const SCHEMA_REGION_PREFIX: &str = "SCHEMA/region/";
pub const SCHEMA_REGION_REMOVED_PREFIX: &str = "SCHEMA/region_removed/";

/// Exclusive upper bound of the meta namespace; sorts after every manager
/// prefix and no real key ever starts at or beyond it.
pub const MAX_IDENTIFIER: &str = "Z";

const WRITE_CHUNK_ITEMS: usize = 10_000;

/// Fixed-width region key so numeric ids sort lexicographically.
pub fn region_key(region_id: u64) -> String {
    format!("{SCHEMA_REGION_PREFIX}{region_id:020}")
}

pub fn removed_region_key(region_id: u64) -> String {
    format!("{SCHEMA_REGION_REMOVED_PREFIX}{region_id:020}")
}

/// Storage wrapper every manager writes through. The on-disk form is the
/// authoritative copy; in-memory maps are caches rebuilt by `load_snapshot`.
pub struct MetaStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl MetaStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open meta keyspace")?;
        let partition = keyspace
            .open_partition("meta_info", PartitionCreateOptions::default())
            .context("open meta partition")?;
        Ok(Arc::new(Self {
            keyspace,
            partition,
        }))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.partition
            .insert(key, value)
            .with_context(|| format!("put meta key {key}"))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self
            .partition
            .get(key)
            .with_context(|| format!("get meta key {key}"))?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.partition
            .remove(key)
            .with_context(|| format!("delete meta key {key}"))?;
        Ok(())
    }

    pub fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, value) = item.context("scan meta prefix")?;
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }

    /// Ordered dump of `[start, end)`, used by snapshot save.
    pub fn dump_range(&self, start: &str, end: &str) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let range = start.as_bytes().to_vec()..end.as_bytes().to_vec();
        for item in self.partition.range(range) {
            let (key, value) = item.context("dump meta range")?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Deletes `[start, end)` in bounded batches. Returns the removed count.
    pub fn remove_range(&self, start: &str, end: &str) -> anyhow::Result<usize> {
        let keys: Vec<Vec<u8>> = self
            .dump_range(start, end)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let removed = keys.len();

        let mut batch = self.keyspace.batch();
        let mut queued = 0usize;
        for key in keys {
            batch.remove(&self.partition, key);
            queued += 1;
            if queued >= WRITE_CHUNK_ITEMS {
                batch.commit().context("commit meta range delete")?;
                batch = self.keyspace.batch();
                queued = 0;
            }
        }
        if queued > 0 {
            batch.commit().context("commit meta range delete")?;
        }
        Ok(removed)
    }

    /// Installs a dumped key/value set, used by snapshot load.
    pub fn ingest(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        let mut queued = 0usize;
        for (key, value) in pairs {
            batch.insert(&self.partition, key.clone(), value.clone());
            queued += 1;
            if queued >= WRITE_CHUNK_ITEMS {
                batch.commit().context("commit meta ingest")?;
                batch = self.keyspace.batch();
                queued = 0;
            }
        }
        if queued > 0 {
            batch.commit().context("commit meta ingest")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_prefixes_sort_below_the_sentinel() {
        for prefix in [CLUSTER_PREFIX, PRIVILEGE_PREFIX, SCHEMA_PREFIX] {
            assert!(prefix < MAX_IDENTIFIER);
        }
        assert!(CLUSTER_PREFIX < PRIVILEGE_PREFIX);
        assert!(PRIVILEGE_PREFIX < SCHEMA_PREFIX);
    }

    #[test]
    fn region_keys_sort_numerically() {
        assert!(region_key(9) < region_key(10));
        assert!(region_key(99) < region_key(100));
    }

    #[test]
    fn range_delete_covers_the_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::open(dir.path()).expect("open");
        store.put("CLUSTER/instance/a", b"1").expect("put");
        store.put("PRIVILEGE/user/root", b"2").expect("put");
        store.put("SCHEMA/table/t", b"3").expect("put");

        let removed = store
            .remove_range(CLUSTER_PREFIX, MAX_IDENTIFIER)
            .expect("remove range");
        assert_eq!(removed, 3);
        assert!(store
            .dump_range(CLUSTER_PREFIX, MAX_IDENTIFIER)
            .expect("dump")
            .is_empty());
    }
}
