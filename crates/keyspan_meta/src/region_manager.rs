//! Authoritative region descriptors and their liveness.
//!
//! Region versions only move forward: an update carrying an older version
//! than the stored descriptor is rejected. Dropped regions keep a tombstone
//! so a mistaken drop can be restored without inventing a descriptor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use keyspan_rpc::{key_in_range, RegionInfo, RegionSplitReq};

use crate::error::MetaError;
use crate::keyspace::{
    region_key, removed_region_key, MetaStore, SCHEMA_MAX_ID_PREFIX, SCHEMA_REGION_PREFIX,
    SCHEMA_REGION_REMOVED_PREFIX,
};

const MAX_REGION_ID_KEY_SUFFIX: &str = "region";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionStatus {
    Normal,
    Faulty,
}

#[derive(Debug, Clone)]
struct RegionState {
    info: RegionInfo,
    status: RegionStatus,
    last_heartbeat: Instant,
}

pub struct RegionManager {
    store: Arc<MetaStore>,
    regions: RwLock<BTreeMap<u64, RegionState>>,
    removed: RwLock<BTreeMap<u64, RegionInfo>>,
    max_region_id: Mutex<u64>,
}

impl RegionManager {
    pub fn new(store: Arc<MetaStore>) -> anyhow::Result<Self> {
        let manager = Self {
            store,
            regions: RwLock::new(BTreeMap::new()),
            removed: RwLock::new(BTreeMap::new()),
            max_region_id: Mutex::new(0),
        };
        manager.load_snapshot()?;
        Ok(manager)
    }

    /// Installs or refreshes one region. Version must not regress.
    pub fn update_region(&self, info: &RegionInfo) -> Result<(), MetaError> {
        let mut regions = self.regions.write().unwrap();
        if let Some(existing) = regions.get(&info.region_id) {
            if info.version < existing.info.version {
                tracing::warn!(
                    region_id = info.region_id,
                    incoming_version = info.version,
                    stored_version = existing.info.version,
                    "rejecting stale region update"
                );
                return Err(MetaError::input(format!(
                    "region {} version {} is older than stored {}",
                    info.region_id, info.version, existing.info.version
                )));
            }
        }
        self.persist_region(info)?;
        regions.insert(
            info.region_id,
            RegionState {
                info: info.clone(),
                status: RegionStatus::Normal,
                last_heartbeat: Instant::now(),
            },
        );
        {
            let mut max_id = self.max_region_id.lock().unwrap();
            if info.region_id > *max_id {
                *max_id = info.region_id;
                self.persist_max_id(*max_id)?;
            }
        }
        Ok(())
    }

    /// Removes a region, keeping a tombstone for restore.
    pub fn drop_region(&self, region_id: u64) -> Result<(), MetaError> {
        let mut regions = self.regions.write().unwrap();
        let state = regions
            .remove(&region_id)
            .ok_or_else(|| MetaError::input(format!("region {region_id} not exist")))?;
        let raw = serde_json::to_vec(&state.info)
            .map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&removed_region_key(region_id), &raw)
            .map_err(MetaError::from)?;
        self.store
            .delete(&region_key(region_id))
            .map_err(MetaError::from)?;
        self.removed.write().unwrap().insert(region_id, state.info);
        tracing::info!(region_id, "dropped region");
        Ok(())
    }

    /// Brings a dropped region back from its tombstone.
    pub fn restore_region(&self, region_id: u64) -> Result<(), MetaError> {
        let info = self
            .removed
            .write()
            .unwrap()
            .remove(&region_id)
            .ok_or_else(|| MetaError::input(format!("region {region_id} has no tombstone")))?;
        self.persist_region(&info)?;
        self.store
            .delete(&removed_region_key(region_id))
            .map_err(MetaError::from)?;
        self.regions.write().unwrap().insert(
            region_id,
            RegionState {
                info,
                status: RegionStatus::Normal,
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!(region_id, "restored region");
        Ok(())
    }

    /// Splits a region at `split_key`: allocates the child id, narrows the
    /// parent, bumps both versions. Returns the child region id.
    pub fn split_region(&self, req: &RegionSplitReq) -> Result<u64, MetaError> {
        let mut regions = self.regions.write().unwrap();
        let parent = regions
            .get_mut(&req.region_id)
            .ok_or_else(|| MetaError::input(format!("region {} not exist", req.region_id)))?;
        if !key_in_range(
            &req.split_key,
            &parent.info.start_key,
            &parent.info.end_key,
        ) || req.split_key.as_ref() == parent.info.start_key.as_ref()
        {
            return Err(MetaError::input(format!(
                "split key does not fall inside region {}",
                req.region_id
            )));
        }

        let child_id = {
            let mut max_id = self.max_region_id.lock().unwrap();
            *max_id += 1;
            self.persist_max_id(*max_id)?;
            *max_id
        };

        let mut child = parent.info.clone();
        child.region_id = child_id;
        child.start_key = req.split_key.clone();
        child.end_key = parent.info.end_key.clone();
        child.version = parent.info.version + 1;
        if req.new_leader.is_some() {
            child.leader = req.new_leader;
        }

        parent.info.end_key = req.split_key.clone();
        parent.info.version += 1;
        let parent_info = parent.info.clone();
        self.persist_region(&parent_info)?;
        self.persist_region(&child)?;
        tracing::info!(
            parent_region_id = req.region_id,
            child_region_id = child_id,
            parent_version = parent_info.version,
            "split region"
        );
        regions.insert(
            child_id,
            RegionState {
                info: child,
                status: RegionStatus::Normal,
                last_heartbeat: Instant::now(),
            },
        );
        Ok(child_id)
    }

    /// Store heartbeat path: refresh leader and liveness for reported
    /// regions. Stale versions are ignored; the log is authoritative.
    pub fn process_leader_heartbeat(&self, reported: &[RegionInfo]) {
        let mut regions = self.regions.write().unwrap();
        for info in reported {
            let Some(state) = regions.get_mut(&info.region_id) else {
                tracing::warn!(region_id = info.region_id, "heartbeat for unknown region");
                continue;
            };
            if info.version < state.info.version {
                continue;
            }
            state.info.leader = info.leader;
            state.status = RegionStatus::Normal;
            state.last_heartbeat = Instant::now();
        }
    }

    /// Flags regions that have not been reported for too long.
    pub fn region_healthy_check(&self, stale_after: Duration) {
        let mut regions = self.regions.write().unwrap();
        for state in regions.values_mut() {
            if state.status == RegionStatus::Normal
                && state.last_heartbeat.elapsed() > stale_after
            {
                tracing::warn!(
                    region_id = state.info.region_id,
                    idle = ?state.last_heartbeat.elapsed(),
                    "region missed leader heartbeats"
                );
                state.status = RegionStatus::Faulty;
            }
        }
    }

    pub fn reset_region_status(&self) {
        let mut regions = self.regions.write().unwrap();
        for state in regions.values_mut() {
            state.status = RegionStatus::Normal;
            state.last_heartbeat = Instant::now();
        }
    }

    pub fn region(&self, region_id: u64) -> Option<RegionInfo> {
        self.regions
            .read()
            .unwrap()
            .get(&region_id)
            .map(|state| state.info.clone())
    }

    pub fn region_status(&self, region_id: u64) -> Option<RegionStatus> {
        self.regions
            .read()
            .unwrap()
            .get(&region_id)
            .map(|state| state.status)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .read()
            .unwrap()
            .values()
            .map(|state| state.info.clone())
            .collect()
    }

    pub fn regions_for_tables(&self, table_ids: &[u64]) -> Vec<RegionInfo> {
        self.regions
            .read()
            .unwrap()
            .values()
            .filter(|state| table_ids.contains(&state.info.table_id))
            .map(|state| state.info.clone())
            .collect()
    }

    pub fn max_region_id(&self) -> u64 {
        *self.max_region_id.lock().unwrap()
    }

    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let mut regions = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(SCHEMA_REGION_PREFIX)? {
            let info: RegionInfo = serde_json::from_slice(&raw)?;
            regions.insert(
                info.region_id,
                RegionState {
                    info,
                    status: RegionStatus::Normal,
                    last_heartbeat: Instant::now(),
                },
            );
        }

        let mut removed = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(SCHEMA_REGION_REMOVED_PREFIX)? {
            let info: RegionInfo = serde_json::from_slice(&raw)?;
            removed.insert(info.region_id, info);
        }

        let max_id = match self
            .store
            .get(&format!("{SCHEMA_MAX_ID_PREFIX}{MAX_REGION_ID_KEY_SUFFIX}"))?
        {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => 0,
        };

        *self.regions.write().unwrap() = regions;
        *self.removed.write().unwrap() = removed;
        *self.max_region_id.lock().unwrap() = max_id;
        Ok(())
    }

    fn persist_region(&self, info: &RegionInfo) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(info).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&region_key(info.region_id), &raw)
            .map_err(MetaError::from)
    }

    fn persist_max_id(&self, max_id: u64) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(&max_id).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(
                &format!("{SCHEMA_MAX_ID_PREFIX}{MAX_REGION_ID_KEY_SUFFIX}"),
                &raw,
            )
            .map_err(MetaError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn manager() -> (tempfile::TempDir, RegionManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::open(dir.path()).expect("open store");
        let manager = RegionManager::new(store).expect("manager");
        (dir, manager)
    }

    fn region(region_id: u64, version: u64, start: &[u8], end: &[u8]) -> RegionInfo {
        let leader = "10.0.0.1:8110".parse().expect("addr");
        RegionInfo {
            region_id,
            table_id: 1,
            version,
            start_key: Bytes::copy_from_slice(start),
            end_key: Bytes::copy_from_slice(end),
            leader: Some(leader),
            peers: vec![leader],
        }
    }

    #[test]
    fn version_never_regresses() {
        let (_dir, manager) = manager();
        manager.update_region(&region(1, 5, b"a", b"z")).expect("update");
        assert!(manager.update_region(&region(1, 4, b"a", b"z")).is_err());
        manager.update_region(&region(1, 5, b"a", b"z")).expect("same version ok");
    }

    #[test]
    fn split_narrows_parent_and_allocates_child() {
        let (_dir, manager) = manager();
        manager.update_region(&region(1, 1, b"k00", b"k99")).expect("update");

        let child_id = manager
            .split_region(&RegionSplitReq {
                region_id: 1,
                split_key: Bytes::from_static(b"k50"),
                new_leader: None,
            })
            .expect("split");
        assert_eq!(child_id, 2);

        let parent = manager.region(1).expect("parent");
        assert_eq!(parent.end_key, Bytes::from_static(b"k50"));
        assert_eq!(parent.version, 2);

        let child = manager.region(child_id).expect("child");
        assert_eq!(child.start_key, Bytes::from_static(b"k50"));
        assert_eq!(child.end_key, Bytes::from_static(b"k99"));
        assert_eq!(child.version, 2);
    }

    #[test]
    fn split_key_must_fall_inside_the_range() {
        let (_dir, manager) = manager();
        manager.update_region(&region(1, 1, b"k00", b"k99")).expect("update");
        for bad in [&b"k00"[..], b"k99", b"a"] {
            assert!(manager
                .split_region(&RegionSplitReq {
                    region_id: 1,
                    split_key: Bytes::copy_from_slice(bad),
                    new_leader: None,
                })
                .is_err());
        }
    }

    #[test]
    fn drop_and_restore_round_trip() {
        let (_dir, manager) = manager();
        manager.update_region(&region(1, 3, b"a", b"z")).expect("update");
        manager.drop_region(1).expect("drop");
        assert!(manager.region(1).is_none());

        manager.restore_region(1).expect("restore");
        let restored = manager.region(1).expect("region");
        assert_eq!(restored.version, 3);

        assert!(manager.restore_region(1).is_err());
    }

    #[test]
    fn stale_heartbeats_flag_regions() {
        let (_dir, manager) = manager();
        manager.update_region(&region(1, 1, b"a", b"z")).expect("update");

        manager.region_healthy_check(Duration::from_secs(0));
        assert_eq!(manager.region_status(1), Some(RegionStatus::Faulty));

        manager.process_leader_heartbeat(&[region(1, 1, b"a", b"z")]);
        assert_eq!(manager.region_status(1), Some(RegionStatus::Normal));
    }
}
