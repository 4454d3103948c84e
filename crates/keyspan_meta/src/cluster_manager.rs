//! Cluster topology: logical rooms, physical rooms, storage instances.
//!
//! Room and instance registration is durable; instance liveness is memory
//! only and gets reconfirmed by heartbeats after every leader change.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use keyspan_rpc::{InstanceInfo, InstanceStatus, LogicalRoomReq, MovePhysicalReq, PhysicalRoomReq};
use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::keyspace::{
    MetaStore, CLUSTER_INSTANCE_PREFIX, CLUSTER_LOGICAL_KEY, CLUSTER_PHYSICAL_PREFIX,
};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhysicalRoom {
    name: String,
    logical_room: String,
}

/// In-memory instance record: durable info plus volatile liveness.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub info: InstanceInfo,
    pub last_heartbeat: Instant,
}

pub struct ClusterManager {
    store: Arc<MetaStore>,
    logical_rooms: RwLock<BTreeSet<String>>,
    physical_rooms: RwLock<BTreeMap<String, PhysicalRoom>>,
    instances: RwLock<BTreeMap<SocketAddr, InstanceState>>,
}

impl ClusterManager {
    pub fn new(store: Arc<MetaStore>) -> anyhow::Result<Self> {
        let manager = Self {
            store,
            logical_rooms: RwLock::new(BTreeSet::new()),
            physical_rooms: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
        };
        manager.load_snapshot()?;
        Ok(manager)
    }

    pub fn add_logical(&self, req: &LogicalRoomReq) -> Result<(), MetaError> {
        if req.logical_rooms.is_empty() {
            return Err(MetaError::input("no logical room given"));
        }
        let mut rooms = self.logical_rooms.write().unwrap();
        for room in &req.logical_rooms {
            rooms.insert(room.clone());
        }
        self.persist_logical(&rooms)?;
        tracing::info!(rooms = ?req.logical_rooms, "added logical rooms");
        Ok(())
    }

    pub fn drop_logical(&self, req: &LogicalRoomReq) -> Result<(), MetaError> {
        let mut rooms = self.logical_rooms.write().unwrap();
        let physical = self.physical_rooms.read().unwrap();
        for room in &req.logical_rooms {
            if !rooms.contains(room) {
                return Err(MetaError::input(format!("logical room {room} not exist")));
            }
            if physical.values().any(|p| &p.logical_room == room) {
                return Err(MetaError::input(format!(
                    "logical room {room} still has physical rooms"
                )));
            }
        }
        for room in &req.logical_rooms {
            rooms.remove(room);
        }
        self.persist_logical(&rooms)?;
        Ok(())
    }

    pub fn add_physical(&self, req: &PhysicalRoomReq) -> Result<(), MetaError> {
        if !self
            .logical_rooms
            .read()
            .unwrap()
            .contains(&req.logical_room)
        {
            return Err(MetaError::input(format!(
                "logical room {} not exist",
                req.logical_room
            )));
        }
        let mut physical = self.physical_rooms.write().unwrap();
        for name in &req.physical_rooms {
            if physical.contains_key(name) {
                return Err(MetaError::input(format!("physical room {name} already exist")));
            }
            let room = PhysicalRoom {
                name: name.clone(),
                logical_room: req.logical_room.clone(),
            };
            self.persist_physical(&room)?;
            physical.insert(name.clone(), room);
        }
        Ok(())
    }

    pub fn drop_physical(&self, req: &PhysicalRoomReq) -> Result<(), MetaError> {
        let instances = self.instances.read().unwrap();
        let mut physical = self.physical_rooms.write().unwrap();
        for name in &req.physical_rooms {
            if !physical.contains_key(name) {
                return Err(MetaError::input(format!("physical room {name} not exist")));
            }
            if instances
                .values()
                .any(|state| &state.info.physical_room == name)
            {
                return Err(MetaError::input(format!(
                    "physical room {name} still has instances"
                )));
            }
        }
        for name in &req.physical_rooms {
            physical.remove(name);
            self.store
                .delete(&format!("{CLUSTER_PHYSICAL_PREFIX}{name}"))
                .map_err(MetaError::from)?;
        }
        Ok(())
    }

    pub fn move_physical(&self, req: &MovePhysicalReq) -> Result<(), MetaError> {
        if !self
            .logical_rooms
            .read()
            .unwrap()
            .contains(&req.new_logical_room)
        {
            return Err(MetaError::input(format!(
                "logical room {} not exist",
                req.new_logical_room
            )));
        }
        let mut physical = self.physical_rooms.write().unwrap();
        let room = physical
            .get_mut(&req.physical_room)
            .ok_or_else(|| MetaError::input(format!("physical room {} not exist", req.physical_room)))?;
        if room.logical_room != req.old_logical_room {
            return Err(MetaError::input(format!(
                "physical room {} not in logical room {}",
                req.physical_room, req.old_logical_room
            )));
        }
        room.logical_room = req.new_logical_room.clone();
        let room = room.clone();
        self.persist_physical(&room)?;
        Ok(())
    }

    pub fn add_instance(&self, info: &InstanceInfo) -> Result<(), MetaError> {
        if !self
            .physical_rooms
            .read()
            .unwrap()
            .contains_key(&info.physical_room)
        {
            return Err(MetaError::input(format!(
                "physical room {} not exist",
                info.physical_room
            )));
        }
        let mut instances = self.instances.write().unwrap();
        if instances.contains_key(&info.address) {
            return Err(MetaError::input(format!(
                "instance {} already exist",
                info.address
            )));
        }
        self.persist_instance(info)?;
        instances.insert(
            info.address,
            InstanceState {
                info: info.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!(address = %info.address, room = %info.physical_room, "added instance");
        Ok(())
    }

    pub fn drop_instance(&self, info: &InstanceInfo) -> Result<(), MetaError> {
        let mut instances = self.instances.write().unwrap();
        if instances.remove(&info.address).is_none() {
            return Err(MetaError::input(format!("instance {} not exist", info.address)));
        }
        self.store
            .delete(&format!("{CLUSTER_INSTANCE_PREFIX}{}", info.address))
            .map_err(MetaError::from)?;
        Ok(())
    }

    pub fn update_instance(&self, info: &InstanceInfo) -> Result<(), MetaError> {
        let mut instances = self.instances.write().unwrap();
        let state = instances
            .get_mut(&info.address)
            .ok_or_else(|| MetaError::input(format!("instance {} not exist", info.address)))?;
        state.info.capacity = info.capacity;
        state.info.resource_tag = info.resource_tag.clone();
        state.info.physical_room = info.physical_room.clone();
        let persisted = state.info.clone();
        self.persist_instance(&persisted)?;
        Ok(())
    }

    /// Heartbeat path: refresh liveness and reported usage. Unknown instances
    /// are ignored; registration goes through the replicated log.
    pub fn process_instance_heartbeat(&self, info: &InstanceInfo) {
        let mut instances = self.instances.write().unwrap();
        match instances.get_mut(&info.address) {
            Some(state) => {
                state.info.used_size = info.used_size;
                state.info.status = InstanceStatus::Normal;
                state.last_heartbeat = Instant::now();
            }
            None => {
                tracing::warn!(address = %info.address, "heartbeat from unregistered instance");
            }
        }
    }

    /// Flags instances whose heartbeats have gone stale.
    pub fn store_healthy_check(&self, faulty_after: Duration) {
        let mut instances = self.instances.write().unwrap();
        for state in instances.values_mut() {
            if state.info.status == InstanceStatus::Normal
                && state.last_heartbeat.elapsed() > faulty_after
            {
                tracing::warn!(
                    address = %state.info.address,
                    idle = ?state.last_heartbeat.elapsed(),
                    "instance missed heartbeats, marking faulty"
                );
                state.info.status = InstanceStatus::Faulty;
            }
        }
    }

    /// New leader: statuses are stale, let heartbeats reconfirm them.
    pub fn reset_instance_status(&self) {
        let mut instances = self.instances.write().unwrap();
        for state in instances.values_mut() {
            state.info.status = InstanceStatus::Normal;
            state.last_heartbeat = Instant::now();
        }
    }

    pub fn logical_room_for_instance(&self, address: &SocketAddr) -> Option<String> {
        let physical_room = self
            .instances
            .read()
            .unwrap()
            .get(address)
            .map(|state| state.info.physical_room.clone())?;
        self.physical_rooms
            .read()
            .unwrap()
            .get(&physical_room)
            .map(|room| room.logical_room.clone())
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.instances
            .read()
            .unwrap()
            .values()
            .map(|state| state.info.clone())
            .collect()
    }

    pub fn logical_rooms(&self) -> Vec<String> {
        self.logical_rooms.read().unwrap().iter().cloned().collect()
    }

    pub fn physical_rooms(&self) -> Vec<(String, String)> {
        self.physical_rooms
            .read()
            .unwrap()
            .values()
            .map(|room| (room.name.clone(), room.logical_room.clone()))
            .collect()
    }

    /// Rebuilds the in-memory maps from storage.
    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let mut rooms = BTreeSet::new();
        if let Some(raw) = self.store.get(CLUSTER_LOGICAL_KEY)? {
            let list: Vec<String> = serde_json::from_slice(&raw)?;
            rooms.extend(list);
        }

        let mut physical = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(CLUSTER_PHYSICAL_PREFIX)? {
            let room: PhysicalRoom = serde_json::from_slice(&raw)?;
            physical.insert(room.name.clone(), room);
        }

        let mut instances = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(CLUSTER_INSTANCE_PREFIX)? {
            let info: InstanceInfo = serde_json::from_slice(&raw)?;
            instances.insert(
                info.address,
                InstanceState {
                    info,
                    last_heartbeat: Instant::now(),
                },
            );
        }

        *self.logical_rooms.write().unwrap() = rooms;
        *self.physical_rooms.write().unwrap() = physical;
        *self.instances.write().unwrap() = instances;
        Ok(())
    }

    fn persist_logical(&self, rooms: &BTreeSet<String>) -> Result<(), MetaError> {
        let list: Vec<&String> = rooms.iter().collect();
        let raw = serde_json::to_vec(&list).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(CLUSTER_LOGICAL_KEY, &raw)
            .map_err(MetaError::from)
    }

    fn persist_physical(&self, room: &PhysicalRoom) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(room).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{CLUSTER_PHYSICAL_PREFIX}{}", room.name), &raw)
            .map_err(MetaError::from)
    }

    fn persist_instance(&self, info: &InstanceInfo) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(info).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{CLUSTER_INSTANCE_PREFIX}{}", info.address), &raw)
            .map_err(MetaError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, ClusterManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::open(dir.path()).expect("open store");
        let manager = ClusterManager::new(store).expect("manager");
        (dir, manager)
    }

    fn instance(addr: &str, room: &str) -> InstanceInfo {
        InstanceInfo {
            address: addr.parse().expect("addr"),
            capacity: 1 << 40,
            used_size: 0,
            resource_tag: String::new(),
            physical_room: room.to_string(),
            status: InstanceStatus::Normal,
        }
    }

    fn seed_rooms(manager: &ClusterManager) {
        manager
            .add_logical(&LogicalRoomReq {
                logical_rooms: vec!["bj".to_string()],
            })
            .expect("add logical");
        manager
            .add_physical(&PhysicalRoomReq {
                logical_room: "bj".to_string(),
                physical_rooms: vec!["bj-01".to_string()],
            })
            .expect("add physical");
    }

    #[test]
    fn instance_requires_registered_room() {
        let (_dir, manager) = manager();
        let err = manager
            .add_instance(&instance("10.0.0.1:8110", "nowhere"))
            .expect_err("must fail");
        assert_eq!(err.errcode, keyspan_rpc::ErrCode::InputParamError);

        seed_rooms(&manager);
        manager
            .add_instance(&instance("10.0.0.1:8110", "bj-01"))
            .expect("add instance");
        assert_eq!(manager.instances().len(), 1);
        assert_eq!(
            manager.logical_room_for_instance(&"10.0.0.1:8110".parse().expect("addr")),
            Some("bj".to_string())
        );
    }

    #[test]
    fn stale_instances_get_flagged_and_reset() {
        let (_dir, manager) = manager();
        seed_rooms(&manager);
        manager
            .add_instance(&instance("10.0.0.1:8110", "bj-01"))
            .expect("add instance");

        manager.store_healthy_check(Duration::from_secs(0));
        assert_eq!(manager.instances()[0].status, InstanceStatus::Faulty);

        manager.reset_instance_status();
        assert_eq!(manager.instances()[0].status, InstanceStatus::Normal);
    }

    #[test]
    fn drop_logical_refuses_rooms_in_use() {
        let (_dir, manager) = manager();
        seed_rooms(&manager);
        let err = manager
            .drop_logical(&LogicalRoomReq {
                logical_rooms: vec!["bj".to_string()],
            })
            .expect_err("must fail");
        assert_eq!(err.errcode, keyspan_rpc::ErrCode::InputParamError);
    }

    #[test]
    fn state_reloads_from_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::open(dir.path()).expect("open store");
        let manager = ClusterManager::new(store.clone()).expect("manager");
        seed_rooms(&manager);
        manager
            .add_instance(&instance("10.0.0.1:8110", "bj-01"))
            .expect("add instance");

        let reloaded = ClusterManager::new(store).expect("reload");
        assert_eq!(reloaded.logical_rooms(), vec!["bj".to_string()]);
        assert_eq!(reloaded.instances().len(), 1);
    }
}
