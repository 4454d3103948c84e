//! Process-wide region directory: region id -> leader/peers/range/version.
//!
//! Read-mostly. Writers are the fan-out executor reacting to topology signals
//! (leader hints, splits) and the meta-heartbeat loop installing authoritative
//! updates. Regions never age out; they disappear only through an explicit
//! drop driven by the meta plane.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use keyspan_rpc::RegionInfo;

pub struct RegionDirectory {
    regions: RwLock<HashMap<u64, RegionInfo>>,
    /// Storage instance -> logical room, fed from meta heartbeats.
    instance_rooms: RwLock<HashMap<SocketAddr, String>>,
    /// The room this proxy itself runs in, when locality affinity is on.
    logical_room: Option<String>,
}

impl RegionDirectory {
    pub fn new(logical_room: Option<String>) -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            instance_rooms: RwLock::new(HashMap::new()),
            logical_room,
        }
    }

    pub fn get(&self, region_id: u64) -> Option<RegionInfo> {
        self.regions.read().unwrap().get(&region_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.regions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().unwrap().is_empty()
    }

    /// Adopts a fresher leader for one region. A miss is not an error: the
    /// hint may race an explicit drop.
    pub fn update_leader(&self, region_id: u64, leader: SocketAddr) {
        let mut regions = self.regions.write().unwrap();
        if let Some(info) = regions.get_mut(&region_id) {
            info.leader = Some(leader);
        }
    }

    /// Installs a batch of region descriptors, typically the children plus
    /// narrowed parent returned after a split. Version never regresses: a
    /// stale descriptor for a known region is dropped.
    pub fn update_regions(&self, updates: impl IntoIterator<Item = RegionInfo>) {
        let mut regions = self.regions.write().unwrap();
        for update in updates {
            match regions.get_mut(&update.region_id) {
                Some(existing) => {
                    if update.version < existing.version {
                        tracing::warn!(
                            region_id = update.region_id,
                            incoming_version = update.version,
                            cached_version = existing.version,
                            "dropping stale region update"
                        );
                        continue;
                    }
                    *existing = update;
                }
                None => {
                    regions.insert(update.region_id, update);
                }
            }
        }
    }

    /// Explicit removal, driven by the meta plane.
    pub fn drop_region(&self, region_id: u64) {
        self.regions.write().unwrap().remove(&region_id);
    }

    pub fn set_instance_room(&self, instance: SocketAddr, room: String) {
        self.instance_rooms.write().unwrap().insert(instance, room);
    }

    pub fn logical_room_for_instance(&self, instance: &SocketAddr) -> Option<String> {
        self.instance_rooms.read().unwrap().get(instance).cloned()
    }

    pub fn logical_room(&self) -> Option<&str> {
        self.logical_room.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn region(region_id: u64, version: u64, leader: &str) -> RegionInfo {
        RegionInfo {
            region_id,
            table_id: 1,
            version,
            start_key: Bytes::from_static(b"a"),
            end_key: Bytes::from_static(b"z"),
            leader: Some(leader.parse().expect("addr")),
            peers: vec![leader.parse().expect("addr")],
        }
    }

    #[test]
    fn stale_versions_are_dropped() {
        let dir = RegionDirectory::new(None);
        dir.update_regions([region(1, 5, "10.0.0.1:8110")]);
        dir.update_regions([region(1, 3, "10.0.0.2:8110")]);
        assert_eq!(dir.get(1).expect("region").version, 5);

        dir.update_regions([region(1, 6, "10.0.0.2:8110")]);
        assert_eq!(dir.get(1).expect("region").version, 6);
    }

    #[test]
    fn leader_updates_hit_only_known_regions() {
        let dir = RegionDirectory::new(None);
        dir.update_regions([region(1, 1, "10.0.0.1:8110")]);
        let new_leader: SocketAddr = "10.0.0.9:8110".parse().expect("addr");

        dir.update_leader(1, new_leader);
        dir.update_leader(99, new_leader);

        assert_eq!(dir.get(1).expect("region").leader, Some(new_leader));
        assert!(dir.get(99).is_none());
    }

    #[test]
    fn rooms_resolve_per_instance() {
        let dir = RegionDirectory::new(Some("bj".to_string()));
        let a: SocketAddr = "10.0.0.1:8110".parse().expect("addr");
        dir.set_instance_room(a, "bj".to_string());

        assert_eq!(dir.logical_room(), Some("bj"));
        assert_eq!(dir.logical_room_for_instance(&a).as_deref(), Some("bj"));
        let b: SocketAddr = "10.0.0.2:8110".parse().expect("addr");
        assert!(dir.logical_room_for_instance(&b).is_none());
    }
}
