//! User accounts and their database/table grants.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use keyspan_rpc::UserPrivilege;

use crate::error::MetaError;
use crate::keyspace::{MetaStore, PRIVILEGE_USER_PREFIX};

pub struct PrivilegeManager {
    store: Arc<MetaStore>,
    users: RwLock<BTreeMap<String, UserPrivilege>>,
}

impl PrivilegeManager {
    pub fn new(store: Arc<MetaStore>) -> anyhow::Result<Self> {
        let manager = Self {
            store,
            users: RwLock::new(BTreeMap::new()),
        };
        manager.load_snapshot()?;
        Ok(manager)
    }

    pub fn create_user(&self, req: &UserPrivilege) -> Result<(), MetaError> {
        if req.username.is_empty() {
            return Err(MetaError::input("username is empty"));
        }
        let mut users = self.users.write().unwrap();
        if users.contains_key(&req.username) {
            return Err(MetaError::input(format!("user {} already exist", req.username)));
        }
        let mut user = req.clone();
        user.version = 1;
        self.persist(&user)?;
        tracing::info!(username = %user.username, namespace = %user.namespace, "created user");
        users.insert(user.username.clone(), user);
        Ok(())
    }

    pub fn drop_user(&self, req: &UserPrivilege) -> Result<(), MetaError> {
        let mut users = self.users.write().unwrap();
        if users.remove(&req.username).is_none() {
            return Err(MetaError::input(format!("user {} not exist", req.username)));
        }
        self.store
            .delete(&format!("{PRIVILEGE_USER_PREFIX}{}", req.username))
            .map_err(MetaError::from)?;
        Ok(())
    }

    /// Merges the request's grants into the user, bumping its version.
    pub fn add_privilege(&self, req: &UserPrivilege) -> Result<(), MetaError> {
        let mut users = self.users.write().unwrap();
        let user = users
            .get_mut(&req.username)
            .ok_or_else(|| MetaError::input(format!("user {} not exist", req.username)))?;
        for entry in &req.privileges {
            if !user.privileges.contains(entry) {
                user.privileges.push(entry.clone());
            }
        }
        user.version += 1;
        let user = user.clone();
        self.persist(&user)?;
        Ok(())
    }

    /// Removes the request's grants from the user, bumping its version.
    pub fn drop_privilege(&self, req: &UserPrivilege) -> Result<(), MetaError> {
        let mut users = self.users.write().unwrap();
        let user = users
            .get_mut(&req.username)
            .ok_or_else(|| MetaError::input(format!("user {} not exist", req.username)))?;
        user.privileges
            .retain(|entry| !req.privileges.contains(entry));
        user.version += 1;
        let user = user.clone();
        self.persist(&user)?;
        Ok(())
    }

    /// Heartbeat diff: users whose version exceeds what the proxy reported.
    pub fn privileges_newer_than(&self, reported: &BTreeMap<String, u64>) -> Vec<UserPrivilege> {
        self.users
            .read()
            .unwrap()
            .values()
            .filter(|user| reported.get(&user.username).copied().unwrap_or(0) < user.version)
            .cloned()
            .collect()
    }

    pub fn user(&self, username: &str) -> Option<UserPrivilege> {
        self.users.read().unwrap().get(username).cloned()
    }

    pub fn users(&self) -> Vec<UserPrivilege> {
        self.users.read().unwrap().values().cloned().collect()
    }

    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let mut users = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(PRIVILEGE_USER_PREFIX)? {
            let user: UserPrivilege = serde_json::from_slice(&raw)?;
            users.insert(user.username.clone(), user);
        }
        *self.users.write().unwrap() = users;
        Ok(())
    }

    fn persist(&self, user: &UserPrivilege) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(user).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{PRIVILEGE_USER_PREFIX}{}", user.username), &raw)
            .map_err(MetaError::from)
    }
}
