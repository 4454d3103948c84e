//! Namespaces, databases, and table schemas.
//!
//! Every mutation bumps a global schema version and stamps it onto the
//! affected table, so proxy heartbeats can ask for "everything newer than
//! what I have" with one number. Id counters are persisted next to the data;
//! ids are never reused.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use keyspan_rpc::{DatabaseInfo, NamespaceInfo, SchemaReq, TableInfo};
use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::keyspace::{
    MetaStore, SCHEMA_DATABASE_PREFIX, SCHEMA_MAX_ID_PREFIX, SCHEMA_NAMESPACE_PREFIX,
    SCHEMA_TABLE_PREFIX,
};

const MAX_IDS_KEY_SUFFIX: &str = "schema";

/// Persisted id/version counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct SchemaCounters {
    max_namespace_id: u64,
    max_database_id: u64,
    max_table_id: u64,
    schema_version: u64,
}

pub struct SchemaManager {
    store: Arc<MetaStore>,
    namespaces: RwLock<BTreeMap<String, NamespaceInfo>>,
    /// Key: `namespace.database`.
    databases: RwLock<BTreeMap<String, DatabaseInfo>>,
    /// Key: `namespace.database.table`.
    tables: RwLock<BTreeMap<String, TableInfo>>,
    counters: Mutex<SchemaCounters>,
}

fn database_key(namespace: &str, database: &str) -> String {
    format!("{namespace}.{database}")
}

fn table_key(namespace: &str, database: &str, table: &str) -> String {
    format!("{namespace}.{database}.{table}")
}

impl SchemaManager {
    pub fn new(store: Arc<MetaStore>) -> anyhow::Result<Self> {
        let manager = Self {
            store,
            namespaces: RwLock::new(BTreeMap::new()),
            databases: RwLock::new(BTreeMap::new()),
            tables: RwLock::new(BTreeMap::new()),
            counters: Mutex::new(SchemaCounters::default()),
        };
        manager.load_snapshot()?;
        Ok(manager)
    }

    pub fn create_namespace(&self, req: &NamespaceInfo) -> Result<(), MetaError> {
        if req.name.is_empty() {
            return Err(MetaError::input("namespace name is empty"));
        }
        let mut namespaces = self.namespaces.write().unwrap();
        if namespaces.contains_key(&req.name) {
            return Err(MetaError::input(format!("namespace {} already exist", req.name)));
        }
        let (id, version) = self.next_ids(|c| {
            c.max_namespace_id += 1;
            c.max_namespace_id
        })?;
        let info = NamespaceInfo {
            namespace_id: id,
            name: req.name.clone(),
            version,
        };
        self.persist_namespace(&info)?;
        namespaces.insert(info.name.clone(), info);
        Ok(())
    }

    pub fn drop_namespace(&self, req: &NamespaceInfo) -> Result<(), MetaError> {
        let mut namespaces = self.namespaces.write().unwrap();
        if !namespaces.contains_key(&req.name) {
            return Err(MetaError::input(format!("namespace {} not exist", req.name)));
        }
        let in_use = self
            .databases
            .read()
            .unwrap()
            .values()
            .any(|db| db.namespace == req.name);
        if in_use {
            return Err(MetaError::input(format!(
                "namespace {} still has databases",
                req.name
            )));
        }
        namespaces.remove(&req.name);
        self.store
            .delete(&format!("{SCHEMA_NAMESPACE_PREFIX}{}", req.name))
            .map_err(MetaError::from)?;
        Ok(())
    }

    pub fn modify_namespace(&self, req: &NamespaceInfo) -> Result<(), MetaError> {
        let mut namespaces = self.namespaces.write().unwrap();
        let info = namespaces
            .get_mut(&req.name)
            .ok_or_else(|| MetaError::input(format!("namespace {} not exist", req.name)))?;
        let (_, version) = self.next_ids(|_| 0)?;
        info.version = version;
        let info = info.clone();
        self.persist_namespace(&info)?;
        Ok(())
    }

    pub fn create_database(&self, req: &DatabaseInfo) -> Result<(), MetaError> {
        if !self.namespaces.read().unwrap().contains_key(&req.namespace) {
            return Err(MetaError::input(format!("namespace {} not exist", req.namespace)));
        }
        let key = database_key(&req.namespace, &req.name);
        let mut databases = self.databases.write().unwrap();
        if databases.contains_key(&key) {
            return Err(MetaError::input(format!("database {key} already exist")));
        }
        let (id, version) = self.next_ids(|c| {
            c.max_database_id += 1;
            c.max_database_id
        })?;
        let info = DatabaseInfo {
            database_id: id,
            namespace: req.namespace.clone(),
            name: req.name.clone(),
            version,
        };
        self.persist_database(&info)?;
        databases.insert(key, info);
        Ok(())
    }

    pub fn drop_database(&self, req: &DatabaseInfo) -> Result<(), MetaError> {
        let key = database_key(&req.namespace, &req.name);
        let mut databases = self.databases.write().unwrap();
        if !databases.contains_key(&key) {
            return Err(MetaError::input(format!("database {key} not exist")));
        }
        let prefix = format!("{key}.");
        let in_use = self
            .tables
            .read()
            .unwrap()
            .keys()
            .any(|table| table.starts_with(&prefix));
        if in_use {
            return Err(MetaError::input(format!("database {key} still has tables")));
        }
        databases.remove(&key);
        self.store
            .delete(&format!("{SCHEMA_DATABASE_PREFIX}{key}"))
            .map_err(MetaError::from)?;
        Ok(())
    }

    pub fn modify_database(&self, req: &DatabaseInfo) -> Result<(), MetaError> {
        let key = database_key(&req.namespace, &req.name);
        let mut databases = self.databases.write().unwrap();
        let info = databases
            .get_mut(&key)
            .ok_or_else(|| MetaError::input(format!("database {key} not exist")))?;
        let (_, version) = self.next_ids(|_| 0)?;
        info.version = version;
        let info = info.clone();
        self.persist_database(&info)?;
        Ok(())
    }

    pub fn create_table(&self, req: &TableInfo) -> Result<u64, MetaError> {
        let db_key = database_key(&req.namespace, &req.database);
        if !self.databases.read().unwrap().contains_key(&db_key) {
            return Err(MetaError::input(format!("database {db_key} not exist")));
        }
        let key = table_key(&req.namespace, &req.database, &req.name);
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(&key) {
            return Err(MetaError::input(format!("table {key} already exist")));
        }
        if req.fields.is_empty() {
            return Err(MetaError::input("table has no fields"));
        }

        let (table_id, version) = self.next_ids(|c| {
            c.max_table_id += 1;
            c.max_table_id
        })?;
        let mut info = req.clone();
        info.table_id = table_id;
        info.version = version;
        info.max_field_id = 0;
        for field in &mut info.fields {
            info.max_field_id += 1;
            field.field_id = info.max_field_id;
        }
        self.persist_table(&key, &info)?;
        tracing::info!(table = %key, table_id, "created table");
        tables.insert(key, info);
        Ok(table_id)
    }

    pub fn drop_table(&self, req: &SchemaReq) -> Result<(), MetaError> {
        let key = table_key(&req.namespace, &req.database, &req.table);
        let mut tables = self.tables.write().unwrap();
        if tables.remove(&key).is_none() {
            return Err(MetaError::input(format!("table {key} not exist")));
        }
        self.store
            .delete(&format!("{SCHEMA_TABLE_PREFIX}{key}"))
            .map_err(MetaError::from)?;
        Ok(())
    }

    pub fn rename_table(&self, req: &SchemaReq) -> Result<(), MetaError> {
        if req.new_name.is_empty() {
            return Err(MetaError::input("new table name is empty"));
        }
        let old_key = table_key(&req.namespace, &req.database, &req.table);
        let new_key = table_key(&req.namespace, &req.database, &req.new_name);
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(&new_key) {
            return Err(MetaError::input(format!("table {new_key} already exist")));
        }
        let mut info = tables
            .remove(&old_key)
            .ok_or_else(|| MetaError::input(format!("table {old_key} not exist")))?;
        let (_, version) = self.next_ids(|_| 0)?;
        info.name = req.new_name.clone();
        info.version = version;
        self.store
            .delete(&format!("{SCHEMA_TABLE_PREFIX}{old_key}"))
            .map_err(MetaError::from)?;
        self.persist_table(&new_key, &info)?;
        tables.insert(new_key, info);
        Ok(())
    }

    pub fn add_field(&self, req: &SchemaReq) -> Result<(), MetaError> {
        self.mutate_table(req, |info| {
            for field in &req.fields {
                if info.fields.iter().any(|f| f.name == field.name) {
                    return Err(MetaError::input(format!("field {} already exist", field.name)));
                }
                let mut field = field.clone();
                info.max_field_id += 1;
                field.field_id = info.max_field_id;
                info.fields.push(field);
            }
            Ok(())
        })
    }

    pub fn drop_field(&self, req: &SchemaReq) -> Result<(), MetaError> {
        self.mutate_table(req, |info| {
            for field in &req.fields {
                let before = info.fields.len();
                info.fields.retain(|f| f.name != field.name);
                if info.fields.len() == before {
                    return Err(MetaError::input(format!("field {} not exist", field.name)));
                }
            }
            Ok(())
        })
    }

    pub fn rename_field(&self, req: &SchemaReq) -> Result<(), MetaError> {
        let new_name = req.new_name.clone();
        if new_name.is_empty() {
            return Err(MetaError::input("new field name is empty"));
        }
        self.mutate_table(req, |info| {
            let old = req
                .fields
                .first()
                .ok_or_else(|| MetaError::input("no field given"))?;
            if info.fields.iter().any(|f| f.name == new_name) {
                return Err(MetaError::input(format!("field {new_name} already exist")));
            }
            let field = info
                .fields
                .iter_mut()
                .find(|f| f.name == old.name)
                .ok_or_else(|| MetaError::input(format!("field {} not exist", old.name)))?;
            field.name = new_name.clone();
            Ok(())
        })
    }

    pub fn modify_field(&self, req: &SchemaReq) -> Result<(), MetaError> {
        self.mutate_table(req, |info| {
            for changed in &req.fields {
                let field = info
                    .fields
                    .iter_mut()
                    .find(|f| f.name == changed.name)
                    .ok_or_else(|| MetaError::input(format!("field {} not exist", changed.name)))?;
                field.mysql_type = changed.mysql_type.clone();
                field.can_null = changed.can_null;
            }
            Ok(())
        })
    }

    pub fn update_byte_size(&self, req: &SchemaReq) -> Result<(), MetaError> {
        self.mutate_table(req, |info| {
            info.byte_size_per_record = req.byte_size_per_record;
            Ok(())
        })
    }

    /// Heartbeat diff: tables with a version past what the proxy reported.
    pub fn tables_newer_than(&self, last_schema_version: u64) -> Vec<TableInfo> {
        self.tables
            .read()
            .unwrap()
            .values()
            .filter(|info| info.version > last_schema_version)
            .cloned()
            .collect()
    }

    pub fn schema_version(&self) -> u64 {
        self.counters.lock().unwrap().schema_version
    }

    pub fn max_table_id(&self) -> u64 {
        self.counters.lock().unwrap().max_table_id
    }

    pub fn table(&self, namespace: &str, database: &str, table: &str) -> Option<TableInfo> {
        self.tables
            .read()
            .unwrap()
            .get(&table_key(namespace, database, table))
            .cloned()
    }

    pub fn tables(&self) -> Vec<TableInfo> {
        self.tables.read().unwrap().values().cloned().collect()
    }

    pub fn namespaces(&self) -> Vec<NamespaceInfo> {
        self.namespaces.read().unwrap().values().cloned().collect()
    }

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        self.databases.read().unwrap().values().cloned().collect()
    }

    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let mut namespaces = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(SCHEMA_NAMESPACE_PREFIX)? {
            let info: NamespaceInfo = serde_json::from_slice(&raw)?;
            namespaces.insert(info.name.clone(), info);
        }

        let mut databases = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(SCHEMA_DATABASE_PREFIX)? {
            let info: DatabaseInfo = serde_json::from_slice(&raw)?;
            databases.insert(database_key(&info.namespace, &info.name), info);
        }

        let mut tables = BTreeMap::new();
        for (_, raw) in self.store.scan_prefix(SCHEMA_TABLE_PREFIX)? {
            let info: TableInfo = serde_json::from_slice(&raw)?;
            tables.insert(
                table_key(&info.namespace, &info.database, &info.name),
                info,
            );
        }

        let counters = match self
            .store
            .get(&format!("{SCHEMA_MAX_ID_PREFIX}{MAX_IDS_KEY_SUFFIX}"))?
        {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => SchemaCounters::default(),
        };

        *self.namespaces.write().unwrap() = namespaces;
        *self.databases.write().unwrap() = databases;
        *self.tables.write().unwrap() = tables;
        *self.counters.lock().unwrap() = counters;
        Ok(())
    }

    /// Bumps the global schema version, runs the id mutation, and persists
    /// the counters. Returns `(allocated_id, new_version)`.
    fn next_ids(
        &self,
        alloc: impl FnOnce(&mut SchemaCounters) -> u64,
    ) -> Result<(u64, u64), MetaError> {
        let mut counters = self.counters.lock().unwrap();
        counters.schema_version += 1;
        let id = alloc(&mut counters);
        let raw =
            serde_json::to_vec(&*counters).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{SCHEMA_MAX_ID_PREFIX}{MAX_IDS_KEY_SUFFIX}"), &raw)
            .map_err(MetaError::from)?;
        Ok((id, counters.schema_version))
    }

    fn mutate_table(
        &self,
        req: &SchemaReq,
        mutate: impl FnOnce(&mut TableInfo) -> Result<(), MetaError>,
    ) -> Result<(), MetaError> {
        let key = table_key(&req.namespace, &req.database, &req.table);
        let mut tables = self.tables.write().unwrap();
        let info = tables
            .get_mut(&key)
            .ok_or_else(|| MetaError::input(format!("table {key} not exist")))?;
        mutate(info)?;
        let (_, version) = self.next_ids(|_| 0)?;
        info.version = version;
        let info = info.clone();
        self.persist_table(&key, &info)?;
        Ok(())
    }

    fn persist_namespace(&self, info: &NamespaceInfo) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(info).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{SCHEMA_NAMESPACE_PREFIX}{}", info.name), &raw)
            .map_err(MetaError::from)
    }

    fn persist_database(&self, info: &DatabaseInfo) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(info).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(
                &format!(
                    "{SCHEMA_DATABASE_PREFIX}{}",
                    database_key(&info.namespace, &info.name)
                ),
                &raw,
            )
            .map_err(MetaError::from)
    }

    fn persist_table(&self, key: &str, info: &TableInfo) -> Result<(), MetaError> {
        let raw = serde_json::to_vec(info).map_err(|err| MetaError::internal(err.to_string()))?;
        self.store
            .put(&format!("{SCHEMA_TABLE_PREFIX}{key}"), &raw)
            .map_err(MetaError::from)
    }
}
