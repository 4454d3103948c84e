//! The meta state machine driven by the replicated log.
//!
//! Apply routing: each committed entry decodes into a `MetaRequest` and is
//! handed to the manager owning its op type. Entry closures are completed by
//! sending the response over a oneshot; the proposing task resumes on its own
//! scheduler thread, never on the apply loop.
//!
//! Heartbeats are leader-gated. A non-leader answers `NotLeader` with the
//! current leader endpoint and mutates nothing, so callers redirect instead
//! of feeding a stale view.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use keyspan_rpc::{
    ErrCode, MetaOpType, MetaRequest, MetaResponse, MetaService, ProxyHeartBeatRequest,
    ProxyHeartBeatResponse, StoreHeartBeatRequest, StoreHeartBeatResponse,
};
use tokio::task::JoinHandle;

use crate::cluster_manager::ClusterManager;
use crate::config::MetaConfig;
use crate::error::MetaError;
use crate::keyspace::{MetaStore, CLUSTER_PREFIX, MAX_IDENTIFIER};
use crate::privilege_manager::PrivilegeManager;
use crate::raft::{LeaderStatus, LogEntry, SnapshotReader, SnapshotWriter};
use crate::region_manager::RegionManager;
use crate::schema_manager::SchemaManager;

/// Snapshot artifact name; the single ordered-KV dump of the meta namespace.
pub const SNAPSHOT_FILE: &str = "meta_info.sst";

pub struct MetaStateMachine {
    store: Arc<MetaStore>,
    pub cluster: ClusterManager,
    pub privilege: PrivilegeManager,
    pub schema: SchemaManager,
    pub regions: RegionManager,
    leader: Arc<dyn LeaderStatus>,
    config: MetaConfig,
    /// Mirror of the consensus node's view, flipped by the lifecycle hooks.
    is_leader: AtomicBool,
    leader_start_us: AtomicU64,
    load_balance: AtomicBool,
    unsafe_decision: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MetaStateMachine {
    pub fn new(
        store: Arc<MetaStore>,
        leader: Arc<dyn LeaderStatus>,
        config: MetaConfig,
    ) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            cluster: ClusterManager::new(store.clone())?,
            privilege: PrivilegeManager::new(store.clone())?,
            schema: SchemaManager::new(store.clone())?,
            regions: RegionManager::new(store.clone())?,
            store,
            leader,
            config,
            is_leader: AtomicBool::new(false),
            leader_start_us: AtomicU64::new(0),
            load_balance: AtomicBool::new(false),
            unsafe_decision: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }))
    }

    /// Applies a batch of committed entries in log order.
    pub fn on_apply(&self, entries: Vec<LogEntry>) {
        for entry in entries {
            let request: MetaRequest = match serde_json::from_slice(&entry.data) {
                Ok(request) => request,
                Err(err) => {
                    tracing::error!(
                        term = entry.term,
                        index = entry.index,
                        error = %err,
                        "meta request decode failed on apply"
                    );
                    if let Some(done) = entry.done {
                        let latency = done.elapsed();
                        tracing::debug!(raft_latency = ?latency, "completing failed closure");
                        done.complete(MetaResponse::error(
                            MetaOpType::Unknown,
                            ErrCode::ParseFromDataFail,
                            "parse from data fail",
                        ));
                    }
                    continue;
                }
            };

            tracing::info!(
                term = entry.term,
                index = entry.index,
                op_type = ?request.op_type,
                "on apply"
            );
            let response = match self.apply_request(&request) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        op_type = ?request.op_type,
                        errcode = ?err.errcode,
                        error = %err,
                        "meta apply rejected"
                    );
                    MetaResponse::error(request.op_type, err.errcode, err.msg)
                }
            };
            if let Some(done) = entry.done {
                tracing::debug!(
                    op_type = ?request.op_type,
                    raft_latency = ?done.elapsed(),
                    "completing apply closure"
                );
                done.complete(response);
            }
        }
    }

    fn apply_request(&self, request: &MetaRequest) -> Result<MetaResponse, MetaError> {
        use MetaOpType::*;

        fn need<'a, T>(field: &'a Option<T>, what: &str) -> Result<&'a T, MetaError> {
            field
                .as_ref()
                .ok_or_else(|| MetaError::input(format!("request missing {what}")))
        }

        let op_type = request.op_type;
        match op_type {
            AddLogical => self
                .cluster
                .add_logical(need(&request.logical_rooms, "logical rooms")?)?,
            DropLogical => self
                .cluster
                .drop_logical(need(&request.logical_rooms, "logical rooms")?)?,
            AddPhysical => self
                .cluster
                .add_physical(need(&request.physical_room, "physical room")?)?,
            DropPhysical => self
                .cluster
                .drop_physical(need(&request.physical_room, "physical room")?)?,
            MovePhysical => self
                .cluster
                .move_physical(need(&request.move_physical, "move request")?)?,
            AddInstance => self
                .cluster
                .add_instance(need(&request.instance, "instance")?)?,
            DropInstance => self
                .cluster
                .drop_instance(need(&request.instance, "instance")?)?,
            UpdateInstance => self
                .cluster
                .update_instance(need(&request.instance, "instance")?)?,
            CreateUser => self
                .privilege
                .create_user(need(&request.user_privilege, "user")?)?,
            DropUser => self
                .privilege
                .drop_user(need(&request.user_privilege, "user")?)?,
            AddPrivilege => self
                .privilege
                .add_privilege(need(&request.user_privilege, "user")?)?,
            DropPrivilege => self
                .privilege
                .drop_privilege(need(&request.user_privilege, "user")?)?,
            CreateNamespace => self
                .schema
                .create_namespace(need(&request.namespace_info, "namespace")?)?,
            DropNamespace => self
                .schema
                .drop_namespace(need(&request.namespace_info, "namespace")?)?,
            ModifyNamespace => self
                .schema
                .modify_namespace(need(&request.namespace_info, "namespace")?)?,
            CreateDatabase => self
                .schema
                .create_database(need(&request.database_info, "database")?)?,
            DropDatabase => self
                .schema
                .drop_database(need(&request.database_info, "database")?)?,
            ModifyDatabase => self
                .schema
                .modify_database(need(&request.database_info, "database")?)?,
            CreateTable => {
                self.schema
                    .create_table(need(&request.table_info, "table")?)?;
            }
            DropTable => self.schema.drop_table(need(&request.schema_req, "schema request")?)?,
            RenameTable => self
                .schema
                .rename_table(need(&request.schema_req, "schema request")?)?,
            AddField => self
                .schema
                .add_field(need(&request.schema_req, "schema request")?)?,
            DropField => self
                .schema
                .drop_field(need(&request.schema_req, "schema request")?)?,
            RenameField => self
                .schema
                .rename_field(need(&request.schema_req, "schema request")?)?,
            ModifyField => self
                .schema
                .modify_field(need(&request.schema_req, "schema request")?)?,
            UpdateByteSize => self
                .schema
                .update_byte_size(need(&request.schema_req, "schema request")?)?,
            DropRegion => self
                .regions
                .drop_region(need(&request.region_info, "region")?.region_id)?,
            UpdateRegion => self
                .regions
                .update_region(need(&request.region_info, "region")?)?,
            RestoreRegion => self
                .regions
                .restore_region(need(&request.region_info, "region")?.region_id)?,
            SplitRegion => {
                let child_id = self
                    .regions
                    .split_region(need(&request.region_split, "split request")?)?;
                let mut response = MetaResponse::success(op_type);
                response.new_region_id = Some(child_id);
                return Ok(response);
            }
            Unknown => {
                return Err(MetaError {
                    errcode: ErrCode::UnsupportedReqType,
                    msg: "unsupport request type".to_string(),
                })
            }
        }
        Ok(MetaResponse::success(op_type))
    }

    /// Streams the meta namespace into `<snapshot>/meta_info.sst` and
    /// registers the file. Runs on a blocking worker, not the apply thread.
    pub async fn on_snapshot_save(&self, writer: Arc<dyn SnapshotWriter>) -> anyhow::Result<()> {
        tracing::info!(
            max_table_id = self.schema.max_table_id(),
            max_region_id = self.regions.max_region_id(),
            schema_version = self.schema.schema_version(),
            "snapshot save starting"
        );
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || save_snapshot(&store, writer.as_ref()))
            .await
            .map_err(|err| anyhow::anyhow!("snapshot save task failed: {err}"))?
    }

    /// Installs a received snapshot: clear `[CLUSTER, MAX)`, ingest the
    /// ordered-KV file, repopulate every manager from storage.
    pub fn on_snapshot_load(&self, reader: &dyn SnapshotReader) -> anyhow::Result<()> {
        let removed = self
            .store
            .remove_range(CLUSTER_PREFIX, MAX_IDENTIFIER)
            .context("clear meta namespace")?;
        tracing::info!(removed, "cleared meta namespace for snapshot load");

        for file in reader.list_files() {
            if file != SNAPSHOT_FILE {
                continue;
            }
            let path = reader.path().join(&file);
            let pairs = read_snapshot_file(&path)
                .with_context(|| format!("read snapshot file {}", path.display()))?;
            tracing::info!(entries = pairs.len(), "ingesting snapshot file");
            self.store.ingest(&pairs).context("ingest snapshot")?;

            self.cluster.load_snapshot().context("cluster load")?;
            self.privilege.load_snapshot().context("privilege load")?;
            self.schema.load_snapshot().context("schema load")?;
            self.regions.load_snapshot().context("region load")?;
        }
        Ok(())
    }

    /// Leadership gained: stale statuses reset (heartbeats reconfirm them)
    /// and the health sweeper starts.
    pub fn on_leader_start(self: &Arc<Self>) {
        tracing::info!("meta leader start at new term");
        self.cluster.reset_instance_status();
        self.regions.reset_region_status();
        self.leader_start_us.store(epoch_micros(), Ordering::Release);
        self.is_leader.store(true, Ordering::Release);

        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_some() {
            tracing::error!("health sweeper already running");
            return;
        }
        let machine = self.clone();
        *sweeper = Some(tokio::spawn(async move {
            machine.healthy_check_loop().await;
        }));
    }

    /// Leadership lost: no balancing, no unsafe decisions, sweeper stops.
    pub async fn on_leader_stop(&self) {
        self.is_leader.store(false, Ordering::Release);
        self.load_balance.store(false, Ordering::Release);
        self.unsafe_decision.store(false, Ordering::Release);
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "health sweeper join failed");
            }
        }
        tracing::info!("meta leader stop");
    }

    /// Rebalance decisions are only safe once this node has been leader long
    /// enough to have collected a fresh view from every store.
    pub fn whether_can_decide(&self) -> bool {
        if !self.leader.is_leader() {
            return false;
        }
        let started = self.leader_start_us.load(Ordering::Acquire);
        let elapsed = epoch_micros().saturating_sub(started);
        elapsed > self.config.decide_after().as_micros() as u64
    }

    pub fn set_load_balance(&self, on: bool) {
        self.load_balance.store(on, Ordering::Release);
    }

    pub fn load_balance(&self) -> bool {
        self.load_balance.load(Ordering::Acquire)
    }

    async fn healthy_check_loop(self: Arc<Self>) {
        tracing::info!("health sweeper started");
        let mut count: u64 = 0;
        let interval_ms = (self.config.healthy_check_interval_times as u128
            * self.config.store_heartbeat_interval.as_millis())
        .max(1) as u64;
        while self.sweeping() {
            // Sleep in 1ms increments so losing leadership cancels promptly.
            let mut slept = 0u64;
            while slept < interval_ms {
                if !self.sweeping() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                slept += 1;
            }
            tracing::info!(count, "health sweep (regions and stores)");
            count += 1;
            self.cluster.store_healthy_check(self.config.faulty_after());
            self.regions.region_healthy_check(self.config.faulty_after());
        }
    }

    fn sweeping(&self) -> bool {
        self.is_leader.load(Ordering::Acquire) && self.leader.is_leader()
    }

    #[cfg(test)]
    fn force_leader_start_us(&self, value: u64) {
        self.leader_start_us.store(value, Ordering::Release);
    }
}

#[async_trait]
impl MetaService for MetaStateMachine {
    async fn store_heartbeat(&self, req: StoreHeartBeatRequest) -> StoreHeartBeatResponse {
        let started = std::time::Instant::now();
        if !self.leader.is_leader() {
            tracing::warn!(log_id = req.log_id, "store heartbeat on non-leader");
            return StoreHeartBeatResponse {
                errcode: ErrCode::NotLeader,
                errmsg: "not leader".to_string(),
                leader: self.leader.leader_endpoint(),
            };
        }

        let instance_started = std::time::Instant::now();
        self.cluster.process_instance_heartbeat(&req.instance);
        let instance_time = instance_started.elapsed();

        let region_started = std::time::Instant::now();
        self.regions.process_leader_heartbeat(&req.leader_regions);
        let region_time = region_started.elapsed();

        tracing::info!(
            store = %req.instance.address,
            elapsed = ?started.elapsed(),
            instance_time = ?instance_time,
            region_time = ?region_time,
            leader_regions = req.leader_regions.len(),
            log_id = req.log_id,
            "store heartbeat"
        );
        StoreHeartBeatResponse {
            errcode: ErrCode::Success,
            errmsg: "success".to_string(),
            leader: None,
        }
    }

    async fn proxy_heartbeat(&self, req: ProxyHeartBeatRequest) -> ProxyHeartBeatResponse {
        let started = std::time::Instant::now();
        if !self.leader.is_leader() {
            tracing::warn!(log_id = req.log_id, "proxy heartbeat on non-leader");
            return ProxyHeartBeatResponse {
                errcode: ErrCode::NotLeader,
                errmsg: "not leader".to_string(),
                leader: self.leader.leader_endpoint(),
                schema_tables: Vec::new(),
                privileges: Vec::new(),
                region_updates: Vec::new(),
            };
        }

        let privileges = self.privilege.privileges_newer_than(&req.privilege_versions);
        let schema_tables = self.schema.tables_newer_than(req.last_schema_version);
        let table_ids: Vec<u64> = schema_tables.iter().map(|table| table.table_id).collect();
        let region_updates = self.regions.regions_for_tables(&table_ids);

        tracing::info!(
            elapsed = ?started.elapsed(),
            schema_tables = schema_tables.len(),
            privileges = privileges.len(),
            region_updates = region_updates.len(),
            log_id = req.log_id,
            "proxy heartbeat"
        );
        ProxyHeartBeatResponse {
            errcode: ErrCode::Success,
            errmsg: "success".to_string(),
            leader: None,
            schema_tables,
            privileges,
            region_updates,
        }
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

fn save_snapshot(store: &MetaStore, writer: &dyn SnapshotWriter) -> anyhow::Result<()> {
    let path = writer.path().join(SNAPSHOT_FILE);
    let file = File::create(&path)
        .with_context(|| format!("create snapshot file {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let pairs = store.dump_range(CLUSTER_PREFIX, MAX_IDENTIFIER)?;
    let entries = pairs.len();
    for (key, value) in pairs {
        write_record(&mut out, &key, &value).context("write snapshot record")?;
    }
    out.flush().context("flush snapshot file")?;
    out.into_inner()
        .map_err(|err| anyhow::anyhow!("snapshot buffer: {err}"))?
        .sync_all()
        .context("sync snapshot file")?;

    writer.add_file(SNAPSHOT_FILE)?;
    tracing::info!(entries, path = %path.display(), "snapshot file written");
    Ok(())
}

/// Record layout: u32 payload length, u32 crc32, payload. The payload is
/// u32 key length, key bytes, value bytes.
fn write_record<W: Write>(out: &mut W, key: &[u8], value: &[u8]) -> std::io::Result<()> {
    let mut payload = Vec::with_capacity(4 + key.len() + value.len());
    payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(&checksum.to_be_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

fn read_snapshot_file(path: &Path) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut pairs = Vec::new();
    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "snapshot checksum mismatch");

        anyhow::ensure!(payload.len() >= 4, "snapshot record too short");
        let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        anyhow::ensure!(4 + key_len <= payload.len(), "snapshot record key overruns");
        let key = payload[4..4 + key_len].to_vec();
        let value = payload[4 + key_len..].to_vec();
        pairs.push((key, value));
    }
    Ok(pairs)
}
