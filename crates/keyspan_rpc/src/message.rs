//! Serialized request/response types for the storage and meta planes.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Shared error code set for store and meta responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrCode {
    Success,
    NotLeader,
    TxnFollowUp,
    VersionOld,
    RegionNotExist,
    InternalError,
    ParseFromDataFail,
    UnsupportedReqType,
    InputParamError,
}

/// Statement kinds a plan fragment can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpType {
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Prepare,
    Commit,
    Rollback,
}

impl OpType {
    /// DML statements that mutate rows and participate in rollback tracking.
    pub fn is_dml(self) -> bool {
        matches!(self, OpType::Insert | OpType::Update | OpType::Delete)
    }

    /// Transaction-control statements that target every region the txn touched.
    pub fn is_txn_control(self) -> bool {
        matches!(self, OpType::Prepare | OpType::Commit | OpType::Rollback)
    }
}

/// One region descriptor: a key range replicated over a peer group.
///
/// `leader: None` means the leader is unknown and a random peer should be
/// probed. An empty `end_key` means the range is unbounded above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionInfo {
    pub region_id: u64,
    pub table_id: u64,
    pub version: u64,
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub leader: Option<SocketAddr>,
    pub peers: Vec<SocketAddr>,
}

/// Tuple layout descriptor carried alongside a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TupleDesc {
    pub tuple_id: u32,
    pub table_id: u64,
}

/// One decoded column value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Double(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
        }
    }

    /// Total ordering across variants; same-variant values compare naturally,
    /// mixed variants compare by variant rank. Null position relative to
    /// non-null values is decided by the caller (`nulls_first`).
    pub fn total_cmp(&self, other: &Value) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Row payload for one result row: encoded tuples aligned with
/// [`StoreRes::tuple_ids`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RowValues {
    pub tuple_values: Vec<Bytes>,
}

/// Plan-node kinds the fan-out core can see. Operator execution happens on
/// the store; the proxy only needs to locate the insert node for per-region
/// record substitution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlanNodeKind {
    TableScan,
    Filter,
    Limit,
    Insert,
    Update,
    Delete,
}

/// Serializable operator tree shipped to stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanNode {
    pub kind: PlanNodeKind,
    pub table_id: u64,
    /// Encoded records; only meaningful on `Insert` nodes.
    #[serde(default)]
    pub records: Vec<Bytes>,
    #[serde(default)]
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn leaf(kind: PlanNodeKind, table_id: u64) -> Self {
        Self {
            kind,
            table_id,
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Depth-first search for the first node of `kind`.
    pub fn find(&self, kind: PlanNodeKind) -> Option<&PlanNode> {
        if self.kind == kind {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(kind))
    }

    pub fn find_mut(&mut self, kind: PlanNodeKind) -> Option<&mut PlanNode> {
        if self.kind == kind {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(kind))
    }
}

/// A transactionally-scoped memo of an already-issued statement, replayed to
/// stores that have not seen earlier statements of the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachePlan {
    pub op_type: OpType,
    pub seq_id: u32,
    pub plan: PlanNode,
    pub tuple_descs: Vec<TupleDesc>,
}

/// Per-request transaction envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransactionInfo {
    pub txn_id: u64,
    pub seq_id: u32,
    pub autocommit: bool,
    pub need_rollback_seq: Vec<u32>,
    pub start_seq_id: i64,
    pub optimize_1pc: bool,
    pub cache_plans: Vec<CachePlan>,
}

/// One storage-plane query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreReq {
    pub op_type: OpType,
    pub region_id: u64,
    pub region_version: u64,
    pub log_id: u64,
    pub tuples: Vec<TupleDesc>,
    pub txn_info: TransactionInfo,
    pub plan: PlanNode,
    /// SELECT may be answered by a non-leader peer when set.
    pub select_without_leader: bool,
}

/// One storage-plane query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRes {
    pub errcode: ErrCode,
    #[serde(default)]
    pub errmsg: String,
    /// Leader hint; populated on `NotLeader` and on successful reads served
    /// by a store that knows a fresher leader.
    #[serde(default)]
    pub leader: Option<SocketAddr>,
    /// Highest seq_id this store has executed for the transaction.
    #[serde(default)]
    pub last_seq_id: Option<u32>,
    /// Post-split descendants, returned on `VersionOld`.
    #[serde(default)]
    pub regions: Vec<RegionInfo>,
    #[serde(default)]
    pub row_values: Vec<RowValues>,
    #[serde(default)]
    pub tuple_ids: Vec<u32>,
    #[serde(default)]
    pub affected_rows: i64,
    /// MySQL-level error carried through to the client verbatim.
    #[serde(default)]
    pub mysql_errcode: Option<u16>,
}

impl StoreRes {
    pub fn success() -> Self {
        Self {
            errcode: ErrCode::Success,
            errmsg: "success".to_string(),
            leader: None,
            last_seq_id: None,
            regions: Vec::new(),
            row_values: Vec::new(),
            tuple_ids: Vec::new(),
            affected_rows: 0,
            mysql_errcode: None,
        }
    }

    pub fn error(errcode: ErrCode, errmsg: impl Into<String>) -> Self {
        Self {
            errcode,
            errmsg: errmsg.into(),
            ..Self::success()
        }
    }
}

/// Storage-node liveness state tracked by the meta plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceStatus {
    Normal,
    Faulty,
    Dead,
    Migrating,
}

/// Storage-node descriptor registered with and reported to the meta plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub address: SocketAddr,
    pub capacity: u64,
    pub used_size: u64,
    #[serde(default)]
    pub resource_tag: String,
    pub physical_room: String,
    #[serde(default = "default_instance_status")]
    pub status: InstanceStatus,
}

fn default_instance_status() -> InstanceStatus {
    InstanceStatus::Normal
}

/// Heartbeat from a storage node to the meta leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeartBeatRequest {
    pub instance: InstanceInfo,
    /// Regions this store currently leads, with its view of their versions.
    #[serde(default)]
    pub leader_regions: Vec<RegionInfo>,
    #[serde(default)]
    pub schema_version: u64,
    #[serde(default)]
    pub log_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeartBeatResponse {
    pub errcode: ErrCode,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub leader: Option<SocketAddr>,
}

/// Heartbeat from a proxy to the meta leader, reporting the metadata versions
/// it already holds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyHeartBeatRequest {
    pub last_schema_version: u64,
    /// username -> privilege version the proxy has applied.
    #[serde(default)]
    pub privilege_versions: BTreeMap<String, u64>,
    #[serde(default)]
    pub log_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHeartBeatResponse {
    pub errcode: ErrCode,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub leader: Option<SocketAddr>,
    /// Tables whose schema version exceeds the reported one.
    #[serde(default)]
    pub schema_tables: Vec<TableInfo>,
    /// Users whose privilege version exceeds the reported one.
    #[serde(default)]
    pub privileges: Vec<UserPrivilege>,
    /// Region descriptors for the tables included in `schema_tables`.
    #[serde(default)]
    pub region_updates: Vec<RegionInfo>,
}

/// Read/write grant level for one privilege entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RwGrant {
    Read,
    Write,
}

/// One database- or table-scoped privilege entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivilegeEntry {
    /// `namespace.database` or `namespace.database.table`.
    pub target: String,
    pub grant: RwGrant,
}

/// A user plus its grants, versioned for heartbeat diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPrivilege {
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub version: u64,
    #[serde(default)]
    pub privileges: Vec<PrivilegeEntry>,
}

/// Schema: one namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub namespace_id: u64,
    pub name: String,
    pub version: u64,
}

/// Schema: one database inside a namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database_id: u64,
    pub namespace: String,
    pub name: String,
    pub version: u64,
}

/// Schema: one table column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: u32,
    pub name: String,
    pub mysql_type: String,
    pub can_null: bool,
}

/// Schema: one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableInfo {
    pub table_id: u64,
    pub namespace: String,
    pub database: String,
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub byte_size_per_record: u64,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub max_field_id: u32,
}

/// Closed operation set applied through the meta replicated log.
///
/// `Unknown` absorbs op types from newer releases so a mixed-version group
/// degrades to an explicit `UnsupportedReqType` instead of a decode failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaOpType {
    AddLogical,
    DropLogical,
    AddPhysical,
    DropPhysical,
    MovePhysical,
    AddInstance,
    DropInstance,
    UpdateInstance,
    CreateUser,
    DropUser,
    AddPrivilege,
    DropPrivilege,
    CreateNamespace,
    DropNamespace,
    ModifyNamespace,
    CreateDatabase,
    DropDatabase,
    ModifyDatabase,
    CreateTable,
    DropTable,
    RenameTable,
    AddField,
    DropField,
    RenameField,
    ModifyField,
    UpdateByteSize,
    DropRegion,
    UpdateRegion,
    RestoreRegion,
    SplitRegion,
    #[serde(other)]
    Unknown,
}

impl Default for MetaOpType {
    fn default() -> Self {
        MetaOpType::Unknown
    }
}

/// Payload for logical-room operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogicalRoomReq {
    pub logical_rooms: Vec<String>,
}

/// Payload for physical-room operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhysicalRoomReq {
    pub logical_room: String,
    pub physical_rooms: Vec<String>,
}

/// Payload for moving a physical room between logical rooms.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MovePhysicalReq {
    pub physical_room: String,
    pub old_logical_room: String,
    pub new_logical_room: String,
}

/// Payload for table-level schema operations (create/drop/rename/field ops).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaReq {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    /// New table name for renames.
    #[serde(default)]
    pub new_name: String,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub byte_size_per_record: u64,
}

/// Payload for a region split driven through the meta log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegionSplitReq {
    pub region_id: u64,
    pub split_key: Bytes,
    /// Leader the new child should start from.
    #[serde(default)]
    pub new_leader: Option<SocketAddr>,
}

/// One committed meta-log entry: an op type plus the payload it needs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetaRequest {
    pub op_type: MetaOpType,
    #[serde(default)]
    pub logical_rooms: Option<LogicalRoomReq>,
    #[serde(default)]
    pub physical_room: Option<PhysicalRoomReq>,
    #[serde(default)]
    pub move_physical: Option<MovePhysicalReq>,
    #[serde(default)]
    pub instance: Option<InstanceInfo>,
    #[serde(default)]
    pub user_privilege: Option<UserPrivilege>,
    #[serde(default)]
    pub namespace_info: Option<NamespaceInfo>,
    #[serde(default)]
    pub database_info: Option<DatabaseInfo>,
    #[serde(default)]
    pub table_info: Option<TableInfo>,
    #[serde(default)]
    pub schema_req: Option<SchemaReq>,
    #[serde(default)]
    pub region_info: Option<RegionInfo>,
    #[serde(default)]
    pub region_split: Option<RegionSplitReq>,
}

/// Response completed on the closure of one applied meta-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaResponse {
    pub errcode: ErrCode,
    pub errmsg: String,
    pub op_type: MetaOpType,
    /// Region id allocated by `SplitRegion`.
    #[serde(default)]
    pub new_region_id: Option<u64>,
}

impl MetaResponse {
    pub fn success(op_type: MetaOpType) -> Self {
        Self {
            errcode: ErrCode::Success,
            errmsg: "success".to_string(),
            op_type,
            new_region_id: None,
        }
    }

    pub fn error(op_type: MetaOpType, errcode: ErrCode, errmsg: impl Into<String>) -> Self {
        Self {
            errcode,
            errmsg: errmsg.into(),
            op_type,
            new_region_id: None,
        }
    }
}
