//! Wire contracts shared between the keyspan proxy and the storage/meta planes.
//!
//! The proxy never links the storage engine directly; everything it knows
//! about a store travels through [`StoreReq`]/[`StoreRes`], and everything the
//! meta plane learns from heartbeats travels through the heartbeat payloads in
//! [`message`]. The [`service`] module holds the `async_trait` seams the
//! executor and the meta state machine are written against, and [`transport`]
//! provides a framed-TCP client/server pair for the storage plane.

pub mod keys;
pub mod message;
pub mod service;
pub mod transport;

pub use keys::{end_key_cmp, key_in_range};
pub use message::{
    CachePlan, DatabaseInfo, ErrCode, FieldInfo, InstanceInfo, InstanceStatus, LogicalRoomReq,
    MetaOpType, MetaRequest, MetaResponse, MovePhysicalReq, NamespaceInfo, OpType, PhysicalRoomReq,
    PlanNode, PlanNodeKind, PrivilegeEntry, ProxyHeartBeatRequest, ProxyHeartBeatResponse,
    RegionInfo, RegionSplitReq, RowValues, RwGrant, SchemaReq, StoreHeartBeatRequest,
    StoreHeartBeatResponse, StoreReq, StoreRes, TableInfo, TransactionInfo, TupleDesc,
    UserPrivilege, Value,
};
pub use service::{MetaService, RpcError, StoreHandler, StoreService};
