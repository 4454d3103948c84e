//! Replicated cluster-metadata state machine for the keyspan middleware.
//!
//! Committed log entries carry a [`keyspan_rpc::MetaRequest`]; the state
//! machine routes each to the manager owning that operation's key-space
//! prefix. The on-disk form (an ordered key/value namespace in [`keyspace`])
//! is authoritative: snapshots are a range dump of `[CLUSTER, MAX)`, and
//! `load_snapshot` rebuilds every in-memory manager from storage alone.

pub mod cluster_manager;
pub mod config;
pub mod error;
pub mod keyspace;
pub mod privilege_manager;
pub mod raft;
pub mod region_manager;
pub mod schema_manager;
pub mod state_machine;

pub use cluster_manager::ClusterManager;
pub use config::MetaConfig;
pub use error::MetaError;
pub use keyspace::MetaStore;
pub use privilege_manager::PrivilegeManager;
pub use raft::{
    ApplyClosure, DirSnapshotReader, DirSnapshotWriter, LeaderStatus, LogEntry, SnapshotReader,
    SnapshotWriter, StaticLeaderStatus,
};
pub use region_manager::RegionManager;
pub use schema_manager::SchemaManager;
pub use state_machine::MetaStateMachine;
