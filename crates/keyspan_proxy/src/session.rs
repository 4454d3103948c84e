//! Per-client-session transaction state.
//!
//! One `SessionState` lives for the duration of a client connection. The
//! session thread drives statements one at a time, but executor worker tasks
//! belonging to the same session read the cached plans and mutate the pinned
//! region snapshot concurrently, so everything here is internally
//! synchronized. `cache_plans` has a single writer (the session thread
//! between statements); the lock is what publishes entries to worker tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use keyspan_rpc::{CachePlan, RegionInfo};

/// MySQL-level error carried from a store response to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: u16,
    pub msg: String,
}

#[derive(Default)]
pub struct SessionState {
    /// Active transaction id; 0 means no transaction.
    txn_id: AtomicU64,
    /// Statement sequence inside the transaction, monotonically increasing.
    seq_id: AtomicU32,
    autocommit: AtomicBool,
    optimize_1pc: AtomicBool,
    /// seq_id -> cached statement, replayed to stores that missed it.
    cache_plans: RwLock<BTreeMap<u32, CachePlan>>,
    /// Statements that failed on some store and must be rolled back at commit.
    need_rollback_seq: Mutex<BTreeSet<u32>>,
    /// Regions this transaction has touched; commit/rollback fan out to these.
    region_infos: Mutex<HashMap<u64, RegionInfo>>,
    sql_error: Mutex<Option<SqlError>>,
}

impl SessionState {
    pub fn new() -> Self {
        let state = Self::default();
        state.autocommit.store(true, Ordering::Release);
        state
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id.load(Ordering::Acquire)
    }

    pub fn seq_id(&self) -> u32 {
        self.seq_id.load(Ordering::Acquire)
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    pub fn set_autocommit(&self, autocommit: bool) {
        self.autocommit.store(autocommit, Ordering::Release);
    }

    pub fn optimize_1pc(&self) -> bool {
        self.optimize_1pc.load(Ordering::Acquire)
    }

    pub fn set_optimize_1pc(&self, value: bool) {
        self.optimize_1pc.store(value, Ordering::Release);
    }

    /// Opens a transaction. The id stays fixed until the txn terminates.
    pub fn begin_txn(&self, txn_id: u64) {
        debug_assert_ne!(txn_id, 0);
        self.txn_id.store(txn_id, Ordering::Release);
        self.seq_id.store(0, Ordering::Release);
        self.optimize_1pc.store(false, Ordering::Release);
    }

    /// Allocates the next statement sequence id.
    pub fn next_stmt(&self) -> u32 {
        self.seq_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clears all transaction-scoped state after commit/rollback completes.
    pub fn end_txn(&self) {
        self.txn_id.store(0, Ordering::Release);
        self.seq_id.store(0, Ordering::Release);
        self.optimize_1pc.store(false, Ordering::Release);
        self.cache_plans.write().unwrap().clear();
        self.need_rollback_seq.lock().unwrap().clear();
        self.region_infos.lock().unwrap().clear();
    }

    pub fn insert_cache_plan(&self, plan: CachePlan) {
        self.cache_plans.write().unwrap().insert(plan.seq_id, plan);
    }

    pub fn cache_plans_len(&self) -> usize {
        self.cache_plans.read().unwrap().len()
    }

    /// Cached plans with `start_seq_id <= seq_id < end_seq_id`, in order.
    /// A store may hint a `last_seq_id` past our own counter; that yields an
    /// empty replay, not an error.
    pub fn cache_plans_in_range(&self, start_seq_id: i64, end_seq_id: u32) -> Vec<CachePlan> {
        let start = if start_seq_id <= 0 { 0 } else { start_seq_id as u32 };
        if start >= end_seq_id {
            return Vec::new();
        }
        self.cache_plans
            .read()
            .unwrap()
            .range(start..end_seq_id)
            .map(|(_, plan)| plan.clone())
            .collect()
    }

    /// Whether any cached statement mutates rows. Drives the 1PC decision.
    pub fn transaction_has_write(&self) -> bool {
        self.cache_plans
            .read()
            .unwrap()
            .values()
            .any(|plan| plan.op_type.is_dml())
    }

    pub fn add_need_rollback(&self, seq_id: u32) {
        self.need_rollback_seq.lock().unwrap().insert(seq_id);
    }

    pub fn need_rollback_vec(&self) -> Vec<u32> {
        self.need_rollback_seq
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    pub fn region_infos_snapshot(&self) -> HashMap<u64, RegionInfo> {
        self.region_infos.lock().unwrap().clone()
    }

    pub fn region_infos_len(&self) -> usize {
        self.region_infos.lock().unwrap().len()
    }

    pub fn region_info(&self, region_id: u64) -> Option<RegionInfo> {
        self.region_infos.lock().unwrap().get(&region_id).cloned()
    }

    /// Pins a region for later commit/rollback fan-out; keeps any existing
    /// entry (a concurrent worker may already have installed a fresher one).
    pub fn pin_region(&self, info: &RegionInfo) {
        self.region_infos
            .lock()
            .unwrap()
            .entry(info.region_id)
            .or_insert_with(|| info.clone());
    }

    /// Pins every region of a planner-produced target set.
    pub fn pin_regions<'a>(&self, infos: impl IntoIterator<Item = &'a RegionInfo>) {
        let mut regions = self.region_infos.lock().unwrap();
        for info in infos {
            regions
                .entry(info.region_id)
                .or_insert_with(|| info.clone());
        }
    }

    /// Installs or overwrites a region entry (post-split child).
    pub fn install_region(&self, info: RegionInfo) {
        self.region_infos
            .lock()
            .unwrap()
            .insert(info.region_id, info);
    }

    pub fn update_region_leader(&self, region_id: u64, leader: SocketAddr) {
        if let Some(info) = self.region_infos.lock().unwrap().get_mut(&region_id) {
            info.leader = Some(leader);
        }
    }

    /// Narrows the pinned parent after a split: new end key and version, plus
    /// the leader when the store reported one.
    pub fn narrow_region(&self, region_id: u64, narrowed: &RegionInfo) {
        if let Some(info) = self.region_infos.lock().unwrap().get_mut(&region_id) {
            info.end_key = narrowed.end_key.clone();
            info.version = narrowed.version;
            if narrowed.leader.is_some() {
                info.leader = narrowed.leader;
            }
        }
    }

    pub fn set_sql_error(&self, code: u16, msg: impl Into<String>) {
        *self.sql_error.lock().unwrap() = Some(SqlError {
            code,
            msg: msg.into(),
        });
    }

    pub fn take_sql_error(&self) -> Option<SqlError> {
        self.sql_error.lock().unwrap().take()
    }
}
