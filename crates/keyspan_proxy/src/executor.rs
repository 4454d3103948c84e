//! The fan-out executor: dispatches one plan fragment to every region it
//! touches, with bounded per-store concurrency and per-region retry,
//! redirect, replay, and split handling.
//!
//! Concurrency shape: one store-worker task per distinct leader endpoint, all
//! running in parallel; inside a store-worker each region RPC runs as its own
//! task gated by a counting semaphore. The caller waits on both layers, so no
//! task outlives the call even when a peer region has already failed; the
//! latched error flag only stops new work.
//!
//! Within one `(region, txn)` pair RPCs are strictly sequential: the retry
//! loop holds the only in-flight request for its region, and split children
//! are driven serially by their parent.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use keyspan_rpc::{
    end_key_cmp, CachePlan, ErrCode, OpType, RegionInfo, StoreReq, StoreService, TransactionInfo,
};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ProxyConfig;
use crate::directory::RegionDirectory;
use crate::error::FanoutError;
use crate::fragment::{Fragment, MemRow, RowBatch, RowComparator};
use crate::merger::Sorter;
use crate::session::SessionState;

/// Total attempts allowed per region, across every retry reason.
const RETRY_BUDGET: u32 = 5;

/// Per-statement execution context handed in by the session layer.
pub struct QueryContext {
    pub session: Arc<SessionState>,
    /// Correlation id propagated to every downstream RPC.
    pub log_id: u64,
}

/// Row batches gathered from successful SELECT responses, keyed for
/// start-key-ordered draining.
#[derive(Default)]
struct Gather {
    start_key_sort: BTreeMap<Bytes, u64>,
    region_batch: HashMap<u64, RowBatch>,
}

/// State shared by every task of one `open` call.
struct Shared {
    fragment: Arc<Fragment>,
    session: Arc<SessionState>,
    directory: Arc<RegionDirectory>,
    store: Arc<dyn StoreService>,
    config: ProxyConfig,
    log_id: u64,
    /// Latched on the first per-region fatal; stops new dispatches.
    error: AtomicBool,
    first_error: Mutex<Option<FanoutError>>,
    affected_rows: AtomicI64,
    gather: Mutex<Gather>,
}

pub struct FanoutExecutor {
    fragment: Arc<Fragment>,
    /// Planner-produced target regions for this fragment.
    target_regions: HashMap<u64, RegionInfo>,
    /// Insert records grouped by destination region.
    records_by_region: BTreeMap<u64, Vec<Bytes>>,
    directory: Arc<RegionDirectory>,
    store: Arc<dyn StoreService>,
    config: ProxyConfig,
    sorter: Sorter,
    rows_returned: usize,
}

impl FanoutExecutor {
    pub fn new(
        fragment: Fragment,
        target_regions: HashMap<u64, RegionInfo>,
        records_by_region: BTreeMap<u64, Vec<Bytes>>,
        directory: Arc<RegionDirectory>,
        store: Arc<dyn StoreService>,
        config: ProxyConfig,
    ) -> Self {
        let comparator = if fragment.sort_keys.is_empty() {
            None
        } else {
            Some(RowComparator::new(fragment.sort_keys.clone()))
        };
        Self {
            fragment: Arc::new(fragment),
            target_regions,
            records_by_region,
            directory,
            store,
            config,
            sorter: Sorter::new(comparator),
            rows_returned: 0,
        }
    }

    /// Dispatches the fragment. Returns the summed affected rows for
    /// mutating statements, 0 for SELECT (rows are pulled via [`get_next`]).
    ///
    /// COMMIT failures are final here but retriable above: the session layer
    /// re-issues the COMMIT against the (deliberately untouched) region
    /// snapshot until it lands.
    ///
    /// [`get_next`]: FanoutExecutor::get_next
    pub async fn open(&mut self, ctx: &QueryContext) -> Result<i64, FanoutError> {
        let session = &ctx.session;
        let op_type = self.fragment.op_type;
        let started = Instant::now();

        // Transaction-control statements go to every region the transaction
        // touched, not just the fragment's planned targets.
        let targets: HashMap<u64, RegionInfo> = if op_type.is_txn_control() {
            session.region_infos_snapshot()
        } else {
            self.target_regions.clone()
        };

        if targets.is_empty() {
            self.cache_fragment(session)?;
            if op_type == OpType::Prepare {
                // Degenerate prepare: nothing was dispatched anywhere.
                session.set_optimize_1pc(true);
            }
            return Ok(0);
        }

        // Autocommit DML is deferred: cache the statement, pin its regions,
        // and let the following PREPARE replay BEGIN + DML together.
        if op_type.is_dml() && session.autocommit() && session.txn_id() != 0 {
            self.cache_fragment(session)?;
            session.pin_regions(targets.values());
            return Ok(0);
        }

        // Group regions by their current leader guess; one store-worker per
        // endpoint.
        let mut by_leader: BTreeMap<Option<SocketAddr>, Vec<u64>> = BTreeMap::new();
        for (region_id, info) in &targets {
            by_leader.entry(info.leader).or_default().push(*region_id);
        }

        // 2PC collapses to one round when a prepare touches a single region
        // or the transaction never wrote.
        if op_type == OpType::Prepare {
            let single_region = by_leader.len() == 1
                && by_leader.values().next().map(Vec::len) == Some(1);
            if single_region || !session.transaction_has_write() {
                session.set_optimize_1pc(true);
                tracing::info!(
                    txn_id = session.txn_id(),
                    seq_id = session.seq_id(),
                    "enable optimize_1pc"
                );
            }
        }

        let shared = Arc::new(Shared {
            fragment: self.fragment.clone(),
            session: session.clone(),
            directory: self.directory.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            log_id: ctx.log_id,
            error: AtomicBool::new(false),
            first_error: Mutex::new(None),
            affected_rows: AtomicI64::new(0),
            gather: Mutex::new(Gather::default()),
        });

        let start_seq_id = session.seq_id() as i64;
        let mut workers = JoinSet::new();
        for (_, region_ids) in by_leader {
            let mut dispatches = Vec::with_capacity(region_ids.len());
            for region_id in region_ids {
                let Some(info) = targets.get(&region_id) else {
                    continue;
                };
                let records = self
                    .records_by_region
                    .get(&region_id)
                    .cloned()
                    .map(Arc::new);
                dispatches.push((region_id, info.clone(), records));
            }

            let shared = shared.clone();
            workers.spawn(async move {
                let semaphore =
                    Arc::new(Semaphore::new(shared.config.single_store_concurrency.max(1)));
                let mut rpcs = JoinSet::new();
                for (region_id, info, records) in dispatches {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let shared = shared.clone();
                    rpcs.spawn(async move {
                        let _permit = permit;
                        let result = shared
                            .clone()
                            .send_request(info, records, region_id, 0, start_seq_id)
                            .await;
                        if let Err(err) = result {
                            tracing::warn!(
                                region_id,
                                log_id = shared.log_id,
                                error = %err,
                                "region dispatch failed"
                            );
                            shared.record_error(err);
                        }
                    });
                }
                while rpcs.join_next().await.is_some() {}
            });
        }
        while workers.join_next().await.is_some() {}

        if shared.error.load(Ordering::Acquire) {
            tracing::error!(
                log_id = ctx.log_id,
                txn_id = session.txn_id(),
                seq_id = session.seq_id(),
                "fan-out open failed"
            );
            if op_type.is_dml() {
                // A later COMMIT must roll this statement back on the stores
                // that did apply it.
                session.add_need_rollback(session.seq_id());
            }
            let err = shared
                .first_error
                .lock()
                .unwrap()
                .take()
                .unwrap_or(FanoutError::Aborted);
            return Err(err);
        }

        tracing::debug!(
            log_id = ctx.log_id,
            txn_id = session.txn_id(),
            elapsed = ?started.elapsed(),
            "fan-out complete"
        );

        if op_type == OpType::Select {
            // Drain per-region batches in ascending start-key order; the
            // merger re-imposes sort-key order when keys were declared.
            let mut gather = shared.gather.lock().unwrap();
            let order: Vec<u64> = gather.start_key_sort.values().copied().collect();
            for region_id in order {
                if let Some(batch) = gather.region_batch.remove(&region_id) {
                    if !batch.is_empty() {
                        self.sorter.add_batch(batch);
                    }
                }
            }
            drop(gather);
            self.sorter.merge_sort();
        }

        self.cache_fragment(session)?;
        Ok(shared.affected_rows.load(Ordering::Acquire))
    }

    /// Pulls the next batch of merged rows, honoring the fragment's LIMIT.
    pub fn get_next(&mut self, out: &mut RowBatch, eos: &mut bool) {
        if let Some(limit) = self.fragment.limit {
            if self.rows_returned >= limit {
                *eos = true;
                return;
            }
        }
        self.sorter.get_next(out, eos);
        if let Some(limit) = self.fragment.limit {
            let remaining = limit - self.rows_returned;
            if out.size() > remaining {
                out.truncate(remaining);
            }
            self.rows_returned += out.size();
            if self.rows_returned >= limit {
                *eos = true;
            }
        } else {
            self.rows_returned += out.size();
        }
    }

    /// Memoizes this statement in the session so later requests can replay it
    /// to stores that have not seen it. Only DML and BEGIN are cached; the
    /// insert plan carries the full record set across all regions.
    fn cache_fragment(&self, session: &SessionState) -> Result<(), FanoutError> {
        if session.txn_id() == 0 {
            return Ok(());
        }
        let op_type = self.fragment.op_type;
        if !matches!(
            op_type,
            OpType::Insert | OpType::Update | OpType::Delete | OpType::Begin
        ) {
            return Ok(());
        }

        let mut plan = self.fragment.plan.clone();
        if op_type == OpType::Insert {
            match plan.find_mut(keyspan_rpc::PlanNodeKind::Insert) {
                Some(node) => {
                    node.records = self
                        .records_by_region
                        .values()
                        .flat_map(|records| records.iter().cloned())
                        .collect();
                }
                None if !session.autocommit() => return Err(FanoutError::MissingInsertNode),
                None => {}
            }
        }

        session.insert_cache_plan(CachePlan {
            op_type,
            seq_id: session.seq_id(),
            plan,
            tuple_descs: self.fragment.tuple_descs.clone(),
        });
        Ok(())
    }
}

impl Shared {
    fn record_error(&self, err: FanoutError) {
        self.error.store(true, Ordering::Release);
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// The per-region RPC state machine. Same-region retries drive the loop;
    /// split children recurse with a shared retry budget.
    fn send_request(
        self: Arc<Self>,
        mut info: RegionInfo,
        records: Option<Arc<Vec<Bytes>>>,
        region_id: u64,
        mut retry_times: u32,
        mut start_seq_id: i64,
    ) -> BoxFuture<'static, Result<(), FanoutError>> {
        Box::pin(async move {
            let op_type = self.fragment.op_type;
            loop {
                if self.error.load(Ordering::Acquire) {
                    tracing::warn!(
                        region_id,
                        log_id = self.log_id,
                        "peer region failed, skipping dispatch"
                    );
                    return Err(FanoutError::Aborted);
                }
                if retry_times >= RETRY_BUDGET {
                    tracing::warn!(
                        region_id,
                        txn_id = self.session.txn_id(),
                        log_id = self.log_id,
                        retry = retry_times,
                        "retry budget exhausted"
                    );
                    return Err(FanoutError::RetryExhausted { region_id });
                }

                if info.leader.is_none() {
                    info.leader = random_peer(&info);
                    if info.leader.is_none() {
                        return Err(FanoutError::LeaderUnknown { region_id });
                    }
                }

                // First statement after BEGIN in an explicit transaction, and
                // any autocommit prepare, replay from the very beginning so
                // BEGIN travels with the DML.
                if self.session.cache_plans_len() == 1 && !self.session.autocommit() {
                    start_seq_id = 1;
                }
                if self.session.autocommit() && op_type == OpType::Prepare {
                    start_seq_id = 1;
                }

                let mut txn_info = TransactionInfo {
                    txn_id: self.session.txn_id(),
                    seq_id: self.session.seq_id(),
                    autocommit: self.session.autocommit(),
                    need_rollback_seq: self.session.need_rollback_vec(),
                    start_seq_id,
                    optimize_1pc: self.session.optimize_1pc(),
                    cache_plans: Vec::new(),
                };

                // Replay cached statements this store may have missed.
                // Rollback and commit never carry the cache.
                if start_seq_id >= 0 && op_type != OpType::Rollback && op_type != OpType::Commit {
                    for plan in self
                        .session
                        .cache_plans_in_range(start_seq_id, self.session.seq_id())
                    {
                        if op_type == OpType::Prepare && plan.op_type == OpType::Prepare {
                            continue;
                        }
                        if let Some(desc) = plan.tuple_descs.first() {
                            if desc.table_id != info.table_id {
                                tracing::warn!(
                                    region_id,
                                    cached_table = desc.table_id,
                                    region_table = info.table_id,
                                    "cache entry targets another table, skipped"
                                );
                                continue;
                            }
                        }
                        txn_info.cache_plans.push(plan);
                    }
                }

                // Pin the region so a later commit/rollback can reach it.
                self.session.pin_region(&info);

                let plan = self
                    .fragment
                    .plan_for_dispatch(records.as_deref().map(Vec::as_slice), txn_info.autocommit)?;

                let select_without_leader = op_type == OpType::Select;
                // Writes go strictly to the believed leader. Reads also aim at
                // the leader, but may be served by a same-room peer when the
                // proxy has a configured logical room.
                let mut addr = match info.leader {
                    Some(addr) => addr,
                    None => return Err(FanoutError::LeaderUnknown { region_id }),
                };
                if select_without_leader {
                    if let Some(peer) = self.choose_opt_instance(&info) {
                        addr = peer;
                    }
                }

                let req = StoreReq {
                    op_type,
                    region_id,
                    region_version: info.version,
                    log_id: self.log_id,
                    tuples: self.fragment.tuple_descs.clone(),
                    txn_info,
                    plan,
                    select_without_leader,
                };

                let started = Instant::now();
                let result = self.store.query(addr, req).await;
                tracing::debug!(
                    region_id,
                    version = info.version,
                    elapsed = ?started.elapsed(),
                    log_id = self.log_id,
                    txn_id = self.session.txn_id(),
                    %addr,
                    "store query returned"
                );

                let res = match result {
                    Ok(res) => res,
                    Err(err) => {
                        tracing::warn!(
                            region_id,
                            log_id = self.log_id,
                            error = %err,
                            "store rpc failed"
                        );
                        if retry_times + 1 >= RETRY_BUDGET {
                            return Err(FanoutError::RpcFailure {
                                region_id,
                                source: err,
                            });
                        }
                        rotate_to_other_peer(&mut info);
                        tokio::time::sleep(self.config.retry_interval).await;
                        retry_times += 1;
                        continue;
                    }
                };

                match res.errcode {
                    ErrCode::NotLeader => {
                        let last_seq_id = res.last_seq_id.unwrap_or(0);
                        tracing::warn!(
                            region_id,
                            retry = retry_times,
                            new_leader = ?res.leader,
                            log_id = self.log_id,
                            "not leader"
                        );
                        match res.leader {
                            Some(leader) => {
                                info.leader = Some(leader);
                                self.directory.update_leader(region_id, leader);
                                self.session.update_region_leader(region_id, leader);
                            }
                            None => rotate_to_other_peer(&mut info),
                        }
                        tokio::time::sleep(self.config.retry_interval).await;
                        retry_times += 1;
                        start_seq_id = i64::from(last_seq_id) + 1;
                    }
                    ErrCode::TxnFollowUp => {
                        let last_seq_id = res.last_seq_id.unwrap_or(0);
                        tracing::warn!(
                            region_id,
                            retry = retry_times,
                            log_id = self.log_id,
                            last_seq_id,
                            "txn follow-up"
                        );
                        match op_type {
                            // Replaying a commit is never safe; the layer
                            // above re-drives the whole COMMIT.
                            OpType::Commit => {
                                tracing::error!(
                                    region_id,
                                    log_id = self.log_id,
                                    txn_id = self.session.txn_id(),
                                    "commit answered with follow-up"
                                );
                                return Err(FanoutError::BadOpForFollowUp { region_id });
                            }
                            // A store that lost track of a rollback has
                            // nothing left to roll back.
                            OpType::Rollback => return Ok(()),
                            _ => {
                                retry_times += 1;
                                start_seq_id = i64::from(last_seq_id) + 1;
                            }
                        }
                    }
                    ErrCode::VersionOld => {
                        tracing::warn!(
                            region_id,
                            retry = retry_times,
                            version = info.version,
                            log_id = self.log_id,
                            "region version old"
                        );
                        if res.regions.len() < 2 {
                            return Err(FanoutError::VersionConflict { region_id });
                        }
                        return self
                            .handle_split(info, records, region_id, retry_times, start_seq_id, res)
                            .await;
                    }
                    ErrCode::RegionNotExist | ErrCode::InternalError => {
                        tracing::warn!(
                            region_id,
                            retry = retry_times,
                            errcode = ?res.errcode,
                            log_id = self.log_id,
                            "store rejected region"
                        );
                        if retry_times + 1 >= RETRY_BUDGET {
                            return match res.errcode {
                                ErrCode::RegionNotExist => {
                                    Err(FanoutError::RegionGone { region_id })
                                }
                                _ => Err(FanoutError::StoreInternal {
                                    region_id,
                                    msg: res.errmsg,
                                }),
                            };
                        }
                        rotate_to_other_peer(&mut info);
                        tokio::time::sleep(self.config.retry_interval).await;
                        retry_times += 1;
                    }
                    ErrCode::Success => {
                        if op_type != OpType::Select {
                            self.affected_rows
                                .fetch_add(res.affected_rows, Ordering::AcqRel);
                            return Ok(());
                        }
                        // Adopt a fresher leader hint from a read served by a
                        // peer.
                        if let Some(leader) = res.leader {
                            if info.leader != Some(leader) {
                                info.leader = Some(leader);
                                self.directory.update_leader(region_id, leader);
                                self.session.update_region_leader(region_id, leader);
                            }
                        }
                        let batch = decode_rows(region_id, &res)?;
                        tracing::debug!(
                            region_id,
                            rows = batch.size(),
                            log_id = self.log_id,
                            "collected region rows"
                        );
                        let mut gather = self.gather.lock().unwrap();
                        gather
                            .start_key_sort
                            .insert(info.start_key.clone(), region_id);
                        gather.region_batch.insert(region_id, batch);
                        return Ok(());
                    }
                    _ => {
                        tracing::warn!(
                            region_id,
                            errcode = ?res.errcode,
                            errmsg = %res.errmsg,
                            log_id = self.log_id,
                            "store returned error"
                        );
                        if let Some(code) = res.mysql_errcode {
                            self.session.set_sql_error(code, res.errmsg.clone());
                            return Err(FanoutError::MysqlLevel {
                                code,
                                msg: res.errmsg,
                            });
                        }
                        return Err(FanoutError::StoreInternal {
                            region_id,
                            msg: res.errmsg,
                        });
                    }
                }
            }
        })
    }

    /// VERSION_OLD with returned descendants: narrow the parent, install the
    /// children, and re-dispatch each serially. Children replay from seq 1;
    /// the narrowed parent keeps its replay position. The session snapshot is
    /// left untouched for COMMIT so an outer commit retry sees a consistent
    /// region set.
    async fn handle_split(
        self: &Arc<Self>,
        info: RegionInfo,
        records: Option<Arc<Vec<Bytes>>>,
        region_id: u64,
        retry_times: u32,
        start_seq_id: i64,
        res: keyspan_rpc::StoreRes,
    ) -> Result<(), FanoutError> {
        let op_type = self.fragment.op_type;
        let session = &self.session;

        // Siblings past our original range belong to someone else's dispatch.
        let mut kept: Vec<RegionInfo> = Vec::with_capacity(res.regions.len());
        for region in &res.regions {
            if end_key_cmp(&region.end_key, &info.end_key) == std::cmp::Ordering::Greater {
                tracing::warn!(
                    region_id = region.region_id,
                    log_id = self.log_id,
                    "split sibling beyond original range, ignored"
                );
                continue;
            }
            kept.push(region.clone());
        }
        self.directory.update_regions(kept.iter().cloned());

        tokio::time::sleep(self.config.retry_interval).await;

        if op_type == OpType::Prepare && session.transaction_has_write() {
            session.set_optimize_1pc(false);
            tracing::warn!(
                txn_id = session.txn_id(),
                seq_id = session.seq_id(),
                region_id,
                "disable optimize_1pc due to split"
            );
        }

        for region in kept {
            let mut region_copy = region.clone();
            if region_copy.region_id != region_id {
                if op_type != OpType::Commit {
                    session.install_region(region_copy.clone());
                }
                self.clone()
                    .send_request(
                        region_copy,
                        records.clone(),
                        region.region_id,
                        retry_times + 1,
                        1,
                    )
                    .await?;
            } else {
                if let Some(leader) = res.leader {
                    tracing::warn!(
                        region_id,
                        %leader,
                        log_id = self.log_id,
                        "adopting leader hint on narrowed parent"
                    );
                    region_copy.leader = Some(leader);
                }
                if op_type != OpType::Commit {
                    session.narrow_region(region_id, &region_copy);
                }
                self.clone()
                    .send_request(
                        region_copy,
                        records.clone(),
                        region_id,
                        retry_times + 1,
                        start_seq_id,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Same-room peer for reads when locality affinity is configured.
    fn choose_opt_instance(&self, info: &RegionInfo) -> Option<SocketAddr> {
        let proxy_room = self.directory.logical_room()?.to_string();
        let candidates: Vec<SocketAddr> = info
            .peers
            .iter()
            .copied()
            .filter(|peer| {
                self.directory
                    .logical_room_for_instance(peer)
                    .map(|room| room == proxy_room)
                    .unwrap_or(false)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..candidates.len());
        Some(candidates[idx])
    }
}

fn random_peer(info: &RegionInfo) -> Option<SocketAddr> {
    if info.peers.is_empty() {
        return None;
    }
    let idx = rand::rng().random_range(0..info.peers.len());
    Some(info.peers[idx])
}

/// Moves the leader guess to some other peer: a random one when it differs
/// from the current guess, otherwise the first non-leader peer.
fn rotate_to_other_peer(info: &mut RegionInfo) {
    tracing::warn!(
        region_id = info.region_id,
        old_leader = ?info.leader,
        "rotating away from leader guess"
    );
    let Some(candidate) = random_peer(info) else {
        return;
    };
    if Some(candidate) != info.leader {
        info.leader = Some(candidate);
        return;
    }
    for peer in &info.peers {
        if Some(*peer) != info.leader {
            info.leader = Some(*peer);
            return;
        }
    }
}

fn decode_rows(region_id: u64, res: &keyspan_rpc::StoreRes) -> Result<RowBatch, FanoutError> {
    let mut batch = RowBatch::new();
    for row_values in &res.row_values {
        let mut row = MemRow::new();
        for (idx, tuple_id) in res.tuple_ids.iter().enumerate() {
            let encoded = row_values
                .tuple_values
                .get(idx)
                .ok_or_else(|| FanoutError::RowDecode {
                    region_id,
                    msg: format!("missing tuple payload {idx}"),
                })?;
            row.load_tuple(*tuple_id, encoded)
                .map_err(|err| FanoutError::RowDecode {
                    region_id,
                    msg: err.to_string(),
                })?;
        }
        batch.move_row(row);
    }
    Ok(batch)
}
