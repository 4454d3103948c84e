//! Fan-out executor behavior against a scripted in-memory store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use keyspan_proxy::{
    Fragment, FanoutExecutor, ProxyConfig, QueryContext, RegionDirectory, RowBatch, SessionState,
};
use keyspan_proxy::error::FanoutError;
use keyspan_rpc::{
    CachePlan, ErrCode, OpType, PlanNode, PlanNodeKind, RegionInfo, RowValues, RpcError,
    StoreReq, StoreRes, StoreService, TupleDesc, Value,
};

enum Scripted {
    Res(StoreRes),
    Transport,
}

/// Store stub that replays scripted responses per region and records every
/// call it sees.
#[derive(Default)]
struct MockStore {
    scripts: Mutex<HashMap<u64, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(SocketAddr, StoreReq)>>,
}

impl MockStore {
    fn script(&self, region_id: u64, responses: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(region_id, responses.into());
    }

    fn calls(&self) -> Vec<(SocketAddr, StoreReq)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, region_id: u64) -> Vec<(SocketAddr, StoreReq)> {
        self.calls()
            .into_iter()
            .filter(|(_, req)| req.region_id == region_id)
            .collect()
    }
}

#[async_trait]
impl StoreService for MockStore {
    async fn query(&self, addr: SocketAddr, req: StoreReq) -> Result<StoreRes, RpcError> {
        self.calls.lock().unwrap().push((addr, req.clone()));
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&req.region_id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Scripted::Res(res)) => Ok(res),
            Some(Scripted::Transport) => Err(RpcError::Io {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted"),
            }),
            None => Ok(StoreRes::success()),
        }
    }
}

fn addr(last: u8) -> SocketAddr {
    format!("10.1.0.{last}:8110").parse().expect("addr")
}

fn region(region_id: u64, start: &[u8], end: &[u8], leader: SocketAddr) -> RegionInfo {
    RegionInfo {
        region_id,
        table_id: 1,
        version: 1,
        start_key: Bytes::copy_from_slice(start),
        end_key: Bytes::copy_from_slice(end),
        leader: Some(leader),
        peers: vec![leader, addr(200)],
    }
}

fn tuple_desc() -> TupleDesc {
    TupleDesc {
        tuple_id: 0,
        table_id: 1,
    }
}

fn select_fragment() -> Fragment {
    Fragment::new(
        OpType::Select,
        PlanNode::leaf(PlanNodeKind::TableScan, 1),
        vec![tuple_desc()],
    )
}

fn insert_fragment() -> Fragment {
    Fragment::new(
        OpType::Insert,
        PlanNode::leaf(PlanNodeKind::Insert, 1),
        vec![tuple_desc()],
    )
}

fn txn_fragment(op_type: OpType) -> Fragment {
    Fragment::new(op_type, PlanNode::leaf(PlanNodeKind::TableScan, 1), vec![tuple_desc()])
}

fn encoded_row(key: i64) -> RowValues {
    let payload = serde_json::to_vec(&vec![Value::Int(key)]).expect("encode");
    RowValues {
        tuple_values: vec![Bytes::from(payload)],
    }
}

fn rows_response(keys: &[i64]) -> StoreRes {
    let mut res = StoreRes::success();
    res.tuple_ids = vec![0];
    res.row_values = keys.iter().map(|key| encoded_row(*key)).collect();
    res
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        retry_interval: std::time::Duration::from_millis(1),
        ..ProxyConfig::default()
    }
}

fn executor(
    fragment: Fragment,
    targets: HashMap<u64, RegionInfo>,
    records: BTreeMap<u64, Vec<Bytes>>,
    directory: &Arc<RegionDirectory>,
    store: &Arc<MockStore>,
) -> FanoutExecutor {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    FanoutExecutor::new(
        fragment,
        targets,
        records,
        directory.clone(),
        store.clone() as Arc<dyn StoreService>,
        test_config(),
    )
}

fn context(session: &Arc<SessionState>) -> QueryContext {
    QueryContext {
        session: session.clone(),
        log_id: 7001,
    }
}

fn cache_entry(seq_id: u32, op_type: OpType, table_id: u64) -> CachePlan {
    let kind = match op_type {
        OpType::Insert => PlanNodeKind::Insert,
        _ => PlanNodeKind::TableScan,
    };
    CachePlan {
        op_type,
        seq_id,
        plan: PlanNode::leaf(kind, table_id),
        tuple_descs: vec![TupleDesc {
            tuple_id: 0,
            table_id,
        }],
    }
}

#[tokio::test]
async fn single_region_autocommit_select() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    store.script(1, vec![Scripted::Res(rows_response(&[10, 11]))]);
    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());

    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let mut exec = executor(select_fragment(), targets, BTreeMap::new(), &directory, &store);
    let affected = exec.open(&context(&session)).await.expect("open");
    assert_eq!(affected, 0);

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, leader);
    assert!(calls[0].1.select_without_leader);

    let mut out = RowBatch::new();
    let mut eos = false;
    exec.get_next(&mut out, &mut eos);
    assert!(eos);
    let keys: Vec<i64> = out
        .rows()
        .iter()
        .map(|row| match row.get(0, 0) {
            Some(Value::Int(v)) => *v,
            other => panic!("unexpected value {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![10, 11]);
}

#[tokio::test]
async fn not_leader_redirect_replays_from_hint() {
    let old_leader = addr(1);
    let new_leader = addr(2);
    let store = Arc::new(MockStore::default());
    let mut redirect = StoreRes::error(ErrCode::NotLeader, "not leader");
    redirect.leader = Some(new_leader);
    redirect.last_seq_id = Some(7);
    store.script(1, vec![Scripted::Res(redirect), Scripted::Res(rows_response(&[1]))]);

    let directory = Arc::new(RegionDirectory::new(None));
    let info = region(1, b"a", b"z", old_leader);
    directory.update_regions([info.clone()]);
    let session = Arc::new(SessionState::new());

    let targets = HashMap::from([(1, info)]);
    let mut exec = executor(select_fragment(), targets, BTreeMap::new(), &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, old_leader);
    assert_eq!(calls[1].0, new_leader);
    assert_eq!(calls[1].1.txn_info.start_seq_id, 8);

    assert_eq!(directory.get(1).expect("region").leader, Some(new_leader));
    assert_eq!(
        session.region_info(1).expect("pinned region").leader,
        Some(new_leader)
    );
}

#[tokio::test]
async fn split_mid_insert_narrows_parent_and_dispatches_children() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());

    let mut parent_after = region(1, b"k00", b"k50", leader);
    parent_after.version = 2;
    let mut child = region(2, b"k50", b"k99", leader);
    child.version = 2;
    let mut split = StoreRes::error(ErrCode::VersionOld, "version old");
    split.regions = vec![parent_after.clone(), child.clone()];
    store.script(1, vec![Scripted::Res(split), Scripted::Res(StoreRes::success())]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(42);
    session.insert_cache_plan(cache_entry(1, OpType::Begin, 1));
    session.insert_cache_plan(cache_entry(2, OpType::Insert, 1));
    session.next_stmt();
    session.next_stmt();
    session.next_stmt(); // current statement is seq 3

    let original = region(1, b"k00", b"k99", leader);
    let targets = HashMap::from([(1, original)]);
    let records = BTreeMap::from([(1u64, vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r2")])]);
    let mut exec = executor(insert_fragment(), targets, records, &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    // Session snapshot: parent narrowed, child installed.
    let pinned_parent = session.region_info(1).expect("parent");
    assert_eq!(pinned_parent.end_key, Bytes::from_static(b"k50"));
    assert_eq!(pinned_parent.version, 2);
    assert!(session.region_info(2).is_some());

    // Parent keeps its replay position, the child replays from seq 1.
    let parent_calls = store.calls_for(1);
    assert_eq!(parent_calls.len(), 2);
    assert_eq!(parent_calls[0].1.txn_info.start_seq_id, 3);
    assert_eq!(parent_calls[1].1.txn_info.start_seq_id, 3);
    let child_calls = store.calls_for(2);
    assert_eq!(child_calls.len(), 1);
    assert_eq!(child_calls[0].1.txn_info.start_seq_id, 1);

    // The directory saw both descriptors.
    assert_eq!(directory.get(1).expect("parent").version, 2);
    assert!(directory.get(2).is_some());
}

#[tokio::test]
async fn commit_follow_up_is_fatal_without_retry() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    store.script(
        1,
        vec![Scripted::Res(StoreRes::error(ErrCode::TxnFollowUp, "follow up"))],
    );

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(9);
    session.install_region(region(1, b"a", b"z", leader));

    let mut exec = executor(
        txn_fragment(OpType::Commit),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    let err = exec.open(&context(&session)).await.expect_err("must fail");
    assert!(matches!(err, FanoutError::BadOpForFollowUp { region_id: 1 }));
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn rollback_follow_up_is_success() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    store.script(
        1,
        vec![Scripted::Res(StoreRes::error(ErrCode::TxnFollowUp, "follow up"))],
    );

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(9);
    session.install_region(region(1, b"a", b"z", leader));

    let mut exec = executor(
        txn_fragment(OpType::Rollback),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    let affected = exec.open(&context(&session)).await.expect("open");
    assert_eq!(affected, 0);
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn empty_prepare_enables_1pc_without_rpcs() {
    let store = Arc::new(MockStore::default());
    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(5);

    let mut exec = executor(
        txn_fragment(OpType::Prepare),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    let affected = exec.open(&context(&session)).await.expect("open");
    assert_eq!(affected, 0);
    assert!(store.calls().is_empty());
    assert!(session.optimize_1pc());
}

#[tokio::test]
async fn retry_budget_is_five_attempts_total() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    store.script(
        1,
        vec![
            Scripted::Transport,
            Scripted::Transport,
            Scripted::Transport,
            Scripted::Transport,
            Scripted::Transport,
            Scripted::Transport,
        ],
    );

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let mut exec = executor(select_fragment(), targets, BTreeMap::new(), &directory, &store);

    let err = exec.open(&context(&session)).await.expect_err("must fail");
    assert!(matches!(err, FanoutError::RpcFailure { region_id: 1, .. }));
    assert_eq!(store.calls().len(), 5);
}

#[tokio::test]
async fn writes_target_the_believed_leader() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    let mut ok = StoreRes::success();
    ok.affected_rows = 3;
    store.script(1, vec![Scripted::Res(ok)]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(11);
    session.next_stmt();

    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let records = BTreeMap::from([(1u64, vec![Bytes::from_static(b"r1")])]);
    let mut exec = executor(insert_fragment(), targets, records, &directory, &store);
    let affected = exec.open(&context(&session)).await.expect("open");
    assert_eq!(affected, 3);

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, leader);
    assert!(!calls[0].1.select_without_leader);
}

#[tokio::test]
async fn dml_failure_marks_statement_for_rollback() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    let mut failure = StoreRes::error(ErrCode::InputParamError, "duplicate key");
    failure.mysql_errcode = Some(1062);
    store.script(1, vec![Scripted::Res(failure)]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(11);
    session.next_stmt();
    session.next_stmt(); // failing statement is seq 2

    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let records = BTreeMap::from([(1u64, vec![Bytes::from_static(b"r1")])]);
    let mut exec = executor(insert_fragment(), targets, records, &directory, &store);
    let err = exec.open(&context(&session)).await.expect_err("must fail");
    assert!(matches!(err, FanoutError::MysqlLevel { code: 1062, .. }));

    assert_eq!(session.need_rollback_vec(), vec![2]);
    let sql_err = session.take_sql_error().expect("sql error");
    assert_eq!(sql_err.code, 1062);
}

#[tokio::test]
async fn cache_replay_covers_missed_statements() {
    let old_leader = addr(1);
    let new_leader = addr(2);
    let store = Arc::new(MockStore::default());
    let mut redirect = StoreRes::error(ErrCode::NotLeader, "not leader");
    redirect.leader = Some(new_leader);
    redirect.last_seq_id = Some(2);
    store.script(1, vec![Scripted::Res(redirect), Scripted::Res(StoreRes::success())]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(21);
    session.insert_cache_plan(cache_entry(1, OpType::Begin, 1));
    session.insert_cache_plan(cache_entry(2, OpType::Insert, 1));
    session.insert_cache_plan(cache_entry(3, OpType::Insert, 2)); // other table
    session.insert_cache_plan(cache_entry(4, OpType::Insert, 1));
    session.insert_cache_plan(cache_entry(5, OpType::Update, 1));
    for _ in 0..6 {
        session.next_stmt(); // current statement is seq 6
    }

    let targets = HashMap::from([(1, region(1, b"a", b"z", old_leader))]);
    let fragment = Fragment::new(
        OpType::Update,
        PlanNode::leaf(PlanNodeKind::Update, 1),
        vec![tuple_desc()],
    );
    let mut exec = executor(fragment, targets, BTreeMap::new(), &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    // Replay resumes after the store's last seen statement, skipping the
    // entry that targets another table.
    assert_eq!(calls[1].1.txn_info.start_seq_id, 3);
    let replayed: Vec<u32> = calls[1]
        .1
        .txn_info
        .cache_plans
        .iter()
        .map(|plan| plan.seq_id)
        .collect();
    assert_eq!(replayed, vec![4, 5]);
}

#[tokio::test]
async fn prepare_replay_skips_prepare_entries() {
    let old_leader = addr(1);
    let store = Arc::new(MockStore::default());
    let mut redirect = StoreRes::error(ErrCode::NotLeader, "not leader");
    redirect.leader = Some(addr(2));
    redirect.last_seq_id = Some(1);
    store.script(1, vec![Scripted::Res(redirect), Scripted::Res(StoreRes::success())]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(22);
    session.insert_cache_plan(cache_entry(1, OpType::Begin, 1));
    session.insert_cache_plan(cache_entry(2, OpType::Insert, 1));
    session.insert_cache_plan(cache_entry(3, OpType::Prepare, 1));
    for _ in 0..4 {
        session.next_stmt();
    }
    session.install_region(region(1, b"a", b"z", old_leader));

    let mut exec = executor(
        txn_fragment(OpType::Prepare),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    exec.open(&context(&session)).await.expect("open");

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    let replayed: Vec<u32> = calls[1]
        .1
        .txn_info
        .cache_plans
        .iter()
        .map(|plan| plan.seq_id)
        .collect();
    assert_eq!(replayed, vec![2]);
}

#[tokio::test]
async fn prepare_1pc_gating() {
    // Single region, no writes: 1PC stays on.
    {
        let leader = addr(1);
        let store = Arc::new(MockStore::default());
        let directory = Arc::new(RegionDirectory::new(None));
        let session = Arc::new(SessionState::new());
        session.set_autocommit(false);
        session.begin_txn(31);
        session.next_stmt();
        session.install_region(region(1, b"a", b"z", leader));

        let mut exec = executor(
            txn_fragment(OpType::Prepare),
            HashMap::new(),
            BTreeMap::new(),
            &directory,
            &store,
        );
        exec.open(&context(&session)).await.expect("open");
        assert!(session.optimize_1pc());
    }

    // Two regions with prior writes: 2PC.
    {
        let store = Arc::new(MockStore::default());
        let directory = Arc::new(RegionDirectory::new(None));
        let session = Arc::new(SessionState::new());
        session.set_autocommit(false);
        session.begin_txn(32);
        session.insert_cache_plan(cache_entry(1, OpType::Insert, 1));
        session.next_stmt();
        session.next_stmt();
        session.install_region(region(1, b"a", b"m", addr(1)));
        session.install_region(region(2, b"m", b"z", addr(2)));

        let mut exec = executor(
            txn_fragment(OpType::Prepare),
            HashMap::new(),
            BTreeMap::new(),
            &directory,
            &store,
        );
        exec.open(&context(&session)).await.expect("open");
        assert!(!session.optimize_1pc());
    }
}

#[tokio::test]
async fn split_during_prepare_with_writes_clears_1pc() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());

    let mut parent_after = region(1, b"a", b"m", leader);
    parent_after.version = 2;
    let mut child = region(2, b"m", b"z", leader);
    child.version = 2;
    let mut split = StoreRes::error(ErrCode::VersionOld, "version old");
    split.regions = vec![parent_after, child];
    store.script(1, vec![Scripted::Res(split), Scripted::Res(StoreRes::success())]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(33);
    session.insert_cache_plan(cache_entry(1, OpType::Begin, 1));
    session.insert_cache_plan(cache_entry(2, OpType::Insert, 1));
    session.next_stmt();
    session.next_stmt();
    session.next_stmt();
    session.install_region(region(1, b"a", b"z", leader));

    let mut exec = executor(
        txn_fragment(OpType::Prepare),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    exec.open(&context(&session)).await.expect("open");

    // The single-region check turned 1PC on, the split turned it back off.
    assert!(!session.optimize_1pc());
}

#[tokio::test]
async fn begin_is_cached_without_dispatch() {
    let store = Arc::new(MockStore::default());
    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.set_autocommit(false);
    session.begin_txn(50);
    session.next_stmt();

    // BEGIN has no planner-produced regions; the executor caches it so later
    // statements replay it to stores that join the transaction late.
    let mut exec = executor(
        txn_fragment(OpType::Begin),
        HashMap::new(),
        BTreeMap::new(),
        &directory,
        &store,
    );
    let affected = exec.open(&context(&session)).await.expect("open");

    assert_eq!(affected, 0);
    assert!(store.calls().is_empty());
    assert_eq!(session.cache_plans_len(), 1);
    let cached = session.cache_plans_in_range(0, 2);
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].op_type, OpType::Begin);
    assert_eq!(cached[0].seq_id, 1);
    assert!(!session.optimize_1pc());
}

#[tokio::test]
async fn autocommit_dml_defers_dispatch_to_prepare() {
    let leader = addr(1);
    let store = Arc::new(MockStore::default());
    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    session.begin_txn(41); // autocommit stays true
    session.next_stmt();

    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let records = BTreeMap::from([(1u64, vec![Bytes::from_static(b"r1")])]);
    let mut exec = executor(insert_fragment(), targets, records, &directory, &store);
    let affected = exec.open(&context(&session)).await.expect("open");

    assert_eq!(affected, 0);
    assert!(store.calls().is_empty());
    assert_eq!(session.cache_plans_len(), 1);
    assert!(session.region_info(1).is_some());
}

#[tokio::test]
async fn select_output_is_grouped_by_start_key() {
    let store = Arc::new(MockStore::default());
    // Region 2 covers the lower key range but completes second; output must
    // still lead with its rows.
    store.script(1, vec![Scripted::Res(rows_response(&[50, 51]))]);
    store.script(2, vec![Scripted::Res(rows_response(&[10, 11]))]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    let targets = HashMap::from([
        (1, region(1, b"m", b"z", addr(1))),
        (2, region(2, b"a", b"m", addr(2))),
    ]);
    let mut exec = executor(select_fragment(), targets, BTreeMap::new(), &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    let mut out = RowBatch::new();
    let mut eos = false;
    exec.get_next(&mut out, &mut eos);
    let keys: Vec<i64> = out
        .rows()
        .iter()
        .map(|row| match row.get(0, 0) {
            Some(Value::Int(v)) => *v,
            other => panic!("unexpected value {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![10, 11, 50, 51]);
}

#[tokio::test]
async fn select_prefers_same_room_peer() {
    let leader = addr(1);
    let local_peer = addr(200);
    let store = Arc::new(MockStore::default());
    store.script(1, vec![Scripted::Res(rows_response(&[1]))]);

    // The proxy sits in room "bj"; only the non-leader peer shares it.
    let directory = Arc::new(RegionDirectory::new(Some("bj".to_string())));
    directory.set_instance_room(local_peer, "bj".to_string());
    directory.set_instance_room(leader, "gz".to_string());
    let session = Arc::new(SessionState::new());

    let targets = HashMap::from([(1, region(1, b"a", b"z", leader))]);
    let mut exec = executor(select_fragment(), targets, BTreeMap::new(), &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, local_peer);
    assert!(calls[0].1.select_without_leader);
}

#[tokio::test]
async fn limit_clamps_output_and_signals_eos() {
    let store = Arc::new(MockStore::default());
    store.script(1, vec![Scripted::Res(rows_response(&[1, 2, 3, 4]))]);

    let directory = Arc::new(RegionDirectory::new(None));
    let session = Arc::new(SessionState::new());
    let targets = HashMap::from([(1, region(1, b"a", b"z", addr(1)))]);
    let fragment = select_fragment().with_limit(2);
    let mut exec = executor(fragment, targets, BTreeMap::new(), &directory, &store);
    exec.open(&context(&session)).await.expect("open");

    let mut out = RowBatch::new();
    let mut eos = false;
    exec.get_next(&mut out, &mut eos);
    assert_eq!(out.size(), 2);
    assert!(eos);

    let mut again = RowBatch::new();
    let mut eos2 = false;
    exec.get_next(&mut again, &mut eos2);
    assert!(eos2);
    assert_eq!(again.size(), 0);
}
