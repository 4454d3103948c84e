//! Immutable plan fragments plus the in-memory row model.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bytes::Bytes;
use keyspan_rpc::{OpType, PlanNode, PlanNodeKind, TupleDesc, Value};

use crate::error::FanoutError;

/// Rows a single `RowBatch` holds before the next one starts.
pub const ROW_BATCH_CAPACITY: usize = 1024;

/// One sort key: a slot reference into a tuple, plus direction and null
/// placement. Sort expressions are compiled down to slot references by the
/// planner before the fragment reaches the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderByKey {
    pub tuple_id: u32,
    pub slot: usize,
    pub asc: bool,
    pub nulls_first: bool,
}

/// Immutable description of one fan-out operation.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub op_type: OpType,
    /// Operator tree executed on the stores.
    pub plan: PlanNode,
    pub tuple_descs: Vec<TupleDesc>,
    pub sort_keys: Vec<OrderByKey>,
    pub limit: Option<usize>,
}

impl Fragment {
    pub fn new(op_type: OpType, plan: PlanNode, tuple_descs: Vec<TupleDesc>) -> Self {
        Self {
            op_type,
            plan,
            tuple_descs,
            sort_keys: Vec::new(),
            limit: None,
        }
    }

    pub fn with_sort_keys(mut self, sort_keys: Vec<OrderByKey>) -> Self {
        self.sort_keys = sort_keys;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Table this fragment operates on, taken from the first tuple layout.
    pub fn table_id(&self) -> Option<u64> {
        self.tuple_descs.first().map(|desc| desc.table_id)
    }

    /// Builds the per-dispatch plan. Insert paths get a fresh tree carrying
    /// only the records aimed at the current region, so concurrent store
    /// workers never share a mutable plan.
    ///
    /// A missing insert node is an error for explicit transactions; under
    /// autocommit the plan ships unchanged (the store replays the cached DML).
    pub fn plan_for_dispatch(
        &self,
        records: Option<&[Bytes]>,
        autocommit: bool,
    ) -> Result<PlanNode, FanoutError> {
        let rewrite = self.op_type == OpType::Insert
            || (self.op_type == OpType::Prepare && autocommit);
        if !rewrite {
            return Ok(self.plan.clone());
        }

        let mut plan = self.plan.clone();
        match plan.find_mut(PlanNodeKind::Insert) {
            Some(insert) => {
                if let Some(records) = records {
                    insert.records = records.to_vec();
                }
            }
            None if !autocommit => return Err(FanoutError::MissingInsertNode),
            None => {}
        }
        Ok(plan)
    }
}

/// One materialized row: tuple id -> decoded column values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemRow {
    tuples: BTreeMap<u32, Vec<Value>>,
}

impl MemRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one encoded tuple payload into this row.
    pub fn load_tuple(&mut self, tuple_id: u32, encoded: &[u8]) -> Result<(), serde_json::Error> {
        let values: Vec<Value> = serde_json::from_slice(encoded)?;
        self.tuples.insert(tuple_id, values);
        Ok(())
    }

    pub fn set_tuple(&mut self, tuple_id: u32, values: Vec<Value>) {
        self.tuples.insert(tuple_id, values);
    }

    pub fn get(&self, tuple_id: u32, slot: usize) -> Option<&Value> {
        self.tuples.get(&tuple_id).and_then(|values| values.get(slot))
    }

    /// Encodes one tuple back to its wire form.
    pub fn encode_tuple(&self, tuple_id: u32) -> Option<Bytes> {
        let values = self.tuples.get(&tuple_id)?;
        serde_json::to_vec(values).ok().map(Bytes::from)
    }
}

/// Ordered sequence of rows produced by one region response.
#[derive(Debug, Default)]
pub struct RowBatch {
    rows: Vec<MemRow>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn move_row(&mut self, row: MemRow) {
        self.rows.push(row);
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= ROW_BATCH_CAPACITY
    }

    pub fn rows(&self) -> &[MemRow] {
        &self.rows
    }

    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    pub fn into_rows(self) -> Vec<MemRow> {
        self.rows
    }
}

/// Comparator over declared sort keys with `asc`/`nulls_first` handling.
/// Missing slots compare as NULL.
#[derive(Debug, Clone)]
pub struct RowComparator {
    keys: Vec<OrderByKey>,
}

impl RowComparator {
    pub fn new(keys: Vec<OrderByKey>) -> Self {
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn compare(&self, left: &MemRow, right: &MemRow) -> Ordering {
        for key in &self.keys {
            let l = left.get(key.tuple_id, key.slot);
            let r = right.get(key.tuple_id, key.slot);
            let ord = match (l, r) {
                (None, None) => Ordering::Equal,
                (None, Some(v)) | (Some(v), None) if v.is_null() => Ordering::Equal,
                (None, Some(_)) => null_ordering(key.nulls_first),
                (Some(_), None) => null_ordering(key.nulls_first).reverse(),
                (Some(l), Some(r)) => match (l.is_null(), r.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => null_ordering(key.nulls_first),
                    (false, true) => null_ordering(key.nulls_first).reverse(),
                    (false, false) => {
                        let ord = l.total_cmp(r);
                        if key.asc {
                            ord
                        } else {
                            ord.reverse()
                        }
                    }
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn null_ordering(nulls_first: bool) -> Ordering {
    if nulls_first {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
