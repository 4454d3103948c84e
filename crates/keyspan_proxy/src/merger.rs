//! Merges per-region row batches into one ordered output stream.
//!
//! Batches arrive in ascending region start-key order; that order is already
//! the primary-key order, so without declared sort keys the merger simply
//! concatenates. With sort keys it re-sorts the buffered rows once with a
//! stable sort; ties keep their batch (start-key) order, so the output equals
//! a k-way merge of the per-region runs.

use std::collections::VecDeque;

use crate::fragment::{MemRow, RowBatch, RowComparator, ROW_BATCH_CAPACITY};

pub struct Sorter {
    comparator: Option<RowComparator>,
    /// Pending rows in output order once `merge_sort` has run.
    pending: VecDeque<MemRow>,
    merged: bool,
    eos: bool,
}

impl Sorter {
    pub fn new(comparator: Option<RowComparator>) -> Self {
        let comparator = comparator.filter(|cmp| !cmp.is_empty());
        Self {
            comparator,
            pending: VecDeque::new(),
            merged: false,
            eos: false,
        }
    }

    /// Adds one region's batch. Callers feed batches in ascending start-key
    /// order; this order is preserved for the no-sort-key case and used as
    /// the stability tie-break otherwise.
    pub fn add_batch(&mut self, batch: RowBatch) {
        debug_assert!(!self.merged, "add_batch after merge_sort");
        self.pending.extend(batch.into_rows());
    }

    /// Fixes the output order. Without sort keys (or with at most one batch
    /// worth of input) the arrival order stands; with sort keys the pending
    /// rows get a stable sort, which is equivalent to a stable k-way merge of
    /// the per-region runs.
    pub fn merge_sort(&mut self) {
        if self.merged {
            return;
        }
        self.merged = true;
        if let Some(comparator) = &self.comparator {
            let mut rows: Vec<MemRow> = self.pending.drain(..).collect();
            rows.sort_by(|a, b| comparator.compare(a, b));
            self.pending = rows.into();
        }
    }

    /// Moves up to one batch worth of rows into `out`. Sets `eos` once
    /// drained; further calls keep `eos` set and move nothing.
    pub fn get_next(&mut self, out: &mut RowBatch, eos: &mut bool) {
        if self.eos {
            *eos = true;
            return;
        }
        while out.size() < ROW_BATCH_CAPACITY {
            match self.pending.pop_front() {
                Some(row) => out.move_row(row),
                None => break,
            }
        }
        if self.pending.is_empty() {
            self.eos = true;
            *eos = true;
        }
    }
}
