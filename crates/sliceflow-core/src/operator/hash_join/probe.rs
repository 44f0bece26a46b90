//! Window probe: matches the left and right rows of every slice in a
//! window and assembles joined output batches.

use std::sync::Arc;

use arrow::compute::interleave;
use arrow_array::{Array, RecordBatch};
use arrow_schema::SchemaRef;
use fxhash::FxHashMap;
use parking_lot::MutexGuard;
use smallvec::SmallVec;

use super::state::{JoinSliceState, KeyIndex};
use super::{JoinSide, JoinStrategy};
use crate::operator::slice_store::Slice;
use crate::operator::{chunk_ranges, window_columns, OperatorError, WindowInfo};

/// `(page, row)` in the flattened pages of one side.
type Position = (usize, usize);

/// Matched row pairs of one window, together with the pages they point to.
#[derive(Debug, Default)]
pub(crate) struct WindowMatches {
    left_pages: Vec<RecordBatch>,
    right_pages: Vec<RecordBatch>,
    pairs: Vec<(Position, Position)>,
}

impl WindowMatches {
    /// Probes the slices of one window with `strategy`.
    ///
    /// Must not run concurrently with inserts into these slices.
    pub(crate) fn probe(strategy: JoinStrategy, slices: &[Arc<Slice<JoinSliceState>>]) -> Self {
        let mut matches = Self::default();
        let mut left_offsets = Vec::with_capacity(slices.len());
        let mut right_offsets = Vec::with_capacity(slices.len());
        for slice in slices {
            left_offsets.push(matches.left_pages.len());
            right_offsets.push(matches.right_pages.len());
            matches
                .left_pages
                .extend(slice.state().side(JoinSide::Left).pages());
            matches
                .right_pages
                .extend(slice.state().side(JoinSide::Right).pages());
        }

        match strategy {
            JoinStrategy::HashJoin => matches.hash(slices, &left_offsets, &right_offsets),
            JoinStrategy::NestedLoop => matches.nested_loop(slices, &left_offsets, &right_offsets),
        }
        matches.pairs.sort_unstable();
        matches
    }

    /// Number of joined rows.
    pub(crate) fn len(&self) -> usize {
        self.pairs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Builds a right-side table per shard, then streams the left side of
    /// the same shard through it.
    fn hash(&mut self, slices: &[Arc<Slice<JoinSliceState>>], left_offsets: &[usize], right_offsets: &[usize]) {
        let shards = slices.first().map_or(0, |slice| slice.state().shard_count());
        for shard in 0..shards {
            let right: Vec<_> = slices
                .iter()
                .map(|slice| slice.state().side(JoinSide::Right).lock_shard(shard))
                .collect();
            let mut table: FxHashMap<&[u8], SmallVec<[Position; 4]>> = FxHashMap::default();
            for (index, offset) in right.iter().zip(right_offsets) {
                for (key, refs) in index.iter() {
                    table
                        .entry(&**key)
                        .or_default()
                        .extend(refs.iter().map(|r| (offset + r.page as usize, r.row as usize)));
                }
            }
            if table.is_empty() {
                continue;
            }

            for (slice, offset) in slices.iter().zip(left_offsets) {
                let left = slice.state().side(JoinSide::Left).lock_shard(shard);
                for (key, refs) in left.iter() {
                    let Some(matched) = table.get(&**key) else {
                        continue;
                    };
                    for r in refs {
                        let position = (offset + r.page as usize, r.row as usize);
                        self.pairs.extend(matched.iter().map(|&m| (position, m)));
                    }
                }
            }
        }
    }

    /// Compares every left row with every right row of the window.
    fn nested_loop(
        &mut self,
        slices: &[Arc<Slice<JoinSliceState>>],
        left_offsets: &[usize],
        right_offsets: &[usize],
    ) {
        let shards = slices.first().map_or(0, |slice| slice.state().shard_count());
        let lock_all = |side: JoinSide| {
            slices
                .iter()
                .flat_map(|slice| (0..shards).map(move |shard| slice.state().side(side).lock_shard(shard)))
                .collect::<Vec<_>>()
        };
        let left = lock_all(JoinSide::Left);
        let right = lock_all(JoinSide::Right);

        let left_rows = flatten(&left, left_offsets, shards);
        let right_rows = flatten(&right, right_offsets, shards);

        for (left_key, left_position) in &left_rows {
            for (right_key, right_position) in &right_rows {
                if left_key == right_key {
                    self.pairs.push((*left_position, *right_position));
                }
            }
        }
    }

    /// Assembles `[start, end, left..., right...]` batches of at most
    /// `max_rows` rows.
    pub(crate) fn assemble(
        &self,
        window: WindowInfo,
        schema: &SchemaRef,
        max_rows: usize,
    ) -> Result<Vec<RecordBatch>, OperatorError> {
        let (Some(left_page), Some(right_page)) = (self.left_pages.first(), self.right_pages.first())
        else {
            return Ok(Vec::new());
        };
        let left_columns = side_columns(&self.left_pages, left_page.num_columns());
        let right_columns = side_columns(&self.right_pages, right_page.num_columns());

        chunk_ranges(self.pairs.len(), max_rows)
            .map(|(offset, len)| -> Result<RecordBatch, OperatorError> {
                let chunk = &self.pairs[offset..offset + len];
                let left: Vec<Position> = chunk.iter().map(|(l, _)| *l).collect();
                let right: Vec<Position> = chunk.iter().map(|(_, r)| *r).collect();

                let mut columns = window_columns(window, len);
                for values in &left_columns {
                    columns.push(interleave(values, &left)?);
                }
                for values in &right_columns {
                    columns.push(interleave(values, &right)?);
                }
                Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
            })
            .collect()
    }
}

/// Every indexed row of `guards` (all shards of slice 0, then slice 1, ...)
/// with its key.
fn flatten<'a>(
    guards: &'a [MutexGuard<'_, KeyIndex>],
    offsets: &[usize],
    shards: usize,
) -> Vec<(&'a [u8], Position)> {
    let mut rows = Vec::new();
    for (i, index) in guards.iter().enumerate() {
        let offset = offsets[i / shards];
        for (key, refs) in index.iter() {
            rows.extend(
                refs.iter()
                    .map(|r| (&**key, (offset + r.page as usize, r.row as usize))),
            );
        }
    }
    rows
}

fn side_columns(pages: &[RecordBatch], width: usize) -> Vec<Vec<&dyn Array>> {
    (0..width)
        .map(|column| pages.iter().map(|page| page.column(column).as_ref()).collect())
        .collect()
}
