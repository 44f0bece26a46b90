//! Per-slice join state.
//!
//! Each side of a slice keeps the rows it received as pages (the input
//! batches restricted to the slice) and an index from encoded key to the
//! rows carrying that key. The index is split into key-hash shards with one
//! lock each; both sides of every slice use the same shard function, so a
//! probe only needs to match shard `i` of the left side against shard `i`
//! of the right side.

use arrow_array::RecordBatch;
use fxhash::FxHashMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use super::JoinSide;
use crate::operator::key::{key_hash, EncodedKeys};

/// Position of a row inside the pages of one slice side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowRef {
    /// Page index
    pub page: u32,
    /// Row inside the page
    pub row: u32,
}

/// Rows of one side per encoded key.
pub type KeyIndex = FxHashMap<Box<[u8]>, SmallVec<[RowRef; 4]>>;

/// One side of a slice.
pub struct SideTable {
    pages: Mutex<Vec<RecordBatch>>,
    index: Box<[Mutex<KeyIndex>]>,
}

impl SideTable {
    fn new(shards: usize) -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            index: (0..shards.max(1))
                .map(|_| Mutex::new(KeyIndex::default()))
                .collect(),
        }
    }

    /// Copies of the pages, in insertion order.
    #[must_use]
    pub fn pages(&self) -> Vec<RecordBatch> {
        self.pages.lock().clone()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.pages.lock().iter().map(RecordBatch::num_rows).sum()
    }

    /// Number of distinct non-null keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.index.iter().map(|shard| shard.lock().len()).sum()
    }

    pub(crate) fn lock_shard(&self, shard: usize) -> MutexGuard<'_, KeyIndex> {
        self.index[shard].lock()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard_of(&self, key: &[u8]) -> usize {
        (key_hash(key) % self.index.len() as u64) as usize
    }

    /// Stores `page` and indexes its rows.
    ///
    /// Row `i` of `page` is row `rows[i]` of the batch `keys` were
    /// computed from. Rows with a null key are stored but never indexed, so
    /// they never match.
    #[allow(clippy::cast_possible_truncation)]
    fn insert(&self, page: RecordBatch, keys: &EncodedKeys, rows: &[usize]) {
        let page_id = {
            let mut pages = self.pages.lock();
            pages.push(page);
            (pages.len() - 1) as u32
        };

        let mut by_shard: Vec<(usize, usize, u32)> = rows
            .iter()
            .enumerate()
            .filter(|(_, &row)| keys.is_valid(row))
            .map(|(i, &row)| (self.shard_of(keys.key(row).as_ref()), row, i as u32))
            .collect();
        by_shard.sort_unstable_by_key(|(shard, _, _)| *shard);

        for group in by_shard.chunk_by(|a, b| a.0 == b.0) {
            let mut index = self.index[group[0].0].lock();
            for &(_, row, in_page) in group {
                let key = keys.key(row);
                let entry = match index.get_mut(key.as_ref()) {
                    Some(entry) => entry,
                    None => index.entry(Box::from(key.as_ref())).or_default(),
                };
                entry.push(RowRef {
                    page: page_id,
                    row: in_page,
                });
            }
        }
    }
}

/// Join state owned by one slice.
pub struct JoinSliceState {
    left: SideTable,
    right: SideTable,
}

impl JoinSliceState {
    /// Creates empty state with `shards` index shards per side.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            left: SideTable::new(shards),
            right: SideTable::new(shards),
        }
    }

    /// Number of index shards per side.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.left.index.len()
    }

    /// One side.
    #[must_use]
    pub fn side(&self, side: JoinSide) -> &SideTable {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    pub(crate) fn insert(
        &self,
        side: JoinSide,
        page: RecordBatch,
        keys: &EncodedKeys,
        rows: &[usize],
    ) {
        self.side(side).insert(page, keys, rows);
    }
}

impl std::fmt::Debug for JoinSliceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinSliceState")
            .field("shards", &self.shard_count())
            .field("left_rows", &self.left.num_rows())
            .field("right_rows", &self.right.num_rows())
            .finish()
    }
}
