//! Per-slice aggregation state.
//!
//! One map per key-hash shard, each behind its own lock, so worker threads
//! that ingest different keys into the same slice rarely contend.

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::function::{AggregationFunction, BoundInput, PartialAggregate};
use crate::operator::key::{key_hash, EncodedKeys};
use crate::operator::OperatorError;

/// Accumulators of every function, per encoded key.
pub type PartialMap = FxHashMap<Box<[u8]>, Vec<PartialAggregate>>;

/// Aggregation state owned by one slice.
pub struct AggregationSliceState {
    shards: Box<[Mutex<PartialMap>]>,
}

impl AggregationSliceState {
    /// Creates empty state with `shards` independently locked shards.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(PartialMap::default()))
                .collect(),
        }
    }

    /// Rebuilds state from snapshot entries.
    #[must_use]
    pub fn from_entries(shards: usize, entries: impl IntoIterator<Item = (Vec<u8>, Vec<PartialAggregate>)>) -> Self {
        let state = Self::new(shards);
        for (key, partials) in entries {
            let shard = state.shard_of(&key);
            state.shards[shard].lock().insert(key.into_boxed_slice(), partials);
        }
        state
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard_of(&self, key: &[u8]) -> usize {
        (key_hash(key) % self.shards.len() as u64) as usize
    }

    /// Folds `rows` of one batch into the accumulators of their keys.
    ///
    /// Rows are grouped by shard first so each shard is locked once.
    pub(crate) fn update(
        &self,
        functions: &[AggregationFunction],
        inputs: &[BoundInput],
        keys: &EncodedKeys,
        rows: &[usize],
    ) {
        if self.shards.len() == 1 {
            let mut shard = self.shards[0].lock();
            for &row in rows {
                Self::update_row(&mut shard, functions, inputs, keys, row);
            }
            return;
        }

        let mut by_shard: Vec<(usize, usize)> = rows
            .iter()
            .map(|&row| (self.shard_of(keys.key(row).as_ref()), row))
            .collect();
        by_shard.sort_unstable_by_key(|(shard, _)| *shard);

        for group in by_shard.chunk_by(|a, b| a.0 == b.0) {
            let mut shard = self.shards[group[0].0].lock();
            for &(_, row) in group {
                Self::update_row(&mut shard, functions, inputs, keys, row);
            }
        }
    }

    fn update_row(
        map: &mut PartialMap,
        functions: &[AggregationFunction],
        inputs: &[BoundInput],
        keys: &EncodedKeys,
        row: usize,
    ) {
        let key = keys.key(row);
        let partials = match map.get_mut(key.as_ref()) {
            Some(partials) => partials,
            None => map
                .entry(Box::from(key.as_ref()))
                .or_insert_with(|| functions.iter().map(AggregationFunction::empty_partial).collect()),
        };
        for ((function, input), partial) in functions.iter().zip(inputs).zip(partials.iter_mut()) {
            if let Some(value) = input.value(row) {
                function.merge_one(partial, value);
            }
        }
    }

    /// Merges every accumulator of this slice into `into`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::RejectedPartial`] if an accumulator does not
    /// match its function.
    pub fn merge_into(
        &self,
        functions: &[AggregationFunction],
        into: &mut PartialMap,
    ) -> Result<(), OperatorError> {
        for shard in self.shards.iter() {
            let shard = shard.lock();
            for (key, partials) in shard.iter() {
                match into.get_mut(key) {
                    Some(existing) => {
                        for ((function, acc), partial) in
                            functions.iter().zip(existing.iter_mut()).zip(partials)
                        {
                            function.merge_partials(acc, partial)?;
                        }
                    }
                    None => {
                        into.insert(key.clone(), partials.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Copies out every entry, for snapshots.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<PartialAggregate>)> {
        let mut entries: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .map(|(key, partials)| (key.to_vec(), partials.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl std::fmt::Debug for AggregationSliceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationSliceState")
            .field("shards", &self.shards.len())
            .field("keys", &self.num_keys())
            .finish()
    }
}
