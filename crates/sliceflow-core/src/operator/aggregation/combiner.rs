//! Distributed window combining.
//!
//! Child nodes run the same windowed aggregation with
//! [`EmitMode::Partial`](super::EmitMode::Partial) and ship their closed
//! windows as partial rows:
//!
//! ```text
//! [start, end, key: Binary, partials: Binary]
//! ```
//!
//! `key` holds the encoded grouping key and `partials` the rkyv archive of
//! that key's `Vec<PartialAggregate>`. The [`WindowCombiner`] merges the
//! rows of every child with `merge_partials` and finalizes a window once
//! every child reported it, or once every child's watermark passed its end
//! (a child without records in a window never reports it).
//!
//! Each child is expected to deliver its partials for a window before the
//! watermark that closed it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{Array, BinaryArray, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use smallvec::SmallVec;

use super::function::PartialAggregate;
use super::state::PartialMap;
use super::{AggregationLayout, WindowAggregationConfig};
use crate::config::EngineConfig;
use crate::operator::{OperatorError, WindowInfo, WindowMetaData, WindowOutput};
use crate::state::StateError;
use crate::time::Timestamp;

/// Name of the encoded key column of partial rows.
pub const PARTIAL_KEY_FIELD: &str = "key";
/// Name of the encoded partials column of partial rows.
pub const PARTIAL_STATE_FIELD: &str = "partials";

/// Schema of partial rows emitted in partial mode.
#[must_use]
pub fn partial_schema(meta: &WindowMetaData) -> SchemaRef {
    let [start, end] = meta.fields();
    Arc::new(Schema::new(vec![
        start,
        end,
        Field::new(PARTIAL_KEY_FIELD, DataType::Binary, false),
        Field::new(PARTIAL_STATE_FIELD, DataType::Binary, false),
    ]))
}

/// Partial result of one window from one child, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialWindowAggregate {
    /// The window
    pub window: WindowInfo,
    /// Encoded key and its accumulators, per key
    pub entries: Vec<(Vec<u8>, Vec<PartialAggregate>)>,
}

impl PartialWindowAggregate {
    /// Decodes the partial rows of a window emitted in partial mode.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::RejectedPartial`] if the batches do not have
    /// the partial layout and [`OperatorError::State`] if an archive is
    /// invalid.
    pub fn from_output(output: &WindowOutput) -> Result<Self, OperatorError> {
        let mut entries = Vec::with_capacity(output.num_rows());
        for batch in &output.batches {
            let (keys, states) = partial_columns(batch)?;
            let mut aligned = AlignedVec::<16>::new();
            for row in 0..batch.num_rows() {
                aligned.clear();
                aligned.extend_from_slice(states.value(row));
                let partials = rkyv::from_bytes::<Vec<PartialAggregate>, RkyvError>(&aligned)
                    .map_err(|e| StateError::Deserialization(e.to_string()))?;
                entries.push((keys.value(row).to_vec(), partials));
            }
        }
        Ok(Self {
            window: output.window,
            entries,
        })
    }

    /// Number of keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.entries.len()
    }
}

fn partial_columns(batch: &RecordBatch) -> Result<(&BinaryArray, &BinaryArray), OperatorError> {
    let column = |name: &str| {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<BinaryArray>())
            .ok_or_else(|| {
                OperatorError::RejectedPartial(format!("batch has no binary '{name}' column"))
            })
    };
    Ok((column(PARTIAL_KEY_FIELD)?, column(PARTIAL_STATE_FIELD)?))
}

#[derive(Default)]
struct PendingWindow {
    reported: SmallVec<[u64; 4]>,
    merged: PartialMap,
}

#[derive(Default)]
struct CombinerState {
    pending: BTreeMap<WindowInfo, PendingWindow>,
    child_watermarks: FxHashMap<u64, Timestamp>,
    finalized_until: Timestamp,
    completed: BTreeSet<WindowInfo>,
}

/// Merges partial window results of several children.
pub struct WindowCombiner {
    layout: AggregationLayout,
    children: Vec<u64>,
    state: Mutex<CombinerState>,
    sequence: AtomicU64,
}

impl WindowCombiner {
    /// Creates a combiner for the children `children` of an aggregation
    /// over `input_schema`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for an empty or duplicate
    /// child list, and resolution errors of the aggregation.
    pub fn new(
        config: &WindowAggregationConfig,
        input_schema: &Schema,
        children: &[u64],
        engine: &EngineConfig,
    ) -> Result<Self, OperatorError> {
        let mut sorted = children.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.is_empty() || sorted.len() != children.len() {
            return Err(OperatorError::InvalidConfig(format!(
                "combiner needs distinct children, got {children:?}"
            )));
        }
        Ok(Self {
            layout: AggregationLayout::try_new(config, input_schema, engine.emit_batch_rows)?,
            children: sorted,
            state: Mutex::new(CombinerState::default()),
            sequence: AtomicU64::new(1),
        })
    }

    /// Schema of finalized output.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(self.layout.output_schema())
    }

    /// Number of windows waiting for children.
    #[must_use]
    pub fn pending_windows(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn reject(child: u64, window: WindowInfo, reason: &str) -> OperatorError {
        tracing::warn!(child, %window, reason, "rejected partial window");
        OperatorError::RejectedPartial(format!("child {child}, window {window}: {reason}"))
    }

    /// Merges one child's partial window. Returns the finalized window if
    /// this was the last child to report it.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::RejectedPartial`] for unknown children,
    /// repeated reports of a window by the same child, windows that were
    /// already finalized and malformed partials.
    pub fn combine(&self, child: u64, output: &WindowOutput) -> Result<Option<WindowOutput>, OperatorError> {
        let window = output.window;
        if self.children.binary_search(&child).is_err() {
            return Err(Self::reject(child, window, "unknown child"));
        }
        let partial = PartialWindowAggregate::from_output(output)?;
        let functions = self.layout.functions();
        if partial
            .entries
            .iter()
            .any(|(_, partials)| partials.len() != functions.len())
        {
            return Err(Self::reject(child, window, "wrong number of aggregates"));
        }
        if partial.entries.iter().any(|(_, partials)| {
            functions
                .iter()
                .zip(partials)
                .any(|(function, partial)| !function.accepts(partial))
        }) {
            return Err(Self::reject(child, window, "aggregate kinds do not match"));
        }

        let done = {
            let mut state = self.state.lock();
            if window.end <= state.finalized_until || state.completed.contains(&window) {
                return Err(Self::reject(child, window, "window already finalized"));
            }
            let pending = state.pending.entry(window).or_default();
            if pending.reported.contains(&child) {
                return Err(Self::reject(child, window, "window reported twice"));
            }
            pending.reported.push(child);
            for (key, partials) in partial.entries {
                match pending.merged.get_mut(key.as_slice()) {
                    Some(acc) => {
                        for ((function, acc), partial) in functions.iter().zip(acc).zip(&partials) {
                            function.merge_partials(acc, partial)?;
                        }
                    }
                    None => {
                        pending.merged.insert(key.into_boxed_slice(), partials);
                    }
                }
            }

            if pending.reported.len() == self.children.len() {
                state.completed.insert(window);
                state.pending.remove(&window).map(|pending| pending.merged)
            } else {
                None
            }
        };

        done.map(|merged| self.finish(window, merged)).transpose()
    }

    /// Records a child's watermark and finalizes every pending window that
    /// all children have moved past.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::RejectedPartial`] for unknown children and
    /// errors from output assembly.
    pub fn advance(&self, child: u64, watermark: Timestamp) -> Result<Vec<WindowOutput>, OperatorError> {
        if self.children.binary_search(&child).is_err() {
            return Err(Self::reject(child, WindowInfo::new(watermark, watermark), "unknown child"));
        }
        let ready: Vec<(WindowInfo, PartialMap)> = {
            let mut state = self.state.lock();
            let current = state.child_watermarks.entry(child).or_insert(0);
            *current = (*current).max(watermark);

            let min = self
                .children
                .iter()
                .map(|c| state.child_watermarks.get(c).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            if min <= state.finalized_until {
                return Ok(Vec::new());
            }
            state.finalized_until = min;
            state.completed.retain(|w| w.end > min);

            let closed: Vec<WindowInfo> = state
                .pending
                .keys()
                .filter(|w| w.end <= min)
                .copied()
                .collect();
            closed
                .into_iter()
                .filter_map(|w| state.pending.remove(&w).map(|p| (w, p.merged)))
                .collect()
        };

        ready
            .into_iter()
            .map(|(window, merged)| self.finish(window, merged))
            .collect()
    }

    fn finish(&self, window: WindowInfo, merged: PartialMap) -> Result<WindowOutput, OperatorError> {
        let batches = self.layout.finalize_window(window, merged)?;
        tracing::debug!(%window, "combined window");
        Ok(WindowOutput {
            sequence_number: self.sequence.fetch_add(1, Ordering::AcqRel),
            window,
            batches,
        })
    }
}

impl std::fmt::Debug for WindowCombiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCombiner")
            .field("children", &self.children)
            .field("pending", &self.pending_windows())
            .finish_non_exhaustive()
    }
}
