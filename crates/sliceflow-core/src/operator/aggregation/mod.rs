//! # Windowed Aggregation
//!
//! Slice-based sliding and tumbling window aggregation.
//!
//! Records are folded into per-slice, per-key partial aggregates by
//! [`AggregationBuild`]. When the watermark passes a window's end,
//! [`AggregationTrigger`] merges the partials of every slice in that
//! window, finalizes them and emits one row per key:
//!
//! ```text
//! [start, end, key fields..., aggregate fields...]
//! ```
//!
//! Both operators share one [`AggregationOperatorHandler`], which owns the
//! slice store and the watermark registry.
//!
//! ## Distributed combining
//!
//! A handler configured with [`EmitMode::Partial`] emits un-finalized
//! partials instead (one row per key, see [`combiner::partial_schema`]).
//! A [`WindowCombiner`] on the coordinator merges the partials of every
//! child with the same `merge_partials` used across slices and finalizes.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow_array::{ArrayRef, Int64Array, RecordBatch, UInt64Array};
//! use sliceflow_core::operator::aggregation::{
//!     AggregationBuild, AggregationOperatorHandler, AggregationSpec, AggregationTrigger,
//!     WindowAggregationConfig,
//! };
//! use sliceflow_core::operator::handler::{OperatorHandlerId, PipelineExecutionContext};
//! use sliceflow_core::time::{OriginId, SequenceData, TimeFunction, WatermarkUpdate};
//! use sliceflow_core::EngineConfig;
//!
//! let batch = RecordBatch::try_from_iter(vec![
//!     ("id", Arc::new(Int64Array::from(vec![1, 1, 1])) as ArrayRef),
//!     ("value", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
//!     ("ts", Arc::new(UInt64Array::from(vec![1000_u64, 1500, 2000])) as ArrayRef),
//! ])
//! .unwrap();
//!
//! let config = WindowAggregationConfig::builder()
//!     .tumbling(1000)
//!     .time(TimeFunction::event_time("ts"))
//!     .group_by(["id"])
//!     .aggregate(AggregationSpec::sum("value", "total"))
//!     .build()
//!     .unwrap();
//!
//! let ctx = PipelineExecutionContext::new(1, EngineConfig::default());
//! let handler = Arc::new(
//!     AggregationOperatorHandler::new(
//!         OperatorHandlerId(1),
//!         config,
//!         batch.schema(),
//!         &[OriginId(0)],
//!         ctx.config(),
//!     )
//!     .unwrap(),
//! );
//! ctx.install(Arc::clone(&handler)).unwrap();
//!
//! AggregationBuild::new(Arc::clone(&handler)).execute(&batch).unwrap();
//! let windows = AggregationTrigger::new(handler)
//!     .on_watermark(WatermarkUpdate::new(2000, SequenceData::single(1), OriginId(0)))
//!     .unwrap();
//!
//! assert_eq!(windows.len(), 1);
//! assert_eq!((windows[0].start(), windows[0].end()), (1000, 2000));
//! assert_eq!(windows[0].num_rows(), 1);
//! ```

pub mod combiner;
pub mod function;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{BinaryArray, RecordBatch};
use arrow_schema::{Schema, SchemaRef};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::handler::{
    Lifecycle, OperatorHandler, OperatorHandlerId, PipelineExecutionContext, QueryTerminationType,
};
use super::key::KeyEncoder;
use super::slice_assigner::{SliceAssigner, SliceRange, WindowInfo};
use super::slice_store::{Slice, SliceStoreMetrics, TimeBasedSliceStore, WindowState};
use super::{chunk_ranges, window_columns, OperatorError, WindowMetaData, WindowOutput};
use crate::config::EngineConfig;
use crate::state::{SnapshotKind, StateError};
use crate::time::{
    OriginId, TimeFunction, Timestamp, Watermark, WatermarkRegistry, WatermarkSnapshot,
    WatermarkUpdate,
};

pub use combiner::{partial_schema, PartialWindowAggregate, WindowCombiner};
pub use function::{
    AggregationFunction, AggregationKind, AggregationSpec, NumericType, NumericValue,
    PartialAggregate,
};
pub use state::{AggregationSliceState, PartialMap};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What a trigger emits for a closed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// Finalized result rows
    #[default]
    Final,
    /// Encoded partial aggregates, for a downstream [`WindowCombiner`]
    Partial,
}

/// A validated windowed aggregation.
#[derive(Debug, Clone)]
pub struct WindowAggregationConfig {
    assigner: SliceAssigner,
    time: TimeFunction,
    keys: Vec<String>,
    aggregations: Vec<AggregationSpec>,
    meta: WindowMetaData,
    emit_mode: EmitMode,
}

impl WindowAggregationConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> WindowAggregationConfigBuilder {
        WindowAggregationConfigBuilder::default()
    }

    /// Slice assigner for the window size and slide.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Time function.
    #[must_use]
    pub fn time(&self) -> &TimeFunction {
        &self.time
    }

    /// Grouping key columns.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Aggregations, in output order.
    #[must_use]
    pub fn aggregations(&self) -> &[AggregationSpec] {
        &self.aggregations
    }

    /// Window metadata field names.
    #[must_use]
    pub fn window_metadata(&self) -> &WindowMetaData {
        &self.meta
    }

    /// Emit mode.
    #[must_use]
    pub fn emit_mode(&self) -> EmitMode {
        self.emit_mode
    }

    /// Copy of this configuration with another emit mode.
    #[must_use]
    pub fn with_emit_mode(mut self, emit_mode: EmitMode) -> Self {
        self.emit_mode = emit_mode;
        self
    }
}

/// Builder for [`WindowAggregationConfig`].
#[derive(Debug, Default)]
pub struct WindowAggregationConfigBuilder {
    window: Option<(Timestamp, Timestamp)>,
    time: Option<TimeFunction>,
    keys: Vec<String>,
    aggregations: Vec<AggregationSpec>,
    meta: Option<WindowMetaData>,
    emit_mode: EmitMode,
}

impl WindowAggregationConfigBuilder {
    /// Non-overlapping windows of `size` milliseconds.
    #[must_use]
    pub fn tumbling(mut self, size: Timestamp) -> Self {
        self.window = Some((size, size));
        self
    }

    /// Windows of `size` milliseconds starting every `slide` milliseconds.
    #[must_use]
    pub fn sliding(mut self, size: Timestamp, slide: Timestamp) -> Self {
        self.window = Some((size, slide));
        self
    }

    /// How record timestamps are obtained.
    #[must_use]
    pub fn time(mut self, time: TimeFunction) -> Self {
        self.time = Some(time);
        self
    }

    /// Grouping key columns.
    #[must_use]
    pub fn group_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Appends an aggregation.
    #[must_use]
    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.aggregations.push(spec);
        self
    }

    /// Window metadata field names (default `start`/`end`).
    #[must_use]
    pub fn window_metadata(mut self, meta: WindowMetaData) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Emit mode (default [`EmitMode::Final`]).
    #[must_use]
    pub fn emit_mode(mut self, emit_mode: EmitMode) -> Self {
        self.emit_mode = emit_mode;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidWindow`] for an invalid size/slide
    /// and [`OperatorError::InvalidConfig`] if the window, the time
    /// function or every aggregation is missing.
    pub fn build(self) -> Result<WindowAggregationConfig, OperatorError> {
        let (size, slide) = self
            .window
            .ok_or_else(|| OperatorError::InvalidConfig("window size not set".into()))?;
        let assigner = SliceAssigner::new(size, slide)?;
        let time = self
            .time
            .ok_or_else(|| OperatorError::InvalidConfig("time function not set".into()))?;
        if self.aggregations.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "window aggregation without aggregation functions".into(),
            ));
        }
        Ok(WindowAggregationConfig {
            assigner,
            time,
            keys: self.keys,
            aggregations: self.aggregations,
            meta: self.meta.unwrap_or_default(),
            emit_mode: self.emit_mode,
        })
    }
}

// ---------------------------------------------------------------------------
// Output layout
// ---------------------------------------------------------------------------

/// Resolved functions, key encoding and output schemas of one aggregation.
pub(crate) struct AggregationLayout {
    functions: Vec<AggregationFunction>,
    keys: KeyEncoder,
    output_schema: SchemaRef,
    partial_schema: SchemaRef,
    emit_batch_rows: usize,
}

impl AggregationLayout {
    pub(crate) fn try_new(
        config: &WindowAggregationConfig,
        input_schema: &Schema,
        emit_batch_rows: usize,
    ) -> Result<Self, OperatorError> {
        config.time.validate_schema(input_schema)?;
        let functions = config
            .aggregations
            .iter()
            .map(|spec| AggregationFunction::try_new(spec, input_schema))
            .collect::<Result<Vec<_>, _>>()?;
        let keys = KeyEncoder::new(input_schema, &config.keys)?;

        let mut fields: Vec<_> = config.meta.fields().into_iter().collect();
        fields.extend(keys.fields());
        fields.extend(functions.iter().map(AggregationFunction::output_field));
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name() == field.name()) {
                return Err(OperatorError::InvalidConfig(format!(
                    "duplicate output field '{}'",
                    field.name()
                )));
            }
        }

        Ok(Self {
            functions,
            keys,
            output_schema: Arc::new(Schema::new(fields)),
            partial_schema: partial_schema(&config.meta),
            emit_batch_rows,
        })
    }

    pub(crate) fn functions(&self) -> &[AggregationFunction] {
        &self.functions
    }

    pub(crate) fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    fn sorted(merged: PartialMap) -> Vec<(Box<[u8]>, Vec<PartialAggregate>)> {
        let mut entries: Vec<_> = merged.into_iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// One result row per key, ordered by key.
    pub(crate) fn finalize_window(
        &self,
        window: WindowInfo,
        merged: PartialMap,
    ) -> Result<Vec<RecordBatch>, OperatorError> {
        let entries = Self::sorted(merged);
        chunk_ranges(entries.len(), self.emit_batch_rows)
            .map(|(offset, len)| -> Result<RecordBatch, OperatorError> {
                let chunk = &entries[offset..offset + len];
                let mut columns = window_columns(window, len);
                columns.extend(self.keys.decode(chunk.iter().map(|(key, _)| key.as_ref()))?);
                for (i, function) in self.functions.iter().enumerate() {
                    columns.push(function.finalize_array(chunk.iter().map(|(_, p)| &p[i])));
                }
                Ok(RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?)
            })
            .collect()
    }

    /// One encoded partial row per key, ordered by key.
    pub(crate) fn partial_window(
        &self,
        window: WindowInfo,
        merged: PartialMap,
    ) -> Result<Vec<RecordBatch>, OperatorError> {
        let entries = Self::sorted(merged);
        chunk_ranges(entries.len(), self.emit_batch_rows)
            .map(|(offset, len)| -> Result<RecordBatch, OperatorError> {
                let chunk = &entries[offset..offset + len];
                let encoded = chunk
                    .iter()
                    .map(|(_, partials)| {
                        rkyv::to_bytes::<RkyvError>(partials)
                            .map_err(|e| StateError::Serialization(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let mut columns = window_columns(window, len);
                columns.push(Arc::new(BinaryArray::from_iter_values(
                    chunk.iter().map(|(key, _)| key.as_ref()),
                )));
                columns.push(Arc::new(BinaryArray::from_iter_values(
                    encoded.iter().map(|bytes| bytes.as_slice()),
                )));
                Ok(RecordBatch::try_new(Arc::clone(&self.partial_schema), columns)?)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct SliceSnapshot {
    range: SliceRange,
    entries: Vec<(Vec<u8>, Vec<PartialAggregate>)>,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct AggregationSnapshot {
    watermarks: WatermarkSnapshot,
    trigger_watermark: Timestamp,
    next_sequence: u64,
    windows: Vec<(WindowInfo, WindowState)>,
    slices: Vec<SliceSnapshot>,
}

// ---------------------------------------------------------------------------
// AggregationOperatorHandler
// ---------------------------------------------------------------------------

/// Shared state of one windowed aggregation.
pub struct AggregationOperatorHandler {
    id: OperatorHandlerId,
    lifecycle: Lifecycle,
    config: WindowAggregationConfig,
    input_schema: SchemaRef,
    layout: AggregationLayout,
    store: TimeBasedSliceStore<AggregationSliceState>,
    watermarks: WatermarkRegistry,
    /// Inserts hold the read side; window state transitions the write side.
    ingest: RwLock<()>,
    sequence: AtomicU64,
    shards: usize,
}

impl AggregationOperatorHandler {
    /// Creates a handler fed by `origins`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not fit `input_schema`.
    pub fn new(
        id: OperatorHandlerId,
        config: WindowAggregationConfig,
        input_schema: SchemaRef,
        origins: &[OriginId],
        engine: &EngineConfig,
    ) -> Result<Self, OperatorError> {
        Self::with_registry(id, config, input_schema, WatermarkRegistry::new(origins), engine)
    }

    fn with_registry(
        id: OperatorHandlerId,
        config: WindowAggregationConfig,
        input_schema: SchemaRef,
        watermarks: WatermarkRegistry,
        engine: &EngineConfig,
    ) -> Result<Self, OperatorError> {
        engine
            .validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;
        let layout = AggregationLayout::try_new(&config, &input_schema, engine.emit_batch_rows)?;
        let shards = engine.shards_for(engine.worker_threads);
        let store = TimeBasedSliceStore::new(config.assigner, move |_| {
            AggregationSliceState::new(shards)
        });
        Ok(Self {
            id,
            lifecycle: Lifecycle::new(id),
            config,
            input_schema,
            layout,
            store,
            watermarks,
            ingest: RwLock::new(()),
            sequence: AtomicU64::new(1),
            shards,
        })
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &WindowAggregationConfig {
        &self.config
    }

    /// Schema of build input batches.
    #[must_use]
    pub fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    /// Schema of emitted batches, depending on the emit mode.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        match self.config.emit_mode {
            EmitMode::Final => Arc::clone(&self.layout.output_schema),
            EmitMode::Partial => Arc::clone(&self.layout.partial_schema),
        }
    }

    /// Effective watermark across origins.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.watermarks.current()
    }

    /// Slice store counters.
    #[must_use]
    pub fn metrics(&self) -> SliceStoreMetrics {
        self.store.metrics()
    }

    /// The slice store.
    #[must_use]
    pub fn store(&self) -> &TimeBasedSliceStore<AggregationSliceState> {
        &self.store
    }

    /// Folds a batch into slice state. Returns the number of accepted rows.
    fn ingest(&self, batch: &RecordBatch) -> Result<usize, OperatorError> {
        if batch.num_rows() == 0 {
            return Ok(0);
        }
        let timestamps = self.config.time.extract(batch)?;
        let keys = self.layout.keys.encode(batch)?;
        let inputs = self
            .layout
            .functions
            .iter()
            .map(|function| function.bind(batch))
            .collect::<Result<Vec<_>, _>>()?;

        let _ingest = self.ingest.read();
        let trigger_watermark = self.store.trigger_watermark();
        let assigner = self.store.assigner();
        let mut groups: Vec<(Arc<Slice<AggregationSliceState>>, Vec<usize>)> = Vec::new();
        let mut group_of: FxHashMap<SliceRange, usize> = FxHashMap::default();
        let mut late = 0_u64;

        for (row, &ts) in timestamps.iter().enumerate() {
            if ts < trigger_watermark {
                late += 1;
                continue;
            }
            let range = assigner.slice_for(ts);
            if let Some(&group) = group_of.get(&range) {
                groups[group].1.push(row);
                continue;
            }
            if let Some(slice) = self.store.get_or_create_slice(ts) {
                group_of.insert(range, groups.len());
                groups.push((slice, vec![row]));
            }
        }

        let mut accepted = 0;
        for (slice, rows) in &groups {
            slice
                .state()
                .update(&self.layout.functions, &inputs, &keys, rows);
            accepted += rows.len();
        }

        if late > 0 {
            self.store.record_late(late);
            tracing::warn!(handler = %self.id, late, trigger_watermark, "dropped late records");
        }
        Ok(accepted)
    }

    fn merge_slices(
        &self,
        slices: &[Arc<Slice<AggregationSliceState>>],
    ) -> Result<PartialMap, OperatorError> {
        let mut merged = PartialMap::default();
        for slice in slices {
            slice.state().merge_into(&self.layout.functions, &mut merged)?;
        }
        Ok(merged)
    }

    fn emit(&self, window: WindowInfo, merged: PartialMap) -> Result<WindowOutput, OperatorError> {
        let batches = match self.config.emit_mode {
            EmitMode::Final => self.layout.finalize_window(window, merged),
            EmitMode::Partial => self.layout.partial_window(window, merged),
        }
        .inspect_err(|e| {
            tracing::error!(handler = %self.id, %window, error = %e, "failed to assemble window output");
        })?;
        Ok(WindowOutput {
            sequence_number: self.sequence.fetch_add(1, Ordering::AcqRel),
            window,
            batches,
        })
    }

    fn emit_all(
        &self,
        merged: Vec<(WindowInfo, Result<PartialMap, OperatorError>)>,
    ) -> Result<Vec<WindowOutput>, OperatorError> {
        merged
            .into_iter()
            .map(|(window, partials)| self.emit(window, partials?))
            .collect()
    }

    /// Triggers and emits every window ending at or before `watermark`,
    /// then evicts slices no window needs anymore.
    fn trigger(&self, watermark: Timestamp) -> Result<Vec<WindowOutput>, OperatorError> {
        let merged = {
            let _barrier = self.ingest.write();
            self.store
                .trigger_ready_windows(watermark, |_, slices| self.merge_slices(slices))
        };
        let outputs = self.emit_all(merged)?;
        self.store.evict_slices_before(watermark);
        Ok(outputs)
    }

    fn advance(&self, update: WatermarkUpdate) -> Result<Vec<WindowOutput>, OperatorError> {
        let watermark = self
            .watermarks
            .update(update.watermark, update.sequence, update.origin)?;
        self.trigger(watermark.timestamp())
    }

    /// Encodes the handler state covering `from` and later.
    ///
    /// Slices ending at or before `from` and windows ending at or before
    /// `from` are left out.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] after stop and
    /// [`OperatorError::State`] if encoding fails.
    pub fn snapshot(&self, from: Timestamp) -> Result<Vec<u8>, OperatorError> {
        let _guard = self.lifecycle.enter()?;
        let _barrier = self.ingest.write();
        let snapshot = AggregationSnapshot {
            watermarks: self.watermarks.snapshot(),
            trigger_watermark: self.store.trigger_watermark(),
            next_sequence: self.sequence.load(Ordering::Acquire),
            windows: self
                .store
                .window_states()
                .into_iter()
                .filter(|(window, _)| window.end > from)
                .collect(),
            slices: self
                .store
                .slices_from(from)
                .iter()
                .map(|slice| SliceSnapshot {
                    range: slice.range(),
                    entries: slice.state().entries(),
                })
                .collect(),
        };
        tracing::debug!(handler = %self.id, from, slices = snapshot.slices.len(), "snapshot");
        Ok(crate::state::encode(SnapshotKind::Aggregation, &snapshot)?)
    }

    /// Rebuilds a handler from [`Self::snapshot`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::State`] for undecodable bytes and the same
    /// errors as [`Self::new`].
    pub fn restore(
        id: OperatorHandlerId,
        config: WindowAggregationConfig,
        input_schema: SchemaRef,
        engine: &EngineConfig,
        bytes: &[u8],
    ) -> Result<Self, OperatorError> {
        let snapshot: AggregationSnapshot =
            crate::state::decode(SnapshotKind::Aggregation, bytes)?;
        let handler = Self::with_registry(
            id,
            config,
            input_schema,
            WatermarkRegistry::restore(&snapshot.watermarks),
            engine,
        )?;
        let shards = handler.shards;
        handler.store.restore(
            snapshot.slices.into_iter().map(|slice| {
                Slice::new(
                    slice.range,
                    AggregationSliceState::from_entries(shards, slice.entries),
                )
            }),
            snapshot.windows,
            snapshot.trigger_watermark,
        );
        handler
            .sequence
            .store(snapshot.next_sequence, Ordering::Release);
        tracing::info!(handler = %id, slices = handler.store.slice_count(), "restored aggregation handler");
        Ok(handler)
    }
}

impl OperatorHandler for AggregationOperatorHandler {
    fn id(&self) -> OperatorHandlerId {
        self.id
    }

    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), OperatorError> {
        self.lifecycle.start()?;
        tracing::info!(
            handler = %self.id,
            query = ctx.query_id(),
            size = self.config.assigner.size(),
            slide = self.config.assigner.slide(),
            shards = self.shards,
            "started window aggregation"
        );
        Ok(())
    }

    fn stop(&self, termination: QueryTerminationType) -> Result<Vec<WindowOutput>, OperatorError> {
        let Some(_stop) = self.lifecycle.begin_stop() else {
            return Ok(Vec::new());
        };
        let outputs = if termination.flushes() {
            let merged = {
                let _barrier = self.ingest.write();
                self.store.trigger_all_windows(|_, slices| self.merge_slices(slices))
            };
            self.emit_all(merged)
        } else {
            Ok(Vec::new())
        };
        self.store.clear();
        tracing::info!(handler = %self.id, ?termination, "stopped window aggregation");
        outputs
    }
}

impl std::fmt::Debug for AggregationOperatorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationOperatorHandler")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("watermarks", &self.watermarks)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Physical operators
// ---------------------------------------------------------------------------

/// Build operator: folds input batches into slice state.
///
/// Cheap to clone; one instance per worker thread.
#[derive(Debug, Clone)]
pub struct AggregationBuild {
    handler: Arc<AggregationOperatorHandler>,
}

impl AggregationBuild {
    /// Creates a build operator for `handler`.
    #[must_use]
    pub fn new(handler: Arc<AggregationOperatorHandler>) -> Self {
        Self { handler }
    }

    /// Processes one batch. Returns the number of rows accepted; late
    /// rows are dropped and counted.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] after stop, and time or
    /// Arrow errors for malformed input.
    pub fn execute(&self, batch: &RecordBatch) -> Result<usize, OperatorError> {
        let _guard = self.handler.lifecycle.enter()?;
        self.handler.ingest(batch)
    }
}

/// Trigger operator: turns watermark reports into closed windows.
#[derive(Debug, Clone)]
pub struct AggregationTrigger {
    handler: Arc<AggregationOperatorHandler>,
}

impl AggregationTrigger {
    /// Creates a trigger operator for `handler`.
    #[must_use]
    pub fn new(handler: Arc<AggregationOperatorHandler>) -> Self {
        Self { handler }
    }

    /// Applies a watermark report and emits every window it closes.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] after stop,
    /// [`OperatorError::Time`] for unknown origins, and errors from output
    /// assembly.
    pub fn on_watermark(&self, update: WatermarkUpdate) -> Result<Vec<WindowOutput>, OperatorError> {
        let _guard = self.handler.lifecycle.enter()?;
        self.handler.advance(update)
    }
}
