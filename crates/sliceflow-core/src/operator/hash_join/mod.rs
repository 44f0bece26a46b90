//! # Windowed Hash Join
//!
//! Symmetric stream-stream equi-join over sliding or tumbling windows.
//!
//! Two build operators ([`JoinBuild::left`], [`JoinBuild::right`]) store
//! their rows in the slices of a shared [`JoinOperatorHandler`], indexed by
//! encoded join key. When the watermark passes a window's end,
//! [`JoinProbe`] matches the left and right rows of every slice in the
//! window and emits one row per matching pair:
//!
//! ```text
//! [start, end, left fields..., right fields...]
//! ```
//!
//! Colliding field names are disambiguated by [`joined_schema`]. Keys of
//! both sides are cast to a common type first ([`common_key_type`]), so an
//! `Int8` key joins an `Int32` key. Rows with a null key, or a key that
//! does not fit the common type, never match.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow_array::{ArrayRef, Int64Array, RecordBatch, UInt64Array};
//! use sliceflow_core::operator::handler::{OperatorHandlerId, PipelineExecutionContext};
//! use sliceflow_core::operator::hash_join::{
//!     HashJoinConfig, JoinBuild, JoinOperatorHandler, JoinProbe,
//! };
//! use sliceflow_core::time::{OriginId, SequenceData, TimeFunction, WatermarkUpdate};
//! use sliceflow_core::EngineConfig;
//!
//! let left = RecordBatch::try_from_iter(vec![
//!     ("id", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
//!     ("ts", Arc::new(UInt64Array::from(vec![1000_u64])) as ArrayRef),
//! ])
//! .unwrap();
//! let right = RecordBatch::try_from_iter(vec![
//!     ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
//!     ("ts", Arc::new(UInt64Array::from(vec![1002_u64, 1500])) as ArrayRef),
//! ])
//! .unwrap();
//!
//! let config = HashJoinConfig::builder()
//!     .tumbling(1000)
//!     .left_schema(left.schema())
//!     .right_schema(right.schema())
//!     .on("id", "id")
//!     .time(TimeFunction::event_time("ts"))
//!     .build()
//!     .unwrap();
//!
//! let ctx = PipelineExecutionContext::new(1, EngineConfig::default());
//! let handler = Arc::new(
//!     JoinOperatorHandler::new(OperatorHandlerId(7), config, &[OriginId(0)], ctx.config()).unwrap(),
//! );
//! ctx.install(Arc::clone(&handler)).unwrap();
//!
//! JoinBuild::left(Arc::clone(&handler)).execute(&left).unwrap();
//! JoinBuild::right(Arc::clone(&handler)).execute(&right).unwrap();
//! let windows = JoinProbe::new(handler)
//!     .on_watermark(WatermarkUpdate::new(2000, SequenceData::single(1), OriginId(0)))
//!     .unwrap();
//!
//! assert_eq!(windows.len(), 1);
//! assert_eq!(windows[0].num_rows(), 1);
//! ```

mod probe;
pub mod schema;
pub mod state;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{RecordBatch, UInt32Array};
use arrow_schema::{DataType, SchemaRef};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use self::probe::WindowMatches;
use super::handler::{
    Lifecycle, OperatorHandler, OperatorHandlerId, PipelineExecutionContext, QueryTerminationType,
};
use super::key::KeyEncoder;
use super::slice_assigner::{SliceAssigner, SliceRange, WindowInfo};
use super::slice_store::{Slice, SliceStoreMetrics, TimeBasedSliceStore, WindowState};
use super::{OperatorError, WindowMetaData, WindowOutput};
use crate::config::EngineConfig;
use crate::state::SnapshotKind;
use crate::time::{
    OriginId, TimeFunction, Timestamp, Watermark, WatermarkRegistry, WatermarkSnapshot,
    WatermarkUpdate,
};

pub use schema::{common_key_type, joined_schema};
pub use state::{JoinSliceState, RowRef};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Input side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left input
    Left,
    /// Right input
    Right,
}

impl JoinSide {
    /// The other side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// How a triggered window matches its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Per-shard hash table over the right side, probed with the left side
    #[default]
    HashJoin,
    /// Compare every left row with every right row
    NestedLoop,
}

/// A validated windowed equi-join.
#[derive(Debug, Clone)]
pub struct HashJoinConfig {
    assigner: SliceAssigner,
    left_schema: SchemaRef,
    right_schema: SchemaRef,
    left_keys: Vec<String>,
    right_keys: Vec<String>,
    key_types: Vec<DataType>,
    left_time: TimeFunction,
    right_time: TimeFunction,
    meta: WindowMetaData,
    strategy: JoinStrategy,
    output_schema: SchemaRef,
}

impl HashJoinConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> HashJoinConfigBuilder {
        HashJoinConfigBuilder::default()
    }

    /// Slice assigner for the window size and slide.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Schema of one input.
    #[must_use]
    pub fn schema(&self, side: JoinSide) -> &SchemaRef {
        match side {
            JoinSide::Left => &self.left_schema,
            JoinSide::Right => &self.right_schema,
        }
    }

    /// Key columns of one input, pairwise equal to the other side's.
    #[must_use]
    pub fn keys(&self, side: JoinSide) -> &[String] {
        match side {
            JoinSide::Left => &self.left_keys,
            JoinSide::Right => &self.right_keys,
        }
    }

    /// Types both sides' keys are cast to.
    #[must_use]
    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    /// Time function of one input.
    #[must_use]
    pub fn time(&self, side: JoinSide) -> &TimeFunction {
        match side {
            JoinSide::Left => &self.left_time,
            JoinSide::Right => &self.right_time,
        }
    }

    /// Window metadata field names.
    #[must_use]
    pub fn window_metadata(&self) -> &WindowMetaData {
        &self.meta
    }

    /// Probe strategy.
    #[must_use]
    pub fn strategy(&self) -> JoinStrategy {
        self.strategy
    }

    /// Output schema `[start, end, left..., right...]`.
    #[must_use]
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    /// Copy of this configuration with another probe strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: JoinStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Builder for [`HashJoinConfig`].
#[derive(Debug, Default)]
pub struct HashJoinConfigBuilder {
    window: Option<(Timestamp, Timestamp)>,
    left_schema: Option<SchemaRef>,
    right_schema: Option<SchemaRef>,
    left_keys: Vec<String>,
    right_keys: Vec<String>,
    key_types: Option<Vec<DataType>>,
    left_time: Option<TimeFunction>,
    right_time: Option<TimeFunction>,
    meta: Option<WindowMetaData>,
    strategy: JoinStrategy,
}

impl HashJoinConfigBuilder {
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

    /// Left input schema.
    #[must_use]
    pub fn left_schema(mut self, schema: SchemaRef) -> Self {
        self.left_schema = Some(schema);
        self
    }

    /// Right input schema.
    #[must_use]
    pub fn right_schema(mut self, schema: SchemaRef) -> Self {
        self.right_schema = Some(schema);
        self
    }

    /// Adds the equality `left.column = right.column`.
    #[must_use]
    pub fn on(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.left_keys.push(left.into());
        self.right_keys.push(right.into());
        self
    }

    /// Explicit common key types, one per equality. Derived with
    /// [`common_key_type`] when not set.
    #[must_use]
    pub fn key_types(mut self, key_types: Vec<DataType>) -> Self {
        self.key_types = Some(key_types);
        self
    }

    /// Time function of both inputs.
    #[must_use]
    pub fn time(mut self, time: TimeFunction) -> Self {
        self.left_time = Some(time.clone());
        self.right_time = Some(time);
        self
    }

    /// Time function of the left input.
    #[must_use]
    pub fn left_time(mut self, time: TimeFunction) -> Self {
        self.left_time = Some(time);
        self
    }

    /// Time function of the right input.
    #[must_use]
    pub fn right_time(mut self, time: TimeFunction) -> Self {
        self.right_time = Some(time);
        self
    }

    /// Window metadata field names (default `start`/`end`).
    #[must_use]
    pub fn window_metadata(mut self, meta: WindowMetaData) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Probe strategy (default [`JoinStrategy::HashJoin`]).
    #[must_use]
    pub fn strategy(mut self, strategy: JoinStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidWindow`] for an invalid size/slide,
    /// [`OperatorError::InvalidConfig`] for missing settings or a join
    /// without keys, [`OperatorError::ColumnNotFound`] for unknown key
    /// columns and [`OperatorError::UnsupportedType`] for key pairs without
    /// a common type.
    pub fn build(self) -> Result<HashJoinConfig, OperatorError> {
        let (size, slide) = self
            .window
            .ok_or_else(|| OperatorError::InvalidConfig("window size not set".into()))?;
        let assigner = SliceAssigner::new(size, slide)?;
        let left_schema = self
            .left_schema
            .ok_or_else(|| OperatorError::InvalidConfig("left schema not set".into()))?;
        let right_schema = self
            .right_schema
            .ok_or_else(|| OperatorError::InvalidConfig("right schema not set".into()))?;
        let (Some(left_time), Some(right_time)) = (self.left_time, self.right_time) else {
            return Err(OperatorError::InvalidConfig("time function not set".into()));
        };
        if self.left_keys.is_empty() {
            return Err(OperatorError::InvalidConfig("join without equality keys".into()));
        }
        left_time.validate_schema(&left_schema)?;
        right_time.validate_schema(&right_schema)?;

        let key_type = |schema: &SchemaRef, name: &String| {
            schema
                .field_with_name(name)
                .map(|field| field.data_type().clone())
                .map_err(|_| OperatorError::ColumnNotFound(name.clone()))
        };
        let mut derived = Vec::with_capacity(self.left_keys.len());
        for (left, right) in self.left_keys.iter().zip(&self.right_keys) {
            let (l, r) = (key_type(&left_schema, left)?, key_type(&right_schema, right)?);
            let common = common_key_type(&l, &r).ok_or_else(|| OperatorError::UnsupportedType {
                column: format!("{left} = {right}"),
                data_type: format!("{l} vs {r}"),
            })?;
            derived.push(common);
        }
        let key_types = match self.key_types {
            Some(explicit) if explicit.len() != derived.len() => {
                return Err(OperatorError::InvalidConfig(format!(
                    "{} key types for {} equalities",
                    explicit.len(),
                    derived.len()
                )))
            }
            Some(explicit) => explicit,
            None => derived,
        };

        let meta = self.meta.unwrap_or_default();
        let output_schema = joined_schema(&left_schema, &right_schema, &meta);
        Ok(HashJoinConfig {
            assigner,
            left_schema,
            right_schema,
            left_keys: self.left_keys,
            right_keys: self.right_keys,
            key_types,
            left_time,
            right_time,
            meta,
            strategy: self.strategy,
            output_schema,
        })
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Point-in-time counters of a join handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinMetrics {
    /// Left rows accepted
    pub left_records: u64,
    /// Right rows accepted
    pub right_records: u64,
    /// Joined rows emitted
    pub matches: u64,
    /// Slice store counters
    pub store: SliceStoreMetrics,
}

#[derive(Debug, Default)]
struct JoinCounters {
    left_records: AtomicU64,
    right_records: AtomicU64,
    matches: AtomicU64,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct JoinSliceSnapshot {
    range: SliceRange,
    /// Arrow IPC stream of the left pages
    left: Vec<u8>,
    /// Arrow IPC stream of the right pages
    right: Vec<u8>,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
struct JoinSnapshot {
    watermarks: WatermarkSnapshot,
    trigger_watermark: Timestamp,
    next_sequence: u64,
    windows: Vec<(WindowInfo, WindowState)>,
    slices: Vec<JoinSliceSnapshot>,
}

// ---------------------------------------------------------------------------
// JoinOperatorHandler
// ---------------------------------------------------------------------------

/// Shared state of one windowed join.
pub struct JoinOperatorHandler {
    id: OperatorHandlerId,
    lifecycle: Lifecycle,
    config: HashJoinConfig,
    left_keys: KeyEncoder,
    right_keys: KeyEncoder,
    store: TimeBasedSliceStore<JoinSliceState>,
    watermarks: WatermarkRegistry,
    /// Inserts hold the read side; window state transitions the write side.
    ingest: RwLock<()>,
    sequence: AtomicU64,
    shards: usize,
    emit_batch_rows: usize,
    counters: JoinCounters,
}

impl JoinOperatorHandler {
    /// Creates a handler fed by `origins` (watermarks of both inputs).
    ///
    /// # Errors
    ///
    /// Returns an error if the key columns cannot be encoded or the engine
    /// configuration is invalid.
    pub fn new(
        id: OperatorHandlerId,
        config: HashJoinConfig,
        origins: &[OriginId],
        engine: &EngineConfig,
    ) -> Result<Self, OperatorError> {
        Self::with_registry(id, config, WatermarkRegistry::new(origins), engine)
    }

    fn with_registry(
        id: OperatorHandlerId,
        config: HashJoinConfig,
        watermarks: WatermarkRegistry,
        engine: &EngineConfig,
    ) -> Result<Self, OperatorError> {
        engine
            .validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;
        let left_keys =
            KeyEncoder::with_key_types(&config.left_schema, &config.left_keys, &config.key_types)?;
        let right_keys =
            KeyEncoder::with_key_types(&config.right_schema, &config.right_keys, &config.key_types)?;
        let shards = engine.shards_for(engine.worker_threads);
        let store = TimeBasedSliceStore::new(config.assigner, move |_| JoinSliceState::new(shards));
        Ok(Self {
            id,
            lifecycle: Lifecycle::new(id),
            config,
            left_keys,
            right_keys,
            store,
            watermarks,
            ingest: RwLock::new(()),
            sequence: AtomicU64::new(1),
            shards,
            emit_batch_rows: engine.emit_batch_rows,
            counters: JoinCounters::default(),
        })
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &HashJoinConfig {
        &self.config
    }

    /// Schema of emitted batches.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.config.output_schema)
    }

    /// Effective watermark across origins.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.watermarks.current()
    }

    /// The slice store.
    #[must_use]
    pub fn store(&self) -> &TimeBasedSliceStore<JoinSliceState> {
        &self.store
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> JoinMetrics {
        JoinMetrics {
            left_records: self.counters.left_records.load(Ordering::Relaxed),
            right_records: self.counters.right_records.load(Ordering::Relaxed),
            matches: self.counters.matches.load(Ordering::Relaxed),
            store: self.store.metrics(),
        }
    }

    fn encoder(&self, side: JoinSide) -> &KeyEncoder {
        match side {
            JoinSide::Left => &self.left_keys,
            JoinSide::Right => &self.right_keys,
        }
    }

    /// Stores the rows of one input batch. Returns the number of accepted rows.
    fn ingest(&self, side: JoinSide, batch: &RecordBatch) -> Result<usize, OperatorError> {
        if batch.num_rows() == 0 {
            return Ok(0);
        }
        let batch = RecordBatch::try_new(
            Arc::clone(self.config.schema(side)),
            batch.columns().to_vec(),
        )
        .map_err(|e| OperatorError::SchemaMismatch(format!("{side} input: {e}")))?;
        let timestamps = self.config.time(side).extract(&batch)?;
        let keys = self.encoder(side).encode(&batch)?;

        let _ingest = self.ingest.read();
        let trigger_watermark = self.store.trigger_watermark();
        let assigner = self.store.assigner();
        let mut groups: Vec<(Arc<Slice<JoinSliceState>>, Vec<usize>)> = Vec::new();
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
            let page = if rows.len() == batch.num_rows() {
                batch.clone()
            } else {
                #[allow(clippy::cast_possible_truncation)]
                let indices = UInt32Array::from_iter_values(rows.iter().map(|&row| row as u32));
                arrow::compute::take_record_batch(&batch, &indices)?
            };
            slice
                .state()
                .insert(side, page, &keys, rows);
            accepted += rows.len();
        }

        let counter = match side {
            JoinSide::Left => &self.counters.left_records,
            JoinSide::Right => &self.counters.right_records,
        };
        counter.fetch_add(accepted as u64, Ordering::Relaxed);
        if late > 0 {
            self.store.record_late(late);
            tracing::warn!(handler = %self.id, %side, late, trigger_watermark, "dropped late records");
        }
        Ok(accepted)
    }

    fn probe(&self, slices: &[Arc<Slice<JoinSliceState>>]) -> WindowMatches {
        WindowMatches::probe(self.config.strategy, slices)
    }

    /// Emits every window with at least one match.
    fn emit_all(&self, matched: Vec<(WindowInfo, WindowMatches)>) -> Result<Vec<WindowOutput>, OperatorError> {
        let mut outputs = Vec::with_capacity(matched.len());
        for (window, matches) in matched {
            if matches.is_empty() {
                tracing::debug!(handler = %self.id, %window, "window without matches");
                continue;
            }
            let batches = matches
                .assemble(window, &self.config.output_schema, self.emit_batch_rows)
                .inspect_err(|e| {
                    tracing::error!(handler = %self.id, %window, error = %e, "failed to assemble join output");
                })?;
            self.counters
                .matches
                .fetch_add(matches.len() as u64, Ordering::Relaxed);
            outputs.push(WindowOutput {
                sequence_number: self.sequence.fetch_add(1, Ordering::AcqRel),
                window,
                batches,
            });
        }
        Ok(outputs)
    }

    fn trigger(&self, watermark: Timestamp) -> Result<Vec<WindowOutput>, OperatorError> {
        let matched = {
            let _barrier = self.ingest.write();
            self.store
                .trigger_ready_windows(watermark, |_, slices| self.probe(slices))
        };
        let outputs = self.emit_all(matched)?;
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
    /// Pages travel as Arrow IPC streams; key indexes are rebuilt on
    /// restore.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] after stop and
    /// [`OperatorError::State`] if encoding fails.
    pub fn snapshot(&self, from: Timestamp) -> Result<Vec<u8>, OperatorError> {
        let _guard = self.lifecycle.enter()?;
        let _barrier = self.ingest.write();
        let slices = self
            .store
            .slices_from(from)
            .iter()
            .map(|slice| -> Result<JoinSliceSnapshot, OperatorError> {
                let side = |side: JoinSide| {
                    crate::state::batches_to_ipc(
                        self.config.schema(side),
                        &slice.state().side(side).pages(),
                    )
                };
                Ok(JoinSliceSnapshot {
                    range: slice.range(),
                    left: side(JoinSide::Left)?,
                    right: side(JoinSide::Right)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot = JoinSnapshot {
            watermarks: self.watermarks.snapshot(),
            trigger_watermark: self.store.trigger_watermark(),
            next_sequence: self.sequence.load(Ordering::Acquire),
            windows: self
                .store
                .window_states()
                .into_iter()
                .filter(|(window, _)| window.end > from)
                .collect(),
            slices,
        };
        tracing::debug!(handler = %self.id, from, slices = snapshot.slices.len(), "snapshot");
        Ok(crate::state::encode(SnapshotKind::Join, &snapshot)?)
    }

    /// Rebuilds a handler from [`Self::snapshot`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::State`] for undecodable bytes and the same
    /// errors as [`Self::new`].
    pub fn restore(
        id: OperatorHandlerId,
        config: HashJoinConfig,
        engine: &EngineConfig,
        bytes: &[u8],
    ) -> Result<Self, OperatorError> {
        let snapshot: JoinSnapshot = crate::state::decode(SnapshotKind::Join, bytes)?;
        let handler = Self::with_registry(
            id,
            config,
            WatermarkRegistry::restore(&snapshot.watermarks),
            engine,
        )?;

        let mut slices = Vec::with_capacity(snapshot.slices.len());
        for slice in snapshot.slices {
            let state = JoinSliceState::new(handler.shards);
            for (side, bytes) in [(JoinSide::Left, &slice.left), (JoinSide::Right, &slice.right)] {
                for page in crate::state::ipc_to_batches(bytes)? {
                    let keys = handler.encoder(side).encode(&page)?;
                    let rows: Vec<usize> = (0..page.num_rows()).collect();
                    state.insert(side, page, &keys, &rows);
                }
            }
            slices.push(Slice::new(slice.range, state));
        }
        handler
            .store
            .restore(slices, snapshot.windows, snapshot.trigger_watermark);
        handler
            .sequence
            .store(snapshot.next_sequence, Ordering::Release);
        tracing::info!(handler = %id, slices = handler.store.slice_count(), "restored join handler");
        Ok(handler)
    }
}

impl OperatorHandler for JoinOperatorHandler {
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
            strategy = ?self.config.strategy,
            shards = self.shards,
            "started window join"
        );
        Ok(())
    }

    fn stop(&self, termination: QueryTerminationType) -> Result<Vec<WindowOutput>, OperatorError> {
        let Some(_stop) = self.lifecycle.begin_stop() else {
            return Ok(Vec::new());
        };
        let outputs = if termination.flushes() {
            let matched = {
                let _barrier = self.ingest.write();
                self.store.trigger_all_windows(|_, slices| self.probe(slices))
            };
            self.emit_all(matched)
        } else {
            Ok(Vec::new())
        };
        self.store.clear();
        tracing::info!(handler = %self.id, ?termination, "stopped window join");
        outputs
    }
}

impl fmt::Debug for JoinOperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinOperatorHandler")
            .field("id", &self.id)
            .field("strategy", &self.config.strategy)
            .field("store", &self.store)
            .field("watermarks", &self.watermarks)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Physical operators
// ---------------------------------------------------------------------------

/// Build operator of one join input.
///
/// Cheap to clone; one instance per worker thread and side.
#[derive(Debug, Clone)]
pub struct JoinBuild {
    handler: Arc<JoinOperatorHandler>,
    side: JoinSide,
}

impl JoinBuild {
    /// Build operator for the left input.
    #[must_use]
    pub fn left(handler: Arc<JoinOperatorHandler>) -> Self {
        Self {
            handler,
            side: JoinSide::Left,
        }
    }

    /// Build operator for the right input.
    #[must_use]
    pub fn right(handler: Arc<JoinOperatorHandler>) -> Self {
        Self {
            handler,
            side: JoinSide::Right,
        }
    }

    /// The input this operator feeds.
    #[must_use]
    pub fn side(&self) -> JoinSide {
        self.side
    }

    /// Processes one batch. Returns the number of rows accepted; late
    /// rows are dropped and counted.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] after stop,
    /// [`OperatorError::SchemaMismatch`] if the batch does not match the
    /// side's schema, and time or Arrow errors for malformed input.
    pub fn execute(&self, batch: &RecordBatch) -> Result<usize, OperatorError> {
        let _guard = self.handler.lifecycle.enter()?;
        self.handler.ingest(self.side, batch)
    }
}

/// Probe operator: turns watermark reports into joined windows.
#[derive(Debug, Clone)]
pub struct JoinProbe {
    handler: Arc<JoinOperatorHandler>,
}

impl JoinProbe {
    /// Creates a probe operator for `handler`.
    #[must_use]
    pub fn new(handler: Arc<JoinOperatorHandler>) -> Self {
        Self { handler }
    }

    /// Applies a watermark report and emits the joined rows of every window
    /// it closes. Windows without matches produce no output.
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
