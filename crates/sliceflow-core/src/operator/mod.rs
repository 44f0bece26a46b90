//! # Operator Module
//!
//! Windowed physical operators and the shared state they run against.
//!
//! ## Layout
//!
//! - [`slice_assigner`]: timestamp → slice boundaries, slice → windows
//! - [`slice_store`]: slice lifecycle and the per-window state machine
//! - [`key`]: grouping/join key encoding to byte spans
//! - [`handler`]: operator handlers, their registry and query termination
//! - [`aggregation`]: windowed aggregation build/trigger and the distributed combiner
//! - [`hash_join`]: windowed stream-stream hash join build/probe
//!
//! Physical operators are synchronous: each call processes one input batch
//! or one watermark and returns. Parallelism comes from many worker threads
//! calling build operators that share one [`handler::OperatorHandler`].

use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field};

use crate::time::Timestamp;

pub mod aggregation;
pub mod handler;
pub mod hash_join;
pub mod key;
pub mod slice_assigner;
pub mod slice_store;

pub use slice_assigner::{SliceAssigner, SliceRange, WindowInfo};

/// Names of the window metadata fields placed in front of every output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMetaData {
    /// Output field holding the window start
    pub start_field: String,
    /// Output field holding the window end
    pub end_field: String,
}

impl WindowMetaData {
    /// Creates metadata with explicit field names.
    #[must_use]
    pub fn new(start_field: impl Into<String>, end_field: impl Into<String>) -> Self {
        Self {
            start_field: start_field.into(),
            end_field: end_field.into(),
        }
    }

    /// Returns the two Arrow fields (`UInt64`, non-null).
    #[must_use]
    pub fn fields(&self) -> [Field; 2] {
        [
            Field::new(&self.start_field, DataType::UInt64, false),
            Field::new(&self.end_field, DataType::UInt64, false),
        ]
    }
}

impl Default for WindowMetaData {
    fn default() -> Self {
        Self::new("start", "end")
    }
}

/// Result of one triggered window.
#[derive(Debug, Clone)]
pub struct WindowOutput {
    /// Per-handler emission sequence number (strictly increasing)
    pub sequence_number: u64,
    /// The window that was triggered
    pub window: WindowInfo,
    /// Result rows, split into batches of bounded size
    pub batches: Vec<RecordBatch>,
}

impl WindowOutput {
    /// Total number of result rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Window start.
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.window.start
    }

    /// Window end.
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.window.end
    }
}

/// Errors that can occur in operators
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// Window size/slide relationship is invalid
    #[error("Invalid window: size={size}, slide={slide} (require slide > 0 and size >= slide)")]
    InvalidWindow {
        /// Window size
        size: Timestamp,
        /// Window slide
        slide: Timestamp,
    },

    /// Input column missing
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Column type cannot feed the operator
    #[error("Unsupported type for column '{column}': {data_type}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// Arrow type found
        data_type: String,
    },

    /// Operator configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Handler id registered twice
    #[error("Operator handler {0} already registered")]
    DuplicateHandler(u64),

    /// Handler id unknown or of another type
    #[error("Operator handler {0} not found")]
    HandlerNotFound(u64),

    /// Call after the handler was stopped
    #[error("Operator handler {0} is stopped")]
    HandlerStopped(u64),

    /// Input batch does not match the schema the operator was built for
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Combiner received a partial it cannot accept
    #[error("Rejected partial window result: {0}")]
    RejectedPartial(String),

    /// Time extraction or watermark error
    #[error("Time error: {0}")]
    Time(#[from] crate::time::TimeError),

    /// Arrow kernel error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Snapshot or partial-state encoding error
    #[error("State error: {0}")]
    State(#[from] crate::state::StateError),
}

/// Constant window start/end columns for `rows` output rows.
pub(crate) fn window_columns(window: WindowInfo, rows: usize) -> Vec<ArrayRef> {
    vec![
        Arc::new(UInt64Array::from(vec![window.start; rows])),
        Arc::new(UInt64Array::from(vec![window.end; rows])),
    ]
}

/// Splits `rows` into `(offset, len)` chunks of at most `max_rows`.
pub(crate) fn chunk_ranges(rows: usize, max_rows: usize) -> impl Iterator<Item = (usize, usize)> {
    let max_rows = max_rows.max(1);
    (0..rows)
        .step_by(max_rows)
        .map(move |offset| (offset, max_rows.min(rows - offset)))
}
