//! # Time Module
//!
//! Event time extraction and watermark tracking.
//!
//! ## Concepts
//!
//! - **Timestamp**: unsigned milliseconds, either event time read from a
//!   column or ingestion time taken when a batch enters the engine
//! - **Watermark**: assertion that no record with a timestamp below the
//!   watermark will arrive from an origin
//! - **Origin**: one upstream producer reporting watermarks independently
//!
//! ## Time Functions
//!
//! ```rust
//! use arrow_array::{RecordBatch, UInt64Array};
//! use std::sync::Arc;
//! use sliceflow_core::time::TimeFunction;
//!
//! let batch = RecordBatch::try_from_iter(vec![(
//!     "ts",
//!     Arc::new(UInt64Array::from(vec![1000_u64, 1500])) as _,
//! )])
//! .unwrap();
//!
//! let time = TimeFunction::event_time("ts");
//! assert_eq!(time.extract(&batch).unwrap(), vec![1000, 1500]);
//! ```
//!
//! ## Multi-Origin Watermarks
//!
//! ```rust
//! use sliceflow_core::time::{OriginId, SequenceData, Watermark, WatermarkRegistry};
//!
//! let registry = WatermarkRegistry::new(&[OriginId(1), OriginId(2)]);
//! registry.update(5000, SequenceData::single(1), OriginId(1)).unwrap();
//! registry.update(3000, SequenceData::single(1), OriginId(2)).unwrap();
//!
//! // Combined watermark is the minimum across origins
//! assert_eq!(registry.current(), Watermark::new(3000));
//! ```

mod time_function;
mod watermark;

pub use time_function::{TimeFunction, TimeUnitKind};
pub use watermark::{
    OriginId, SequenceData, WatermarkRegistry, WatermarkSnapshot, WatermarkUpdate,
};

/// Milliseconds since the epoch (event time or ingestion time).
pub type Timestamp = u64;

/// A watermark indicating event-time progress.
///
/// # Example
///
/// ```rust
/// use sliceflow_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(pub Timestamp);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Returns true if a record with this timestamp arrives too late.
    #[inline]
    #[must_use]
    pub fn is_late(&self, timestamp: Timestamp) -> bool {
        timestamp < self.0
    }
}

impl From<Timestamp> for Watermark {
    fn from(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }
}

/// Errors that can occur in time operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// Column not found in the batch schema
    #[error("Time column not found: {0}")]
    ColumnNotFound(String),

    /// Column type cannot carry a timestamp
    #[error("Unsupported time column type for '{column}': {data_type}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// Arrow type found
        data_type: String,
    },

    /// Null timestamp encountered
    #[error("Null timestamp in column '{column}' at row {row}")]
    NullTimestamp {
        /// Column name
        column: String,
        /// Row index
        row: usize,
    },

    /// Timestamp before the epoch
    #[error("Negative timestamp {value} in column '{column}' at row {row}")]
    NegativeTimestamp {
        /// Column name
        column: String,
        /// Row index
        row: usize,
        /// Offending value
        value: i64,
    },

    /// Watermark reported by an origin the registry does not know
    #[error("Unknown watermark origin: {0}")]
    UnknownOrigin(u64),

    /// Chunk numbering of a sequence is inconsistent
    #[error("Invalid chunk {chunk} for sequence {sequence} of origin {origin}")]
    InvalidChunk {
        /// Origin id
        origin: u64,
        /// Sequence number
        sequence: u64,
        /// Chunk number
        chunk: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark::new(1000);
        let w2 = Watermark::new(2000);
        assert!(w1 < w2);
        assert_eq!(w1.max(w2), w2);
        assert_eq!(Watermark::default().timestamp(), 0);
    }

    #[test]
    fn test_watermark_lateness() {
        let wm = Watermark::from(500);
        assert!(wm.is_late(0));
        assert!(wm.is_late(499));
        assert!(!wm.is_late(500));
        assert!(!wm.is_late(501));
    }
}
