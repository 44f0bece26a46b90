//! # `Sliceflow` Core
//!
//! The windowed execution engine for `Sliceflow`: slice-based window
//! aggregation and windowed stream-to-stream hash joins driven by
//! multi-origin watermarks.
//!
//! This crate provides:
//! - **Slices**: [`operator::slice_assigner::SliceAssigner`] cuts the time axis into
//!   the finest intervals shared by every overlapping window, and
//!   [`operator::slice_store::TimeBasedSliceStore`] owns their lifecycle
//! - **Aggregation**: Sum, Min, Max, Count, Avg and Median with slice-local
//!   partial state that merges across slices and across nodes
//! - **Join**: symmetric build operators and a window-triggered probe
//! - **Time**: event/ingestion time extraction and the per-origin
//!   [`time::WatermarkRegistry`]
//!
//! ## Data Flow
//!
//! ```text
//! RecordBatch ─► Build (TimeFunction + SliceAssigner) ─► Slice state
//!                                                           │
//! Watermark ─► WatermarkRegistry ─► trigger ready windows ◄─┘
//!                                          │
//!                                          ▼
//!                              merge slices ─► WindowOutput
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sliceflow_core::operator::aggregation::{
//!     AggregationBuild, AggregationOperatorHandler, AggregationTrigger, WindowAggregationConfig,
//! };
//!
//! let handler = Arc::new(AggregationOperatorHandler::new(
//!     id,
//!     config,
//!     input_schema,
//!     &origins,
//!     ctx.config(),
//! )?);
//! ctx.install(Arc::clone(&handler))?;
//!
//! let build = AggregationBuild::new(Arc::clone(&handler));
//! build.execute(&batch)?;
//!
//! let trigger = AggregationTrigger::new(handler);
//! for window in trigger.on_watermark(update)? {
//!     sink.write(window.batches);
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod operator;
pub mod state;
pub mod time;

pub use config::EngineConfig;
pub use time::{Timestamp, Watermark};

/// Result type for sliceflow-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sliceflow-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Time-related errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// State snapshot errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}
