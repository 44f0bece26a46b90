//! # Sliceflow Plan
//!
//! Logical plans of windowed operators and their lowering onto the
//! `sliceflow-core` handlers.
//!
//! This crate provides:
//! - An arena-based logical plan of sources, window aggregations and joins
//! - Validation of every operator against its inputs' fields
//! - Translation into engine configurations
//! - Physical lowering, including the distributed aggregation strategy
//!
//! ```rust,ignore
//! let mut plan = LogicalPlan::new();
//! let events = plan.add_source("events", schema, TimeFunction::event_time("ts"), 4)?;
//! let totals = plan.add_window_aggregation(
//!     events,
//!     WindowDefinition::tumbling(60_000),
//!     vec!["id".into()],
//!     vec![AggregateCall::sum("value").alias("total")],
//!     TimeFunction::event_time("ts"),
//! )?;
//! let physical = lower(&plan, totals, &LoweringOptions::default())?;
//! println!("{physical}");
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod logical;
pub mod physical;
pub mod translator;

pub use error::PlanError;
pub use logical::{AggregateCall, Expr, Field, LogicalOperator, LogicalPlan, OperatorId};
pub use physical::{
    lower, CombinerSpec, HandlerSpec, InstalledPlan, LoweringOptions, PhysicalOperator,
    PhysicalPlan, StreamInput,
};
pub use translator::{WindowDefinition, WindowType};

/// Result type for planning operations
pub type Result<T> = std::result::Result<T, PlanError>;
