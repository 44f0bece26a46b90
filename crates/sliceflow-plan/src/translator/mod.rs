//! Logical operator to engine configuration translation.
//!
//! Each translator validates one logical operator against its inputs'
//! fields and produces the `sliceflow-core` configuration that the
//! physical lowering instantiates.

pub mod aggregation;
pub mod join;
pub mod window;

pub use aggregation::{aggregation_fields, translate_aggregation};
pub use join::{join_keys, translate_join, JoinKey};
pub use window::{WindowDefinition, WindowType};
