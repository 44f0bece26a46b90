//! Planning errors.

use sliceflow_core::operator::OperatorError;

use crate::logical::OperatorId;

/// Errors raised while building, translating or lowering a plan.
///
/// Every error is raised before any handler exists; a plan either lowers
/// completely or not at all.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Operator id not present in the plan
    #[error("Unknown operator {0}")]
    UnknownOperator(OperatorId),

    /// Column missing from an operator's output
    #[error("Column '{column}' not found in output of {operator}")]
    ColumnNotFound {
        /// Operator whose output was searched
        operator: OperatorId,
        /// Column name
        column: String,
    },

    /// Window size/slide rejected
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// Numeric aggregation over a non-numeric column
    #[error("{function}({column}) requires a numeric column, found {data_type}")]
    NonNumericAggregation {
        /// Aggregation function name
        function: String,
        /// Input column
        column: String,
        /// Type found
        data_type: String,
    },

    /// Two output fields share one name
    #[error("Duplicate output field '{0}'")]
    DuplicateField(String),

    /// Join predicate is not a conjunction of column equalities
    #[error("Unsupported join predicate: {0}")]
    UnsupportedJoinPredicate(String),

    /// No physical strategy exists for the join
    #[error("Unknown join strategy: {0}")]
    UnknownJoinStrategy(String),

    /// Join key columns without a common type
    #[error("Incompatible join keys {left} ({left_type}) and {right} ({right_type})")]
    IncompatibleJoinKeys {
        /// Left key column
        left: String,
        /// Left key type
        left_type: String,
        /// Right key column
        right: String,
        /// Right key type
        right_type: String,
    },

    /// Lowering options rejected
    #[error("Invalid lowering options: {0}")]
    InvalidOptions(String),

    /// Operator configuration rejected by the engine
    #[error("Operator error: {0}")]
    Operator(#[from] OperatorError),

    /// Options could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
