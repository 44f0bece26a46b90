//! Window aggregation functions.
//!
//! Every function is described by three types:
//!
//! | Kind   | Input        | Partial            | Final     |
//! |--------|--------------|--------------------|-----------|
//! | Sum    | numeric      | numeric            | numeric   |
//! | Min    | numeric      | numeric            | numeric   |
//! | Max    | numeric      | numeric            | numeric   |
//! | Count  | any / none   | `UInt64`           | `UInt64`  |
//! | Avg    | numeric      | `{sum, count}`     | `Float64` |
//! | Median | numeric      | undefined (values) | `Float64` |
//!
//! Numeric inputs widen to one of three accumulator types: signed integers
//! to `Int64`, unsigned integers to `UInt64` and floats to `Float64`. The
//! kind and the accumulator type are resolved once, when the operator is
//! built, into a closed [`AggregationFunction`]; the per-record path only
//! matches on already-resolved enums.
//!
//! Integer sums wrap on overflow.

// rkyv generates an undocumented resolver enum for `PartialAggregate::Avg`.
#![allow(missing_docs)]

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, UInt64Type};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Fields, Schema};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::operator::OperatorError;

/// Closed set of supported aggregation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationKind {
    /// Sum of values
    Sum,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// Number of rows (or non-null values of a column)
    Count,
    /// Arithmetic mean
    Avg,
    /// Median, buffered
    Median,
}

impl AggregationKind {
    /// Lowercase function name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Avg => "avg",
            Self::Median => "median",
        }
    }

    /// Returns true if the input column must be numeric.
    #[must_use]
    pub fn requires_numeric(self) -> bool {
        !matches!(self, Self::Count)
    }

    /// Returns true if partials of this kind can be merged incrementally.
    #[must_use]
    pub fn is_streaming_mergeable(self) -> bool {
        !matches!(self, Self::Median)
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accumulator type a numeric input widens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericType {
    /// Signed integers
    Int64,
    /// Unsigned integers
    UInt64,
    /// Floating point
    Float64,
}

impl NumericType {
    /// Widened accumulator type for an input type, `None` if not numeric.
    #[must_use]
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                Some(Self::Int64)
            }
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                Some(Self::UInt64)
            }
            DataType::Float16 | DataType::Float32 | DataType::Float64 => Some(Self::Float64),
            _ => None,
        }
    }

    /// Arrow type of the accumulator.
    #[must_use]
    pub fn data_type(self) -> DataType {
        match self {
            Self::Int64 => DataType::Int64,
            Self::UInt64 => DataType::UInt64,
            Self::Float64 => DataType::Float64,
        }
    }

    fn zero(self) -> NumericValue {
        match self {
            Self::Int64 => NumericValue::Int(0),
            Self::UInt64 => NumericValue::UInt(0),
            Self::Float64 => NumericValue::Float(0.0),
        }
    }
}

/// One widened input value.
#[derive(Debug, Clone, Copy, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum NumericValue {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
}

impl NumericValue {
    /// Value as `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Self::Int(a.wrapping_add(b)),
            (Self::UInt(a), Self::UInt(b)) => Self::UInt(a.wrapping_add(b)),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn compare(self, other: Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(&b),
            (Self::UInt(a), Self::UInt(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    fn as_uint(self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(v),
            _ => None,
        }
    }
}

/// Slice-local accumulator of one aggregation function for one key.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum PartialAggregate {
    /// Running sum
    Sum(NumericValue),
    /// Smallest value so far
    Min(Option<NumericValue>),
    /// Largest value so far
    Max(Option<NumericValue>),
    /// Number of counted values
    Count(u64),
    /// Running sum and count
    Avg {
        /// Sum of values
        sum: f64,
        /// Number of values
        count: u64,
    },
    /// Every value seen, unordered
    Median(Vec<f64>),
}

/// Unresolved aggregation as written in a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Aggregation kind
    pub kind: AggregationKind,
    /// Input column (`None` only for `count()`)
    pub input: Option<String>,
    /// Output field name
    pub output: String,
}

impl AggregationSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(kind: AggregationKind, input: Option<&str>, output: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.map(str::to_string),
            output: output.into(),
        }
    }

    /// `sum(input) as output`
    #[must_use]
    pub fn sum(input: &str, output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Sum, Some(input), output)
    }

    /// `min(input) as output`
    #[must_use]
    pub fn min(input: &str, output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Min, Some(input), output)
    }

    /// `max(input) as output`
    #[must_use]
    pub fn max(input: &str, output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Max, Some(input), output)
    }

    /// `count() as output`
    #[must_use]
    pub fn count(output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Count, None, output)
    }

    /// `avg(input) as output`
    #[must_use]
    pub fn avg(input: &str, output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Avg, Some(input), output)
    }

    /// `median(input) as output`
    #[must_use]
    pub fn median(input: &str, output: impl Into<String>) -> Self {
        Self::new(AggregationKind::Median, Some(input), output)
    }
}

/// An aggregation resolved against an input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationFunction {
    kind: AggregationKind,
    input: Option<(usize, DataType)>,
    numeric: Option<NumericType>,
    output: String,
}

impl AggregationFunction {
    /// Resolves `spec` against `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::ColumnNotFound`] for a missing input column,
    /// [`OperatorError::UnsupportedType`] for a non-numeric input of a
    /// numeric aggregation and [`OperatorError::InvalidConfig`] for a
    /// numeric aggregation without input.
    pub fn try_new(spec: &AggregationSpec, schema: &Schema) -> Result<Self, OperatorError> {
        let input = match &spec.input {
            Some(column) => {
                let index = schema
                    .index_of(column)
                    .map_err(|_| OperatorError::ColumnNotFound(column.clone()))?;
                Some((index, schema.field(index).data_type().clone()))
            }
            None if spec.kind == AggregationKind::Count => None,
            None => {
                return Err(OperatorError::InvalidConfig(format!(
                    "{}() as {} requires an input column",
                    spec.kind, spec.output
                )))
            }
        };

        let numeric = match (&input, spec.kind.requires_numeric()) {
            (Some((_, data_type)), true) => Some(NumericType::from_data_type(data_type).ok_or_else(
                || OperatorError::UnsupportedType {
                    column: spec.input.clone().unwrap_or_default(),
                    data_type: format!("{data_type} (not numeric, required by {})", spec.kind),
                },
            )?),
            _ => None,
        };

        Ok(Self {
            kind: spec.kind,
            input,
            numeric,
            output: spec.output.clone(),
        })
    }

    /// Aggregation kind.
    #[must_use]
    pub fn kind(&self) -> AggregationKind {
        self.kind
    }

    /// Output field name.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output
    }

    /// Type of the values fed into the function, `None` for `count()`.
    #[must_use]
    pub fn input_stamp(&self) -> Option<DataType> {
        match self.numeric {
            Some(numeric) => Some(numeric.data_type()),
            None => self.input.as_ref().map(|(_, data_type)| data_type.clone()),
        }
    }

    /// Type of the partial accumulator, `None` when undefined (Median).
    #[must_use]
    pub fn partial_stamp(&self) -> Option<DataType> {
        match self.kind {
            AggregationKind::Sum | AggregationKind::Min | AggregationKind::Max => {
                self.numeric.map(NumericType::data_type)
            }
            AggregationKind::Count => Some(DataType::UInt64),
            AggregationKind::Avg => Some(DataType::Struct(Fields::from(vec![
                Field::new("sum", DataType::Float64, false),
                Field::new("count", DataType::UInt64, false),
            ]))),
            AggregationKind::Median => None,
        }
    }

    /// Type of the emitted result.
    #[must_use]
    pub fn final_stamp(&self) -> DataType {
        match self.kind {
            AggregationKind::Sum | AggregationKind::Min | AggregationKind::Max => self
                .numeric
                .map_or(DataType::Float64, NumericType::data_type),
            AggregationKind::Count => DataType::UInt64,
            AggregationKind::Avg | AggregationKind::Median => DataType::Float64,
        }
    }

    /// Output field. Sum and Count are never null.
    #[must_use]
    pub fn output_field(&self) -> Field {
        let nullable = !matches!(self.kind, AggregationKind::Sum | AggregationKind::Count);
        Field::new(&self.output, self.final_stamp(), nullable)
    }

    /// Accumulator before any value was merged.
    #[must_use]
    pub fn empty_partial(&self) -> PartialAggregate {
        match self.kind {
            AggregationKind::Sum => {
                PartialAggregate::Sum(self.numeric.unwrap_or(NumericType::Float64).zero())
            }
            AggregationKind::Min => PartialAggregate::Min(None),
            AggregationKind::Max => PartialAggregate::Max(None),
            AggregationKind::Count => PartialAggregate::Count(0),
            AggregationKind::Avg => PartialAggregate::Avg { sum: 0.0, count: 0 },
            AggregationKind::Median => PartialAggregate::Median(Vec::new()),
        }
    }

    /// Folds one input value into `partial`.
    ///
    /// Count ignores the value itself.
    pub fn merge_one(&self, partial: &mut PartialAggregate, value: NumericValue) {
        match partial {
            PartialAggregate::Sum(sum) => *sum = sum.add(value),
            PartialAggregate::Min(min) => {
                if min.map_or(true, |current| value.compare(current) == Ordering::Less) {
                    *min = Some(value);
                }
            }
            PartialAggregate::Max(max) => {
                if max.map_or(true, |current| value.compare(current) == Ordering::Greater) {
                    *max = Some(value);
                }
            }
            PartialAggregate::Count(count) => *count += 1,
            PartialAggregate::Avg { sum, count } => {
                *sum += value.as_f64();
                *count += 1;
            }
            PartialAggregate::Median(values) => values.push(value.as_f64()),
        }
    }

    /// Whether `partial` is an accumulator of this function's kind.
    #[must_use]
    pub fn accepts(&self, partial: &PartialAggregate) -> bool {
        std::mem::discriminant(partial) == std::mem::discriminant(&self.empty_partial())
    }

    /// Combines `other` into `into`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::RejectedPartial`] if the two accumulators
    /// are of different kinds; `into` is left unchanged.
    pub fn merge_partials(
        &self,
        into: &mut PartialAggregate,
        other: &PartialAggregate,
    ) -> Result<(), OperatorError> {
        match (into, other) {
            (PartialAggregate::Sum(a), PartialAggregate::Sum(b)) => *a = a.add(*b),
            (PartialAggregate::Min(a), PartialAggregate::Min(Some(b))) => {
                if a.map_or(true, |current| b.compare(current) == Ordering::Less) {
                    *a = Some(*b);
                }
            }
            (PartialAggregate::Max(a), PartialAggregate::Max(Some(b))) => {
                if a.map_or(true, |current| b.compare(current) == Ordering::Greater) {
                    *a = Some(*b);
                }
            }
            (PartialAggregate::Count(a), PartialAggregate::Count(b)) => *a += b,
            (
                PartialAggregate::Avg { sum, count },
                PartialAggregate::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (PartialAggregate::Median(a), PartialAggregate::Median(b)) => a.extend_from_slice(b),
            (PartialAggregate::Min(_), PartialAggregate::Min(None))
            | (PartialAggregate::Max(_), PartialAggregate::Max(None)) => {}
            (into, other) => {
                return Err(OperatorError::RejectedPartial(format!(
                    "{}: cannot merge {other:?} into {into:?}",
                    self.output
                )));
            }
        }
        Ok(())
    }

    /// Final value of an accumulator, `None` if the result is null.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn finalize(&self, partial: &PartialAggregate) -> Option<NumericValue> {
        match partial {
            PartialAggregate::Sum(sum) => Some(*sum),
            PartialAggregate::Min(value) | PartialAggregate::Max(value) => *value,
            PartialAggregate::Count(count) => Some(NumericValue::UInt(*count)),
            PartialAggregate::Avg { sum, count } => {
                (*count > 0).then(|| NumericValue::Float(sum / *count as f64))
            }
            PartialAggregate::Median(values) => median(values).map(NumericValue::Float),
        }
    }

    /// Finalizes one accumulator per output row into a column of
    /// [`Self::final_stamp`] type.
    pub fn finalize_array<'a>(
        &self,
        partials: impl Iterator<Item = &'a PartialAggregate>,
    ) -> ArrayRef {
        let values = partials.map(|p| self.finalize(p));
        match self.final_stamp() {
            DataType::Int64 => Arc::new(values.map(|v| v.and_then(NumericValue::as_int)).collect::<Int64Array>()),
            DataType::UInt64 => Arc::new(values.map(|v| v.and_then(NumericValue::as_uint)).collect::<UInt64Array>()),
            _ => Arc::new(values.map(|v| v.map(NumericValue::as_f64)).collect::<Float64Array>()),
        }
    }

    /// Prepares this function's input column of `batch` for per-row access.
    pub(crate) fn bind(&self, batch: &RecordBatch) -> Result<BoundInput, OperatorError> {
        let Some((index, _)) = &self.input else {
            return Ok(BoundInput::Rows);
        };
        let column = batch.column(*index);
        let Some(numeric) = self.numeric else {
            return Ok(BoundInput::NonNull(Arc::clone(column)));
        };
        let target = numeric.data_type();
        let column = if column.data_type() == &target {
            Arc::clone(column)
        } else {
            arrow_cast::cast(column, &target)?
        };
        Ok(match numeric {
            NumericType::Int64 => BoundInput::Int(column.as_primitive::<Int64Type>().clone()),
            NumericType::UInt64 => BoundInput::UInt(column.as_primitive::<UInt64Type>().clone()),
            NumericType::Float64 => BoundInput::Float(column.as_primitive::<Float64Type>().clone()),
        })
    }
}

/// One function's input column, resolved for a single batch.
pub(crate) enum BoundInput {
    /// `count()`: every row counts
    Rows,
    /// `count(column)`: non-null values count
    NonNull(ArrayRef),
    Int(Int64Array),
    UInt(UInt64Array),
    Float(Float64Array),
}

impl BoundInput {
    /// Value of `row`, `None` for nulls.
    #[inline]
    pub(crate) fn value(&self, row: usize) -> Option<NumericValue> {
        match self {
            Self::Rows => Some(NumericValue::UInt(1)),
            Self::NonNull(array) => array.is_valid(row).then_some(NumericValue::UInt(1)),
            Self::Int(array) => array.is_valid(row).then(|| NumericValue::Int(array.value(row))),
            Self::UInt(array) => array.is_valid(row).then(|| NumericValue::UInt(array.value(row))),
            Self::Float(array) => array.is_valid(row).then(|| NumericValue::Float(array.value(row))),
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
