//! Timestamp extraction from record batches.
//!
//! A [`TimeFunction`] is chosen when a plan is lowered and is called once per
//! batch by every build operator. Event time reads one column and converts
//! it to milliseconds; ingestion time stamps all rows of a batch with the
//! wall-clock time at which the batch is processed.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::datatypes::{DataType, Schema, TimeUnit};
use arrow_array::{
    Array, Int16Array, Int32Array, Int64Array, RecordBatch, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt16Array,
    UInt32Array, UInt64Array,
};

use super::{TimeError, Timestamp};

/// Unit of an integer event-time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnitKind {
    /// Milliseconds (no conversion)
    #[default]
    Milliseconds,
    /// Seconds, scaled up to milliseconds
    Seconds,
    /// Microseconds, scaled down to milliseconds
    Microseconds,
    /// Nanoseconds, scaled down to milliseconds
    Nanoseconds,
}

impl TimeUnitKind {
    #[inline]
    fn to_millis(self, value: u64) -> Timestamp {
        match self {
            TimeUnitKind::Milliseconds => value,
            TimeUnitKind::Seconds => value.saturating_mul(1000),
            TimeUnitKind::Microseconds => value / 1000,
            TimeUnitKind::Nanoseconds => value / 1_000_000,
        }
    }
}

impl From<TimeUnit> for TimeUnitKind {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => TimeUnitKind::Seconds,
            TimeUnit::Millisecond => TimeUnitKind::Milliseconds,
            TimeUnit::Microsecond => TimeUnitKind::Microseconds,
            TimeUnit::Nanosecond => TimeUnitKind::Nanoseconds,
        }
    }
}

/// Extracts a [`Timestamp`] for every row of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFunction {
    /// Read event time from a column.
    ///
    /// Integer columns are interpreted in `unit`; Arrow `Timestamp` columns
    /// carry their own unit and ignore it.
    EventTime {
        /// Column holding the event time
        column: String,
        /// Unit of integer columns
        unit: TimeUnitKind,
    },
    /// Stamp every row with the time the batch is processed.
    IngestionTime,
}

impl TimeFunction {
    /// Event time in milliseconds from `column`.
    #[must_use]
    pub fn event_time(column: impl Into<String>) -> Self {
        TimeFunction::EventTime {
            column: column.into(),
            unit: TimeUnitKind::Milliseconds,
        }
    }

    /// Event time from `column` expressed in `unit`.
    #[must_use]
    pub fn event_time_with_unit(column: impl Into<String>, unit: TimeUnitKind) -> Self {
        TimeFunction::EventTime {
            column: column.into(),
            unit,
        }
    }

    /// Returns the event-time column, if any.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            TimeFunction::EventTime { column, .. } => Some(column),
            TimeFunction::IngestionTime => None,
        }
    }

    /// Checks that `schema` can feed this time function.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::ColumnNotFound`] or [`TimeError::UnsupportedType`].
    pub fn validate_schema(&self, schema: &Schema) -> Result<(), TimeError> {
        let TimeFunction::EventTime { column, .. } = self else {
            return Ok(());
        };
        let field = schema
            .field_with_name(column)
            .map_err(|_| TimeError::ColumnNotFound(column.clone()))?;
        if is_time_type(field.data_type()) {
            Ok(())
        } else {
            Err(TimeError::UnsupportedType {
                column: column.clone(),
                data_type: field.data_type().to_string(),
            })
        }
    }

    /// Extracts one timestamp per row.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError`] if the column is missing, has an unsupported
    /// type, or contains a null or negative value.
    pub fn extract(&self, batch: &RecordBatch) -> Result<Vec<Timestamp>, TimeError> {
        match self {
            TimeFunction::IngestionTime => Ok(vec![now_millis(); batch.num_rows()]),
            TimeFunction::EventTime { column, unit } => {
                let array = batch
                    .column_by_name(column)
                    .ok_or_else(|| TimeError::ColumnNotFound(column.clone()))?;
                extract_column(column, array.as_ref(), *unit)
            }
        }
    }
}

impl fmt::Display for TimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeFunction::EventTime { column, .. } => write!(f, "EventTime({column})"),
            TimeFunction::IngestionTime => write!(f, "IngestionTime()"),
        }
    }
}

fn is_time_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Timestamp(_, _)
    )
}

#[allow(clippy::cast_possible_truncation)] // wall-clock millis fit u64
fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

macro_rules! signed_millis {
    ($column:expr, $array:expr, $ty:ty, $unit:expr) => {{
        let typed = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| unsupported($column, $array))?;
        let mut out = Vec::with_capacity(typed.len());
        for row in 0..typed.len() {
            if typed.is_null(row) {
                return Err(TimeError::NullTimestamp {
                    column: $column.to_string(),
                    row,
                });
            }
            let value = i64::from(typed.value(row));
            let value = u64::try_from(value).map_err(|_| TimeError::NegativeTimestamp {
                column: $column.to_string(),
                row,
                value,
            })?;
            out.push($unit.to_millis(value));
        }
        Ok(out)
    }};
}

macro_rules! unsigned_millis {
    ($column:expr, $array:expr, $ty:ty, $unit:expr) => {{
        let typed = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| unsupported($column, $array))?;
        let mut out = Vec::with_capacity(typed.len());
        for row in 0..typed.len() {
            if typed.is_null(row) {
                return Err(TimeError::NullTimestamp {
                    column: $column.to_string(),
                    row,
                });
            }
            out.push($unit.to_millis(u64::from(typed.value(row))));
        }
        Ok(out)
    }};
}

fn unsupported(column: &str, array: &dyn Array) -> TimeError {
    TimeError::UnsupportedType {
        column: column.to_string(),
        data_type: array.data_type().to_string(),
    }
}

fn extract_column(
    column: &str,
    array: &dyn Array,
    unit: TimeUnitKind,
) -> Result<Vec<Timestamp>, TimeError> {
    match array.data_type() {
        DataType::Int16 => signed_millis!(column, array, Int16Array, unit),
        DataType::Int32 => signed_millis!(column, array, Int32Array, unit),
        DataType::Int64 => signed_millis!(column, array, Int64Array, unit),
        DataType::UInt16 => unsigned_millis!(column, array, UInt16Array, unit),
        DataType::UInt32 => unsigned_millis!(column, array, UInt32Array, unit),
        DataType::UInt64 => unsigned_millis!(column, array, UInt64Array, unit),
        DataType::Timestamp(TimeUnit::Second, _) => {
            signed_millis!(column, array, TimestampSecondArray, TimeUnitKind::Seconds)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => signed_millis!(
            column,
            array,
            TimestampMillisecondArray,
            TimeUnitKind::Milliseconds
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => signed_millis!(
            column,
            array,
            TimestampMicrosecondArray,
            TimeUnitKind::Microseconds
        ),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => signed_millis!(
            column,
            array,
            TimestampNanosecondArray,
            TimeUnitKind::Nanoseconds
        ),
        _ => Err(unsupported(column, array)),
    }
}
