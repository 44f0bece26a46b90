//! Output schema and key type rules of the windowed join.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::operator::WindowMetaData;

/// Builds the join output schema `[start, end, left..., right...]`.
///
/// A field whose name is already taken gets a `_jN` suffix, with `N`
/// counting collisions across the whole schema, so `id` on both sides
/// becomes `id` and `id_j1`.
#[must_use]
pub fn joined_schema(left: &Schema, right: &Schema, meta: &WindowMetaData) -> SchemaRef {
    let mut fields: Vec<Field> = meta.fields().into();
    let mut collisions = 0_usize;
    for field in left.fields().iter().chain(right.fields().iter()) {
        let mut name = field.name().clone();
        while fields.iter().any(|f| f.name() == &name) {
            collisions += 1;
            name = format!("{}_j{collisions}", field.name());
        }
        fields.push(field.as_ref().clone().with_name(name));
    }
    Arc::new(Schema::new(fields))
}

fn signed_width(data_type: &DataType) -> Option<u8> {
    match data_type {
        DataType::Int8 => Some(8),
        DataType::Int16 => Some(16),
        DataType::Int32 => Some(32),
        DataType::Int64 => Some(64),
        _ => None,
    }
}

fn unsigned_width(data_type: &DataType) -> Option<u8> {
    match data_type {
        DataType::UInt8 => Some(8),
        DataType::UInt16 => Some(16),
        DataType::UInt32 => Some(32),
        DataType::UInt64 => Some(64),
        _ => None,
    }
}

fn signed(width: u8) -> DataType {
    match width {
        8 => DataType::Int8,
        16 => DataType::Int16,
        32 => DataType::Int32,
        _ => DataType::Int64,
    }
}

fn unsigned(width: u8) -> DataType {
    match width {
        8 => DataType::UInt8,
        16 => DataType::UInt16,
        32 => DataType::UInt32,
        _ => DataType::UInt64,
    }
}

fn is_float(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Float16 | DataType::Float32 | DataType::Float64)
}

fn is_string(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View)
}

fn is_binary(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Binary | DataType::LargeBinary | DataType::BinaryView)
}

/// Common type two join key columns are cast to before encoding.
///
/// Integers widen to the wider type; mixed signedness goes to a signed
/// type twice as wide as the unsigned one (`UInt64` with a signed type
/// becomes `Int64`). Any float with any number becomes `Float64`. String
/// and binary flavors unify to their large variant when they differ.
/// Returns `None` if the types cannot be compared.
#[must_use]
pub fn common_key_type(left: &DataType, right: &DataType) -> Option<DataType> {
    if left == right {
        return Some(left.clone());
    }
    let numeric = |t: &DataType| signed_width(t).is_some() || unsigned_width(t).is_some() || is_float(t);

    match (left, right) {
        (l, r) if is_float(l) || is_float(r) => (numeric(l) && numeric(r)).then_some(DataType::Float64),
        (l, r) if is_string(l) && is_string(r) => Some(DataType::LargeUtf8),
        (l, r) if is_binary(l) && is_binary(r) => Some(DataType::LargeBinary),
        (l, r) => match (
            signed_width(l),
            unsigned_width(l),
            signed_width(r),
            unsigned_width(r),
        ) {
            (Some(a), _, Some(b), _) => Some(signed(a.max(b))),
            (_, Some(a), _, Some(b)) => Some(unsigned(a.max(b))),
            (Some(s), _, _, Some(u)) | (_, Some(u), Some(s), _) => {
                Some(signed(s.max(u.saturating_mul(2)).min(64)))
            }
            _ => None,
        },
    }
}
