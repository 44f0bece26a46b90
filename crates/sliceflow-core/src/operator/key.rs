//! Grouping and join key encoding.
//!
//! Key columns are cast to their configured key types and encoded row by
//! row into byte spans with Arrow's row format. Equal keys produce equal
//! bytes regardless of which input (or join side) they came from, so the
//! bytes can be hashed and compared directly and decoded back into columns
//! when results are emitted.

use std::sync::Arc;

use arrow::buffer::NullBuffer;
use arrow::row::{Row, RowConverter, Rows, SortField};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};

use super::OperatorError;

/// Encoded keys of one batch.
pub struct EncodedKeys {
    rows: Option<Rows>,
    validity: Option<NullBuffer>,
    num_rows: usize,
}

impl EncodedKeys {
    /// Number of encoded rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_rows
    }

    /// Returns true if the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Key of `row`. Empty for operators without key columns.
    #[must_use]
    pub fn key(&self, row: usize) -> Key<'_> {
        match &self.rows {
            Some(rows) => Key::Row(rows.row(row)),
            None => Key::Global,
        }
    }

    /// Validity of the whole key per row, after casting: a row is null if
    /// any of its key columns is null or did not fit the key type. `None`
    /// if every key is valid.
    #[must_use]
    pub fn validity(&self) -> Option<&NullBuffer> {
        self.validity.as_ref()
    }

    /// Returns true if the key of `row` has no null component.
    #[must_use]
    pub fn is_valid(&self, row: usize) -> bool {
        self.validity.as_ref().map_or(true, |v| v.is_valid(row))
    }
}

/// Borrowed key of one row.
pub enum Key<'a> {
    /// Encoded key columns
    Row(Row<'a>),
    /// Operators without key columns share the empty key
    Global,
}

impl AsRef<[u8]> for Key<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Key::Row(row) => row.as_ref(),
            Key::Global => &[],
        }
    }
}

/// Hash used to pick a state shard for a key.
#[inline]
#[must_use]
pub fn key_hash(key: &[u8]) -> u64 {
    fxhash::hash64(key)
}

/// Encodes key columns of a fixed input schema.
pub struct KeyEncoder {
    names: Vec<String>,
    indices: Vec<usize>,
    key_types: Vec<DataType>,
    nullable: Vec<bool>,
    converter: Option<RowConverter>,
}

impl KeyEncoder {
    /// Creates an encoder for `columns` of `schema`, keeping their own types.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::ColumnNotFound`] for unknown columns.
    pub fn new(schema: &Schema, columns: &[String]) -> Result<Self, OperatorError> {
        let key_types = columns
            .iter()
            .map(|name| {
                schema
                    .field_with_name(name)
                    .map(|f| f.data_type().clone())
                    .map_err(|_| OperatorError::ColumnNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_key_types(schema, columns, &key_types)
    }

    /// Creates an encoder that casts `columns` to `key_types` first.
    ///
    /// Both sides of a join use the same `key_types` so that, for example,
    /// an `Int8` key on one side and an `Int32` key on the other produce
    /// identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::ColumnNotFound`] for unknown columns,
    /// [`OperatorError::UnsupportedType`] if a column cannot be cast, and
    /// [`OperatorError::InvalidConfig`] if the lengths disagree.
    pub fn with_key_types(
        schema: &Schema,
        columns: &[String],
        key_types: &[DataType],
    ) -> Result<Self, OperatorError> {
        if columns.len() != key_types.len() {
            return Err(OperatorError::InvalidConfig(format!(
                "{} key columns but {} key types",
                columns.len(),
                key_types.len()
            )));
        }

        let mut indices = Vec::with_capacity(columns.len());
        let mut nullable = Vec::with_capacity(columns.len());
        for (name, key_type) in columns.iter().zip(key_types) {
            let index = schema
                .index_of(name)
                .map_err(|_| OperatorError::ColumnNotFound(name.clone()))?;
            let field = schema.field(index);
            if !arrow_cast::can_cast_types(field.data_type(), key_type) {
                return Err(OperatorError::UnsupportedType {
                    column: name.clone(),
                    data_type: format!("{} (key type {key_type})", field.data_type()),
                });
            }
            indices.push(index);
            nullable.push(field.is_nullable());
        }

        let converter = if columns.is_empty() {
            None
        } else {
            let sort_fields = key_types.iter().cloned().map(SortField::new).collect();
            Some(RowConverter::new(sort_fields)?)
        };

        Ok(Self {
            names: columns.to_vec(),
            indices,
            key_types: key_types.to_vec(),
            nullable,
            converter,
        })
    }

    /// Returns true if the encoder has no key columns.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.converter.is_none()
    }

    /// Key types after casting.
    #[must_use]
    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    /// Output fields for decoded keys.
    #[must_use]
    pub fn fields(&self) -> Vec<Field> {
        self.names
            .iter()
            .zip(&self.key_types)
            .zip(&self.nullable)
            .map(|((name, ty), nullable)| Field::new(name, ty.clone(), *nullable))
            .collect()
    }

    /// Encodes the key of every row of `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Arrow`] if casting or encoding fails.
    pub fn encode(&self, batch: &RecordBatch) -> Result<EncodedKeys, OperatorError> {
        let Some(converter) = &self.converter else {
            return Ok(EncodedKeys {
                rows: None,
                validity: None,
                num_rows: batch.num_rows(),
            });
        };

        let columns = self
            .indices
            .iter()
            .zip(&self.key_types)
            .map(|(&index, key_type)| {
                let column = batch.column(index);
                if column.data_type() == key_type {
                    Ok(Arc::clone(column))
                } else {
                    arrow_cast::cast(column, key_type)
                }
            })
            .collect::<Result<Vec<ArrayRef>, _>>()?;

        let validity = columns.iter().fold(None, |acc, column| {
            NullBuffer::union(acc.as_ref(), column.logical_nulls().as_ref())
        });
        Ok(EncodedKeys {
            rows: Some(converter.convert_columns(&columns)?),
            validity,
            num_rows: batch.num_rows(),
        })
    }

    /// Decodes key bytes back into one array per key column.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Arrow`] if decoding fails.
    pub fn decode<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Vec<ArrayRef>, OperatorError> {
        let Some(converter) = &self.converter else {
            return Ok(Vec::new());
        };
        let parser = converter.parser();
        let rows: Vec<_> = keys.into_iter().map(|bytes| parser.parse(bytes)).collect();
        Ok(converter.convert_rows(rows)?)
    }
}

impl std::fmt::Debug for KeyEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEncoder")
            .field("columns", &self.names)
            .field("key_types", &self.key_types)
            .finish()
    }
}
