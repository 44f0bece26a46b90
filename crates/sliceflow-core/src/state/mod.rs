//! # State Snapshots
//!
//! Encoding of operator handler state for checkpointing and migration.
//!
//! A snapshot is a short header followed by an rkyv archive:
//!
//! ```text
//! ┌────────┬─────────┬──────┬───────────────────────┐
//! │ "SLFS" │ version │ kind │ rkyv payload          │
//! │ 4 B    │ u32 LE  │ u8   │ (aligned on decode)   │
//! └────────┴─────────┴──────┴───────────────────────┘
//! ```
//!
//! Join pages travel as Arrow IPC stream bytes inside the payload.
//!
//! ## Example
//!
//! ```rust
//! use sliceflow_core::state::{decode, encode, SnapshotKind};
//!
//! let bytes = encode(SnapshotKind::Aggregation, &vec![1_u64, 2, 3]).unwrap();
//! let values: Vec<u64> = decode(SnapshotKind::Aggregation, &bytes).unwrap();
//! assert_eq!(values, vec![1, 2, 3]);
//! assert!(decode::<Vec<u64>>(SnapshotKind::Join, &bytes).is_err());
//! ```

use std::io::Cursor;
use std::path::Path;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const MAGIC: &[u8; 4] = b"SLFS";
const HEADER_LEN: usize = 9;

/// Errors from encoding or decoding snapshots.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Header is missing, of another kind, or of an unknown version
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// Arrow IPC error while encoding or decoding pages
    #[error("Arrow IPC error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

/// Which handler a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotKind {
    /// Windowed aggregation handler
    Aggregation = 1,
    /// Windowed join handler
    Join = 2,
}

impl SnapshotKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Aggregation),
            2 => Some(Self::Join),
            _ => None,
        }
    }
}

/// Serializes `value` behind a snapshot header.
///
/// # Errors
///
/// Returns [`StateError::Serialization`] if rkyv serialization fails.
pub fn encode<T>(kind: SnapshotKind, value: &T) -> Result<Vec<u8>, StateError>
where
    T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    let payload = rkyv::to_bytes::<RkyvError>(value)
        .map_err(|e| StateError::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    bytes.push(kind as u8);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Checks the header and deserializes the payload.
///
/// # Errors
///
/// Returns [`StateError::Corruption`] for a bad header and
/// [`StateError::Deserialization`] if the payload fails validation.
pub fn decode<T>(kind: SnapshotKind, bytes: &[u8]) -> Result<T, StateError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
{
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(StateError::Corruption("missing snapshot header".into()));
    }
    let mut version = [0_u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != SNAPSHOT_VERSION {
        return Err(StateError::Corruption(format!(
            "unsupported snapshot version {version} (expected {SNAPSHOT_VERSION})"
        )));
    }
    match SnapshotKind::from_byte(bytes[8]) {
        Some(found) if found == kind => {}
        found => {
            return Err(StateError::Corruption(format!(
                "expected {kind:?} snapshot, found {found:?}"
            )))
        }
    }

    // The payload sits at an odd offset; rkyv needs it aligned.
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len() - HEADER_LEN);
    aligned.extend_from_slice(&bytes[HEADER_LEN..]);
    let archived = rkyv::access::<T::Archived, RkyvError>(&aligned)
        .map_err(|e| StateError::Deserialization(e.to_string()))?;
    rkyv::deserialize::<T, RkyvError>(archived)
        .map_err(|e| StateError::Deserialization(e.to_string()))
}

/// Writes snapshot bytes to `path`, replacing any existing file.
///
/// # Errors
///
/// Returns [`StateError::Io`] on write failure.
pub fn write_snapshot(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), StateError> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads snapshot bytes from `path`.
///
/// # Errors
///
/// Returns [`StateError::Io`] on read failure.
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Vec<u8>, StateError> {
    Ok(std::fs::read(path)?)
}

/// Encodes batches as one Arrow IPC stream.
///
/// # Errors
///
/// Returns [`StateError::Arrow`] if writing fails.
pub fn batches_to_ipc(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>, StateError> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(writer.into_inner()?)
}

/// Decodes an Arrow IPC stream written by [`batches_to_ipc`].
///
/// # Errors
///
/// Returns [`StateError::Arrow`] if reading fails.
pub fn ipc_to_batches(bytes: &[u8]) -> Result<Vec<RecordBatch>, StateError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}
