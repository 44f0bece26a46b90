//! # Multi-Origin Watermark Tracking
//!
//! Every upstream producer (origin) of a windowed operator reports
//! watermarks independently. Reports are attached to the sequence number of
//! the buffer that carried them, and buffers of one origin may be processed
//! out of order by different worker threads. An origin's watermark therefore
//! only advances across a gap-free prefix of sequence numbers: the watermark
//! of sequence `n` is applied once every sequence `< n` has been seen.
//!
//! A sequence may be split into chunks. It counts as complete once the chunk
//! flagged `last_chunk` and all chunks before it have arrived.
//!
//! The effective watermark is the minimum over all origins. It is
//! monotonically non-decreasing: a stalled origin holds it back forever.
//!
//! ```rust
//! use sliceflow_core::time::{OriginId, SequenceData, Watermark, WatermarkRegistry};
//!
//! let registry = WatermarkRegistry::new(&[OriginId(0)]);
//!
//! // Sequence 2 arrives first: nothing is applied yet.
//! registry.update(20, SequenceData::single(2), OriginId(0)).unwrap();
//! assert_eq!(registry.current(), Watermark::new(0));
//!
//! // Sequence 1 closes the gap; both are applied.
//! registry.update(10, SequenceData::single(1), OriginId(0)).unwrap();
//! assert_eq!(registry.current(), Watermark::new(20));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{TimeError, Timestamp, Watermark};

/// Identifier of an upstream producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OriginId(pub u64);

/// Position of a buffer within its origin's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceData {
    /// Sequence number, starting at 1
    pub sequence_number: u64,
    /// Chunk number within the sequence, starting at 1
    pub chunk_number: u64,
    /// Whether this is the final chunk of the sequence
    pub last_chunk: bool,
}

impl SequenceData {
    /// Creates sequence data for one chunk.
    #[must_use]
    pub fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// A sequence that consists of exactly one chunk.
    #[must_use]
    pub fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, 1, true)
    }
}

/// A watermark report as delivered to a trigger or probe operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkUpdate {
    /// Reported watermark
    pub watermark: Timestamp,
    /// Buffer position that carried the report
    pub sequence: SequenceData,
    /// Reporting origin
    pub origin: OriginId,
}

impl WatermarkUpdate {
    /// Creates a report.
    #[must_use]
    pub fn new(watermark: Timestamp, sequence: SequenceData, origin: OriginId) -> Self {
        Self {
            watermark,
            sequence,
            origin,
        }
    }
}

#[derive(Debug, Default)]
struct PendingSequence {
    watermark: Timestamp,
    chunks_seen: u64,
    last_chunk: Option<u64>,
}

impl PendingSequence {
    fn is_complete(&self) -> bool {
        self.last_chunk == Some(self.chunks_seen)
    }
}

#[derive(Debug)]
struct OriginState {
    next_sequence: u64,
    pending: BTreeMap<u64, PendingSequence>,
}

impl OriginState {
    fn new(next_sequence: u64) -> Self {
        Self {
            next_sequence,
            pending: BTreeMap::new(),
        }
    }
}

struct OriginSlot {
    state: Mutex<OriginState>,
    watermark: AtomicU64,
}

/// Serializable view of a [`WatermarkRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WatermarkSnapshot {
    /// `(origin, watermark, next expected sequence)` per origin
    pub origins: Vec<(u64, Timestamp, u64)>,
}

/// Tracks per-origin watermarks and their minimum.
///
/// Safe to update concurrently from many worker threads: each origin has
/// its own lock and the combined watermark only moves forward through an
/// atomic `fetch_max`.
pub struct WatermarkRegistry {
    origins: FxHashMap<OriginId, OriginSlot>,
    current: AtomicU64,
}

impl WatermarkRegistry {
    /// Creates a registry for a fixed set of origins.
    #[must_use]
    pub fn new(origins: &[OriginId]) -> Self {
        let origins = origins
            .iter()
            .map(|&id| {
                (
                    id,
                    OriginSlot {
                        state: Mutex::new(OriginState::new(1)),
                        watermark: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self {
            origins,
            current: AtomicU64::new(0),
        }
    }

    /// Reports a watermark carried by the buffer `sequence` of `origin`.
    ///
    /// Returns the effective watermark after the update.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownOrigin`] for unregistered origins and
    /// [`TimeError::InvalidChunk`] for chunk number zero.
    pub fn update(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
    ) -> Result<Watermark, TimeError> {
        let slot = self
            .origins
            .get(&origin)
            .ok_or(TimeError::UnknownOrigin(origin.0))?;
        if sequence.chunk_number == 0 {
            return Err(TimeError::InvalidChunk {
                origin: origin.0,
                sequence: sequence.sequence_number,
                chunk: 0,
            });
        }

        let advanced_to = {
            let mut state = slot.state.lock();
            if sequence.sequence_number < state.next_sequence {
                // Already applied.
                None
            } else {
                let entry = state.pending.entry(sequence.sequence_number).or_default();
                entry.watermark = entry.watermark.max(watermark);
                entry.chunks_seen += 1;
                if sequence.last_chunk {
                    entry.last_chunk = Some(sequence.chunk_number);
                }
                Self::drain_complete(&mut state)
            }
        };

        if let Some(origin_watermark) = advanced_to {
            slot.watermark.fetch_max(origin_watermark, Ordering::AcqRel);
            self.recompute();
        }
        Ok(self.current())
    }

    fn drain_complete(state: &mut OriginState) -> Option<Timestamp> {
        let mut advanced_to: Option<Timestamp> = None;
        while state
            .pending
            .get(&state.next_sequence)
            .is_some_and(PendingSequence::is_complete)
        {
            if let Some(done) = state.pending.remove(&state.next_sequence) {
                advanced_to = Some(advanced_to.map_or(done.watermark, |w| w.max(done.watermark)));
            }
            state.next_sequence += 1;
        }
        advanced_to
    }

    fn recompute(&self) {
        let min = self
            .origins
            .values()
            .map(|slot| slot.watermark.load(Ordering::Acquire))
            .min()
            .unwrap_or(0);
        self.current.fetch_max(min, Ordering::AcqRel);
    }

    /// Returns the effective watermark (minimum across origins).
    #[must_use]
    pub fn current(&self) -> Watermark {
        Watermark::new(self.current.load(Ordering::Acquire))
    }

    /// Returns the applied watermark of one origin.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<Watermark> {
        self.origins
            .get(&origin)
            .map(|slot| Watermark::new(slot.watermark.load(Ordering::Acquire)))
    }

    /// Returns the number of tracked origins.
    #[must_use]
    pub fn num_origins(&self) -> usize {
        self.origins.len()
    }

    /// Captures applied watermarks and sequence positions.
    ///
    /// Pending out-of-order reports are not captured; they are re-sent by
    /// upstream after recovery.
    #[must_use]
    pub fn snapshot(&self) -> WatermarkSnapshot {
        let mut origins: Vec<_> = self
            .origins
            .iter()
            .map(|(id, slot)| {
                let next = slot.state.lock().next_sequence;
                (id.0, slot.watermark.load(Ordering::Acquire), next)
            })
            .collect();
        origins.sort_unstable();
        WatermarkSnapshot { origins }
    }

    /// Rebuilds a registry from a snapshot.
    #[must_use]
    pub fn restore(snapshot: &WatermarkSnapshot) -> Self {
        let origins = snapshot
            .origins
            .iter()
            .map(|&(id, watermark, next)| {
                (
                    OriginId(id),
                    OriginSlot {
                        state: Mutex::new(OriginState::new(next)),
                        watermark: AtomicU64::new(watermark),
                    },
                )
            })
            .collect();
        let registry = Self {
            origins,
            current: AtomicU64::new(0),
        };
        registry.recompute();
        registry
    }
}

impl std::fmt::Debug for WatermarkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkRegistry")
            .field("origins", &self.origins.len())
            .field("current", &self.current())
            .finish()
    }
}
