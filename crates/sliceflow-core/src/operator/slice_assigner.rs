//! # Slice Assignment
//!
//! Cuts the time axis into slices: the finest intervals that never straddle
//! a window boundary. Windows of length `size` start at every multiple of
//! `slide` (aligned to timestamp 0), so slice edges are the union of all
//! window starts `{0, slide, 2*slide, ...}` and all window ends
//! `{size, size + slide, ...}`.
//!
//! When `size` is a multiple of `slide` the two grids coincide and every
//! slice is exactly one slide long. Otherwise slices have two alternating
//! lengths.
//!
//! ## Example
//!
//! ```rust
//! use sliceflow_core::operator::slice_assigner::SliceAssigner;
//!
//! // size 10, slide 3: window starts 0,3,6,9,12.. and ends 10,13,16..
//! let assigner = SliceAssigner::new(10, 3).unwrap();
//! assert_eq!(assigner.slice_for(8).start, 6);
//! assert_eq!(assigner.slice_for(8).end, 9);
//! assert_eq!(assigner.slice_for(9).end, 10);
//! assert_eq!(assigner.slice_for(12).end, 13);
//! ```

use std::fmt;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use smallvec::SmallVec;

use super::OperatorError;
use crate::time::Timestamp;

/// A half-open slice interval `[start, end)`.
///
/// Ordered by `start` first so slices sort along the time axis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub struct SliceRange {
    /// Inclusive start
    pub start: Timestamp,
    /// Exclusive end
    pub end: Timestamp,
}

impl SliceRange {
    /// Creates a new range.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if `ts` falls into this slice.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// A window `[start, start + size)` that a slice participates in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub struct WindowInfo {
    /// Inclusive window start
    pub start: Timestamp,
    /// Exclusive window end
    pub end: Timestamp,
}

impl WindowInfo {
    /// Creates a new window descriptor.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if the slice lies inside this window.
    #[must_use]
    pub fn covers(&self, slice: &SliceRange) -> bool {
        self.start <= slice.start && slice.end <= self.end
    }
}

impl fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Windows of one slice. Four inline entries cover slide >= size/4.
pub type WindowInfoVec = SmallVec<[WindowInfo; 4]>;

/// Maps timestamps to slices and slices to windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: Timestamp,
    slide: Timestamp,
}

impl SliceAssigner {
    /// Creates a sliding (or tumbling, if `size == slide`) assigner.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidWindow`] if `slide == 0` or `size < slide`.
    pub fn new(size: Timestamp, slide: Timestamp) -> Result<Self, OperatorError> {
        if slide == 0 || size < slide {
            return Err(OperatorError::InvalidWindow { size, slide });
        }
        Ok(Self { size, slide })
    }

    /// Creates a tumbling assigner.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidWindow`] if `size == 0`.
    pub fn tumbling(size: Timestamp) -> Result<Self, OperatorError> {
        Self::new(size, size)
    }

    /// Window size.
    #[must_use]
    pub fn size(&self) -> Timestamp {
        self.size
    }

    /// Window slide.
    #[must_use]
    pub fn slide(&self) -> Timestamp {
        self.slide
    }

    /// Returns true for non-overlapping windows.
    #[must_use]
    pub fn is_tumbling(&self) -> bool {
        self.size == self.slide
    }

    /// Upper bound on windows per slice: `ceil(size / slide)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn max_windows_per_slice(&self) -> usize {
        self.size.div_ceil(self.slide) as usize
    }

    /// Start of the slice containing `ts`.
    #[inline]
    #[must_use]
    pub fn slice_start(&self, ts: Timestamp) -> Timestamp {
        let prev_slide_start = ts - ts % self.slide;
        let prev_window_end = if ts < self.size {
            prev_slide_start
        } else {
            ts - (ts - self.size) % self.slide
        };
        prev_slide_start.max(prev_window_end)
    }

    /// Exclusive end of the slice containing `ts`.
    ///
    /// Saturates at `Timestamp::MAX`: the last slice of the time domain
    /// ends there instead of wrapping.
    #[inline]
    #[must_use]
    pub fn slice_end(&self, ts: Timestamp) -> Timestamp {
        let next_slide_start = ts.saturating_add(self.slide - ts % self.slide);
        let next_window_end = if ts < self.size {
            self.size
        } else {
            ts.saturating_add(self.slide - (ts - self.size) % self.slide)
        };
        next_slide_start.min(next_window_end)
    }

    /// The slice containing `ts`.
    #[inline]
    #[must_use]
    pub fn slice_for(&self, ts: Timestamp) -> SliceRange {
        SliceRange::new(self.slice_start(ts), self.slice_end(ts))
    }

    /// Every window overlapping `slice`, ordered by start.
    #[must_use]
    pub fn windows_for_slice(&self, slice: SliceRange) -> WindowInfoVec {
        let first = if slice.start < self.size {
            0
        } else {
            (slice.start - self.size) / self.slide + 1
        };
        let last = (slice.end - 1) / self.slide;

        (first..=last)
            .map(|k| {
                let start = k * self.slide;
                WindowInfo::new(start, start.saturating_add(self.size))
            })
            .collect()
    }

    /// The window with the largest start that still ends at or before `watermark`.
    #[must_use]
    pub fn last_complete_window(&self, watermark: Timestamp) -> Option<WindowInfo> {
        if watermark < self.size {
            return None;
        }
        let k = (watermark - self.size) / self.slide;
        let start = k * self.slide;
        Some(WindowInfo::new(start, start + self.size))
    }
}
