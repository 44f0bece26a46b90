//! Window definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sliceflow_core::operator::slice_assigner::SliceAssigner;
use sliceflow_core::Timestamp;

use crate::error::PlanError;

/// Type of window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Fixed-size non-overlapping windows
    Tumbling,
    /// Fixed-size overlapping windows with slide
    Sliding,
}

/// Window size and slide in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDefinition {
    /// Window length
    pub size: Timestamp,
    /// Distance between window starts
    pub slide: Timestamp,
}

impl WindowDefinition {
    /// Tumbling window of `size` milliseconds.
    #[must_use]
    pub fn tumbling(size: Timestamp) -> Self {
        Self { size, slide: size }
    }

    /// Sliding window of `size` milliseconds every `slide` milliseconds.
    #[must_use]
    pub fn sliding(size: Timestamp, slide: Timestamp) -> Self {
        Self { size, slide }
    }

    /// Window from durations, truncated to whole milliseconds.
    #[must_use]
    pub fn from_durations(size: Duration, slide: Duration) -> Self {
        let millis = |d: Duration| Timestamp::try_from(d.as_millis()).unwrap_or(Timestamp::MAX);
        Self::sliding(millis(size), millis(slide))
    }

    /// Tumbling or sliding.
    #[must_use]
    pub fn window_type(&self) -> WindowType {
        if self.size == self.slide {
            WindowType::Tumbling
        } else {
            WindowType::Sliding
        }
    }

    /// Validated slice assigner for this window.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidWindow`] if `slide` is zero or larger
    /// than `size`.
    pub fn assigner(&self) -> Result<SliceAssigner, PlanError> {
        SliceAssigner::new(self.size, self.slide).map_err(|e| PlanError::InvalidWindow(e.to_string()))
    }
}
