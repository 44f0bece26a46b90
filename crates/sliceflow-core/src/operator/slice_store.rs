//! # Time-Based Slice Store
//!
//! Owns the live slices of one windowed operator instance and the state
//! machine of every window those slices belong to.
//!
//! ## Window State Machine
//!
//! ```text
//! PENDING ──(watermark >= end)──► READY ──(merged once)──► TRIGGERED ──► forgotten
//! ```
//!
//! Transitions happen under the window-table lock, so a window is merged
//! exactly once even when several threads race to trigger it. A slice is
//! evicted only after every window it participates in is TRIGGERED.
//!
//! ## Concurrency
//!
//! - Ingestion takes the slice map read lock on the fast path and only
//!   upgrades (window table, then slice map write lock) to create a slice.
//! - Per-key mutation inside a slice is the slice state's business; the
//!   store never locks a slice's contents.
//! - A triggered window's slices are cloned under the window-table lock,
//!   so eviction never sees a TRIGGERED window whose slices are uncaptured.
//!   Merging then runs outside the store locks on those `Arc` clones.
//! - Evicted slices are dropped after all locks are released.
//!
//! Lock order is always window table, then slice map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::slice_assigner::{SliceAssigner, SliceRange, WindowInfo, WindowInfoVec};
use crate::time::Timestamp;

/// Lifecycle state of a window.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub enum WindowState {
    /// Has slices, watermark not yet past the window end
    Pending,
    /// Watermark passed the end, not yet merged
    Ready,
    /// Merged and emitted
    Triggered,
}

/// A slice: the finest-grained time bucket of buffered state.
#[derive(Debug)]
pub struct Slice<S> {
    range: SliceRange,
    state: S,
}

impl<S> Slice<S> {
    /// Creates a slice owning `state`.
    #[must_use]
    pub fn new(range: SliceRange, state: S) -> Self {
        Self { range, state }
    }

    /// Slice interval.
    #[must_use]
    pub fn range(&self) -> SliceRange {
        self.range
    }

    /// Inclusive start.
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.range.start
    }

    /// Exclusive end.
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.range.end
    }

    /// Attached operator state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }
}

/// Point-in-time counters of a slice store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceStoreMetrics {
    /// Slices created
    pub slices_created: u64,
    /// Slices evicted
    pub slices_evicted: u64,
    /// Windows triggered
    pub windows_triggered: u64,
    /// Records rejected because their windows were already triggered
    pub late_records: u64,
}

#[derive(Debug, Default)]
struct Counters {
    slices_created: AtomicU64,
    slices_evicted: AtomicU64,
    windows_triggered: AtomicU64,
    late_records: AtomicU64,
}

type SliceFactory<S> = Box<dyn Fn(SliceRange) -> S + Send + Sync>;

/// Store of live slices for one window or join operator instance.
pub struct TimeBasedSliceStore<S> {
    assigner: SliceAssigner,
    factory: SliceFactory<S>,
    slices: RwLock<BTreeMap<SliceRange, Arc<Slice<S>>>>,
    windows: Mutex<BTreeMap<WindowInfo, WindowState>>,
    trigger_watermark: AtomicU64,
    counters: Counters,
}

impl<S> TimeBasedSliceStore<S> {
    /// Creates a store whose slices get their state from `factory`.
    pub fn new(
        assigner: SliceAssigner,
        factory: impl Fn(SliceRange) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            assigner,
            factory: Box::new(factory),
            slices: RwLock::new(BTreeMap::new()),
            windows: Mutex::new(BTreeMap::new()),
            trigger_watermark: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// The assigner this store cuts slices with.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Highest watermark that has been used to trigger windows.
    #[must_use]
    pub fn trigger_watermark(&self) -> Timestamp {
        self.trigger_watermark.load(Ordering::Acquire)
    }

    /// Returns the slice for `ts`, creating it on first use.
    ///
    /// Returns `None` for late records: `ts` lies below the watermark
    /// that already triggered its windows.
    pub fn get_or_create_slice(&self, ts: Timestamp) -> Option<Arc<Slice<S>>> {
        if ts < self.trigger_watermark() {
            self.counters.late_records.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let range = self.assigner.slice_for(ts);
        if let Some(slice) = self.slices.read().get(&range) {
            return Some(Arc::clone(slice));
        }

        let mut windows = self.windows.lock();
        if ts < self.trigger_watermark() {
            self.counters.late_records.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut slices = self.slices.write();
        if let Some(slice) = slices.get(&range) {
            return Some(Arc::clone(slice));
        }

        for window in self.assigner.windows_for_slice(range) {
            windows.entry(window).or_insert(WindowState::Pending);
        }
        let slice = Arc::new(Slice::new(range, (self.factory)(range)));
        slices.insert(range, Arc::clone(&slice));
        self.counters.slices_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(start = range.start, end = range.end, "created slice");
        Some(slice)
    }

    /// Counts records the caller rejected against [`Self::trigger_watermark`].
    pub fn record_late(&self, count: u64) {
        self.counters.late_records.fetch_add(count, Ordering::Relaxed);
    }

    /// Every window `slice` participates in, ordered by start.
    #[must_use]
    pub fn windows_for_slice(&self, slice: &Slice<S>) -> WindowInfoVec {
        self.assigner.windows_for_slice(slice.range())
    }

    /// Triggers every window that ends at or before `watermark`.
    ///
    /// Each such window moves PENDING → READY → TRIGGERED exactly once;
    /// `merge` is called with the window and its slices, in window order.
    /// Windows triggered by an earlier call are never returned again.
    pub fn trigger_ready_windows<R>(
        &self,
        watermark: Timestamp,
        merge: impl FnMut(WindowInfo, &[Arc<Slice<S>>]) -> R,
    ) -> Vec<(WindowInfo, R)> {
        let ready = {
            let mut windows = self.windows.lock();
            self.trigger_watermark.fetch_max(watermark, Ordering::AcqRel);
            for (window, state) in windows.iter_mut() {
                if window.end > watermark {
                    break;
                }
                if *state == WindowState::Pending {
                    *state = WindowState::Ready;
                }
            }
            self.capture_ready(&mut windows)
        };
        self.merge_windows(ready, merge)
    }

    /// Triggers every remaining window regardless of the watermark.
    ///
    /// Used to flush state on graceful termination. Afterwards every
    /// record counts as late.
    pub fn trigger_all_windows<R>(
        &self,
        merge: impl FnMut(WindowInfo, &[Arc<Slice<S>>]) -> R,
    ) -> Vec<(WindowInfo, R)> {
        let ready = {
            let mut windows = self.windows.lock();
            self.trigger_watermark.store(Timestamp::MAX, Ordering::Release);
            for state in windows.values_mut() {
                if *state == WindowState::Pending {
                    *state = WindowState::Ready;
                }
            }
            self.capture_ready(&mut windows)
        };
        self.merge_windows(ready, merge)
    }

    /// Marks READY windows TRIGGERED and clones their slice lists while the
    /// caller still holds the window table, so eviction cannot remove a
    /// slice between the transition and the capture.
    fn capture_ready(
        &self,
        windows: &mut BTreeMap<WindowInfo, WindowState>,
    ) -> Vec<(WindowInfo, Vec<Arc<Slice<S>>>)> {
        let ready: Vec<WindowInfo> = windows
            .iter_mut()
            .filter(|(_, state)| **state == WindowState::Ready)
            .map(|(window, state)| {
                *state = WindowState::Triggered;
                *window
            })
            .collect();
        if ready.is_empty() {
            return Vec::new();
        }
        let slices = self.slices.read();
        ready
            .into_iter()
            .map(|window| (window, Self::slices_in(&slices, window).cloned().collect()))
            .collect()
    }

    fn merge_windows<R>(
        &self,
        ready: Vec<(WindowInfo, Vec<Arc<Slice<S>>>)>,
        mut merge: impl FnMut(WindowInfo, &[Arc<Slice<S>>]) -> R,
    ) -> Vec<(WindowInfo, R)> {
        if ready.is_empty() {
            return Vec::new();
        }
        self.counters
            .windows_triggered
            .fetch_add(ready.len() as u64, Ordering::Relaxed);
        tracing::debug!(windows = ready.len(), "triggering windows");

        ready
            .into_iter()
            .map(|(window, slices)| (window, merge(window, &slices)))
            .collect()
    }

    fn slices_in(
        slices: &BTreeMap<SliceRange, Arc<Slice<S>>>,
        window: WindowInfo,
    ) -> impl Iterator<Item = &Arc<Slice<S>>> {
        slices
            .range(SliceRange::new(window.start, 0)..SliceRange::new(window.end, 0))
            .map(|(_, slice)| slice)
    }

    /// Evicts slices that end at or before `watermark` and whose windows
    /// have all been triggered. Returns the number of evicted slices.
    ///
    /// Triggered windows without remaining slices are forgotten.
    pub fn evict_slices_before(&self, watermark: Timestamp) -> usize {
        let evicted: Vec<Arc<Slice<S>>> = {
            let mut windows = self.windows.lock();
            let mut slices = self.slices.write();

            let candidates: Vec<SliceRange> = slices
                .keys()
                .take_while(|range| range.start < watermark)
                .filter(|range| range.end <= watermark)
                .filter(|range| {
                    self.assigner.windows_for_slice(**range).iter().all(|w| {
                        windows
                            .get(w)
                            .map_or(true, |state| *state == WindowState::Triggered)
                    })
                })
                .copied()
                .collect();

            let evicted: Vec<_> = candidates
                .iter()
                .filter_map(|range| slices.remove(range))
                .collect();

            windows.retain(|window, state| {
                *state != WindowState::Triggered
                    || Self::slices_in(&slices, *window).next().is_some()
            });
            evicted
        };

        let count = evicted.len();
        if count > 0 {
            self.counters
                .slices_evicted
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!(count, watermark, "evicted slices");
        }
        // State is freed here, outside the store locks.
        drop(evicted);
        count
    }

    /// Returns the state of a window, if it is still tracked.
    #[must_use]
    pub fn window_state(&self, window: WindowInfo) -> Option<WindowState> {
        self.windows.lock().get(&window).copied()
    }

    /// All tracked windows and their states, ordered by window.
    #[must_use]
    pub fn window_states(&self) -> Vec<(WindowInfo, WindowState)> {
        self.windows
            .lock()
            .iter()
            .map(|(window, state)| (*window, *state))
            .collect()
    }

    /// Number of live slices.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }

    /// Live slices whose interval ends after `from`, ordered by start.
    #[must_use]
    pub fn slices_from(&self, from: Timestamp) -> Vec<Arc<Slice<S>>> {
        self.slices
            .read()
            .values()
            .filter(|slice| slice.end() > from)
            .cloned()
            .collect()
    }

    /// Installs a slice and window states recovered from a snapshot.
    pub fn restore(
        &self,
        slices: impl IntoIterator<Item = Slice<S>>,
        windows: impl IntoIterator<Item = (WindowInfo, WindowState)>,
        trigger_watermark: Timestamp,
    ) {
        let mut window_table = self.windows.lock();
        let mut slice_map = self.slices.write();
        for slice in slices {
            slice_map.insert(slice.range(), Arc::new(slice));
        }
        window_table.extend(windows);
        self.trigger_watermark
            .fetch_max(trigger_watermark, Ordering::AcqRel);
    }

    /// Discards every slice and window.
    pub fn clear(&self) {
        let dropped = {
            let mut windows = self.windows.lock();
            let mut slices = self.slices.write();
            windows.clear();
            std::mem::take(&mut *slices)
        };
        drop(dropped);
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> SliceStoreMetrics {
        SliceStoreMetrics {
            slices_created: self.counters.slices_created.load(Ordering::Relaxed),
            slices_evicted: self.counters.slices_evicted.load(Ordering::Relaxed),
            windows_triggered: self.counters.windows_triggered.load(Ordering::Relaxed),
            late_records: self.counters.late_records.load(Ordering::Relaxed),
        }
    }
}

impl<S> std::fmt::Debug for TimeBasedSliceStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBasedSliceStore")
            .field("assigner", &self.assigner)
            .field("slices", &self.slice_count())
            .field("trigger_watermark", &self.trigger_watermark())
            .finish_non_exhaustive()
    }
}
