//! Append-only timing log for stimulus/camera correlation.
//!
//! Two bounded streams, one per source. The tracker performs no alignment or
//! interpolation; it only preserves the raw timing events so that real-time
//! broadcasts and post hoc analysis can correlate stimulus angle with camera
//! frames via timestamps.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default per-stream capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One published stimulus frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayEvent {
    /// Index within the direction's sweep.
    pub frame_index: u64,
    /// Sweep direction, or `"baseline"`.
    pub direction: String,
    /// Bar-center angle shown, degrees.
    pub angle_degrees: f64,
    /// Wall-clock publish time, nanoseconds.
    pub publish_timestamp_ns: u64,
}

/// One captured camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraTimingEvent {
    /// Ring-assigned frame id.
    pub frame_id: u64,
    /// Capture timestamp, nanoseconds.
    pub timestamp_ns: u64,
}

/// Consistent view of both streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Recent stimulus display events, oldest first.
    pub stimulus: Vec<DisplayEvent>,
    /// Recent camera timing events, oldest first.
    pub camera: Vec<CameraTimingEvent>,
}

struct Inner {
    stimulus: VecDeque<DisplayEvent>,
    camera: VecDeque<CameraTimingEvent>,
}

/// Thread-safe bounded dual-stream timing log.
pub struct SyncTracker {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SyncTracker {
    /// Tracker bounding each stream to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stimulus: VecDeque::with_capacity(capacity.min(1024)),
                camera: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity,
        }
    }

    /// Append one stimulus display event.
    pub fn record_stimulus(
        &self,
        frame_index: u64,
        direction: &str,
        angle_degrees: f64,
        timestamp_ns: u64,
    ) {
        let mut inner = self.lock();
        if inner.stimulus.len() == self.capacity {
            inner.stimulus.pop_front();
        }
        inner.stimulus.push_back(DisplayEvent {
            frame_index,
            direction: direction.to_string(),
            angle_degrees,
            publish_timestamp_ns: timestamp_ns,
        });
    }

    /// Append one camera timing event.
    pub fn record_camera(&self, frame_id: u64, timestamp_ns: u64) {
        let mut inner = self.lock();
        if inner.camera.len() == self.capacity {
            inner.camera.pop_front();
        }
        inner.camera.push_back(CameraTimingEvent {
            frame_id,
            timestamp_ns,
        });
    }

    /// Both streams under a single lock acquisition.
    pub fn snapshot(&self) -> SyncSnapshot {
        let inner = self.lock();
        SyncSnapshot {
            stimulus: inner.stimulus.iter().cloned().collect(),
            camera: inner.camera.iter().cloned().collect(),
        }
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.stimulus.clear();
        inner.camera.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_are_bounded() {
        let tracker = SyncTracker::new(3);
        for i in 0..5 {
            tracker.record_camera(i, i * 10);
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.camera.len(), 3);
        assert_eq!(snap.camera[0].frame_id, 2);
        assert_eq!(snap.camera[2].frame_id, 4);
    }

    #[test]
    fn snapshot_is_consistent_and_ordered() {
        let tracker = SyncTracker::new(100);
        tracker.record_stimulus(0, "LR", -40.0, 100);
        tracker.record_stimulus(1, "LR", -39.0, 200);
        tracker.record_camera(0, 150);

        let snap = tracker.snapshot();
        assert_eq!(snap.stimulus.len(), 2);
        assert_eq!(snap.camera.len(), 1);
        assert!(snap.stimulus[0].publish_timestamp_ns < snap.stimulus[1].publish_timestamp_ns);
    }

    #[test]
    fn clear_empties_both_streams() {
        let tracker = SyncTracker::new(10);
        tracker.record_stimulus(0, "TB", 5.0, 1);
        tracker.record_camera(0, 2);
        tracker.clear();
        let snap = tracker.snapshot();
        assert!(snap.stimulus.is_empty());
        assert!(snap.camera.is_empty());
    }
}
