//! The presentation player.
//!
//! A dedicated worker thread pushes pre-generated frames of one direction to
//! the frame bus at the monitor's refresh rate. Scheduling is deadline-based
//! against a monotonic clock: the worker publishes every frame index exactly
//! once, in order, and sleeps to the next frame boundary. A late tick
//! publishes the missed indices back-to-back instead of skipping them, so
//! the display-event log always advances by exactly one per event.
//!
//! Publish failures are retried once; two consecutive failures stop the
//! worker and surface a fatal error to the orchestrator.

use crate::bus::{FrameBus, StimulusFrameInfo};
use crate::error::{IsiError, IsiResult};
use crate::stimulus::{Direction, LibraryStatus, StimulusLibrary};
use crate::sync_log::{DisplayEvent, SyncTracker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Observer invoked for every published display event (the recorder tap).
pub type DisplayEventSink = Arc<dyn Fn(&DisplayEvent) + Send + Sync>;

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<StopSignal>,
    direction: Direction,
}

struct StopSignal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn trigger(&self) {
        let mut flag = match self.flag.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *flag = true;
        self.condvar.notify_all();
    }

    /// Sleep until `deadline` or the stop flag; returns true if stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut flag = match self.flag.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        loop {
            if *flag {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = match self.condvar.wait_timeout(flag, deadline - now) {
                Ok(r) => r,
                Err(p) => p.into_inner(),
            };
            flag = guard;
        }
    }

    fn is_triggered(&self) -> bool {
        match self.flag.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }
}

/// Plays one pre-generated direction at monitor rate.
pub struct PresentationPlayer {
    library: Arc<StimulusLibrary>,
    bus: Arc<FrameBus>,
    sync: Arc<SyncTracker>,
    worker: Mutex<Option<Worker>>,
    event_sink: RwLock<Option<DisplayEventSink>>,
    fatal: Arc<Mutex<Option<IsiError>>>,
    sweep_done: Arc<AtomicBool>,
}

impl PresentationPlayer {
    /// Player over the given library and bus.
    pub fn new(
        library: Arc<StimulusLibrary>,
        bus: Arc<FrameBus>,
        sync: Arc<SyncTracker>,
    ) -> Self {
        Self {
            library,
            bus,
            sync,
            worker: Mutex::new(None),
            event_sink: RwLock::new(None),
            fatal: Arc::new(Mutex::new(None)),
            sweep_done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install (or clear) the per-event observer used while recording.
    pub fn set_event_sink(&self, sink: Option<DisplayEventSink>) {
        *self.write_sink() = sink;
    }

    /// Start playing `direction` at `monitor_fps` from the live library.
    ///
    /// Preconditions are checked in order: library ready, known direction
    /// (parsed upstream), positive fps, non-empty sweep, not already
    /// playing. On any failure no worker is spawned.
    pub fn start(&self, direction: Direction, monitor_fps: f64) -> IsiResult<()> {
        if self.library.status() != LibraryStatus::Ready {
            return Err(IsiError::EmptyLibrary);
        }
        if !(monitor_fps > 0.0) {
            return Err(IsiError::InvalidFps(monitor_fps));
        }
        let sweep = self
            .library
            .direction(direction)
            .ok_or(IsiError::EmptyLibrary)?;
        self.start_sweep(direction, sweep, monitor_fps)
    }

    /// Start playing a specific sweep snapshot.
    ///
    /// The recording path holds the session's snapshotted sweeps and uses
    /// this entry point directly, so a mid-session library invalidation
    /// cannot pull frames out from under an in-flight session.
    pub fn start_sweep(
        &self,
        direction: Direction,
        sweep: Arc<crate::stimulus::DirectionLibrary>,
        monitor_fps: f64,
    ) -> IsiResult<()> {
        if !(monitor_fps > 0.0) {
            return Err(IsiError::InvalidFps(monitor_fps));
        }
        if sweep.is_empty() {
            return Err(IsiError::EmptyLibrary);
        }

        let mut slot = self.lock_worker();
        if slot.is_some() {
            return Err(IsiError::AlreadyPlaying);
        }

        *self.lock_fatal() = None;
        self.sweep_done.store(false, Ordering::Release);

        let stop = Arc::new(StopSignal::new());
        let handle = {
            let stop = Arc::clone(&stop);
            let bus = Arc::clone(&self.bus);
            let sync = Arc::clone(&self.sync);
            let sink = self.read_sink().clone();
            let sweep_done = Arc::clone(&self.sweep_done);
            let fatal = Arc::clone(&self.fatal);
            let height = sweep.frames[0].dim().0 as u32;
            let width = sweep.frames[0].dim().1 as u32;

            std::thread::Builder::new()
                .name(format!("player-{direction}"))
                .spawn(move || {
                    let result = play_loop(
                        &sweep, direction, monitor_fps, width, height, &bus, &sync, &sink,
                        &stop, &sweep_done,
                    );
                    if let Err(err) = result {
                        error!(direction = %direction, error = %err, "player worker failed");
                        *lock_or_recover(&fatal) = Some(err);
                    }
                })
                .map_err(IsiError::Io)?
        };

        info!(direction = %direction, fps = monitor_fps, "presentation started");
        *slot = Some(Worker {
            handle,
            stop,
            direction,
        });
        Ok(())
    }

    /// Stop playback. Idempotent; joins the worker and leaves the bus intact.
    pub fn stop(&self) {
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            worker.stop.trigger();
            if worker.handle.join().is_err() {
                warn!(direction = %worker.direction, "player worker panicked during stop");
            }
            debug!(direction = %worker.direction, "presentation stopped");
        }
    }

    /// Whether a worker is currently active.
    pub fn is_playing(&self) -> bool {
        let mut slot = self.lock_worker();
        if let Some(worker) = slot.as_ref() {
            if worker.handle.is_finished() {
                // Worker ended on its own (end of sweep hold is not an end;
                // this means a fatal error).
                if let Some(worker) = slot.take() {
                    let _ = worker.handle.join();
                }
                return false;
            }
            return true;
        }
        false
    }

    /// Direction currently playing, if any.
    pub fn current_direction(&self) -> Option<Direction> {
        self.lock_worker().as_ref().map(|w| w.direction)
    }

    /// Publish a single baseline frame at `stimulus.background_luminance`.
    pub fn display_baseline(&self, width: u32, height: u32, luminance: f64) -> IsiResult<()> {
        let meta = self.bus.publish_baseline(width, height, luminance)?;
        self.sync.record_stimulus(
            meta.frame_index,
            &meta.direction,
            meta.angle_degrees,
            meta.publish_timestamp_ns,
        );
        Ok(())
    }

    /// Take the fatal error left behind by a dead worker, if any.
    pub fn take_fatal_error(&self) -> Option<IsiError> {
        self.lock_fatal().take()
    }

    /// True once the worker has published the final frame of its sweep.
    ///
    /// The worker keeps holding the last frame until [`stop`](Self::stop);
    /// the orchestrator uses this flag to end the stimulus phase.
    pub fn sweep_complete(&self) -> bool {
        self.sweep_done.load(Ordering::Acquire)
    }

    /// Map a camera frame index to the stimulus frame on screen at the same
    /// wall-clock offset: `floor(k * monitor_fps / camera_fps)`.
    pub fn stimulus_frame_index_for_camera_frame(
        camera_frame_index: u64,
        camera_fps: f64,
        monitor_fps: f64,
    ) -> Option<u64> {
        if !(camera_fps > 0.0) || !(monitor_fps > 0.0) {
            return None;
        }
        Some((camera_frame_index as f64 * monitor_fps / camera_fps).floor() as u64)
    }

    /// Stimulus angle on screen for a given camera frame, or `None` when
    /// the direction is absent or the mapped index is out of range.
    pub fn stimulus_angle_for_camera_frame(
        &self,
        camera_frame_index: u64,
        camera_fps: f64,
        monitor_fps: f64,
        direction: Direction,
    ) -> Option<f64> {
        let index =
            Self::stimulus_frame_index_for_camera_frame(camera_frame_index, camera_fps, monitor_fps)?;
        self.library.angle_at(direction, index as usize)
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        lock_or_recover(&self.worker)
    }

    fn lock_fatal(&self) -> std::sync::MutexGuard<'_, Option<IsiError>> {
        lock_or_recover(&self.fatal)
    }

    fn read_sink(&self) -> std::sync::RwLockReadGuard<'_, Option<DisplayEventSink>> {
        match self.event_sink.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write_sink(&self) -> std::sync::RwLockWriteGuard<'_, Option<DisplayEventSink>> {
        match self.event_sink.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[allow(clippy::too_many_arguments)]
fn play_loop(
    sweep: &crate::stimulus::DirectionLibrary,
    direction: Direction,
    monitor_fps: f64,
    width: u32,
    height: u32,
    bus: &FrameBus,
    sync: &SyncTracker,
    sink: &Option<DisplayEventSink>,
    stop: &StopSignal,
    sweep_done: &AtomicBool,
) -> IsiResult<()> {
    let t0 = Instant::now();
    let frame_period = Duration::from_secs_f64(1.0 / monitor_fps);
    let last_index = sweep.len() - 1;
    let mut next_index: usize = 0;

    loop {
        if stop.is_triggered() {
            return Ok(());
        }

        // Publish every index whose deadline has passed, one event per index.
        let elapsed = t0.elapsed().as_secs_f64();
        let due = ((elapsed * monitor_fps).floor() as usize).min(last_index);

        while next_index <= due {
            publish_one(sweep, direction, next_index, width, height, bus, sync, sink)?;
            next_index += 1;
        }

        if next_index > last_index {
            // End of sweep: hold the final frame on screen until stopped.
            sweep_done.store(true, Ordering::Release);
            if stop.wait_until(Instant::now() + Duration::from_millis(20)) {
                return Ok(());
            }
            continue;
        }

        let deadline = t0 + frame_period.mul_f64(next_index as f64);
        if stop.wait_until(deadline) {
            return Ok(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn publish_one(
    sweep: &crate::stimulus::DirectionLibrary,
    direction: Direction,
    index: usize,
    width: u32,
    height: u32,
    bus: &FrameBus,
    sync: &SyncTracker,
    sink: &Option<DisplayEventSink>,
) -> IsiResult<()> {
    let frame = &sweep.frames[index];
    let angle = sweep.angles[index];
    let info = StimulusFrameInfo {
        frame_index: index as u64,
        direction: direction.as_str().to_string(),
        angle_degrees: angle,
        width,
        height,
    };

    let data = frame
        .as_slice()
        .ok_or_else(|| IsiError::PublishFailed("frame is not C-contiguous".into()))?;

    // One retry per frame; two consecutive failures are fatal.
    let meta = match bus.write_stimulus_frame(data, info.clone()) {
        Ok(meta) => meta,
        Err(first) => {
            warn!(direction = %direction, index, error = %first, "stimulus publish failed; retrying");
            bus.write_stimulus_frame(data, info)?
        }
    };

    sync.record_stimulus(index as u64, direction.as_str(), angle, meta.publish_timestamp_ns);

    if let Some(sink) = sink {
        sink(&DisplayEvent {
            frame_index: index as u64,
            direction: direction.as_str().to_string(),
            angle_degrees: angle,
            publish_timestamp_ns: meta.publish_timestamp_ns,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FrameBusConfig;
    use crate::stimulus::{MonitorGeometry, StimulusParams, TransformMode};
    use std::sync::atomic::AtomicUsize;

    fn geometry() -> MonitorGeometry {
        MonitorGeometry {
            width_px: 16,
            height_px: 8,
            width_cm: 40.0,
            height_cm: 20.0,
            distance_cm: 10.0,
            lateral_angle_deg: 0.0,
            tilt_angle_deg: 0.0,
            refresh_rate_hz: 200.0,
        }
    }

    fn params() -> StimulusParams {
        StimulusParams {
            bar_width_deg: 20.0,
            drift_speed_deg_per_sec: 400.0,
            checker_size_deg: 25.0,
            flicker_rate_hz: 6.0,
            background_luminance: 0.5,
            transform_mode: TransformMode::Spherical,
        }
    }

    fn fixture(dir: &std::path::Path) -> (Arc<StimulusLibrary>, Arc<FrameBus>, Arc<SyncTracker>) {
        let library = Arc::new(StimulusLibrary::new());
        library
            .pregenerate(&geometry(), &params(), 1 << 30, &AtomicBool::new(false))
            .unwrap();
        let bus = Arc::new(
            FrameBus::new(&FrameBusConfig {
                shm_dir: dir.to_path_buf(),
                stimulus_slot_bytes: 1024,
                camera_slot_bytes: 1024,
                slot_count: 8,
                stimulus_port: 0,
                camera_port: 0,
            })
            .unwrap(),
        );
        let sync = Arc::new(SyncTracker::default());
        (library, bus, sync)
    }

    #[test]
    fn start_preconditions_checked_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());

        // Not ready: EmptyLibrary, regardless of fps.
        let empty = PresentationPlayer::new(
            Arc::new(StimulusLibrary::new()),
            Arc::clone(&bus),
            Arc::clone(&sync),
        );
        assert!(matches!(
            empty.start(Direction::LR, 0.0),
            Err(IsiError::EmptyLibrary)
        ));

        // Ready but bad fps: InvalidFps, no worker spawned.
        let player = PresentationPlayer::new(library, bus, sync);
        assert!(matches!(
            player.start(Direction::LR, 0.0),
            Err(IsiError::InvalidFps(_))
        ));
        assert!(matches!(
            player.start(Direction::LR, -60.0),
            Err(IsiError::InvalidFps(_))
        ));
        assert!(!player.is_playing());
    }

    #[test]
    fn only_one_direction_plays_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());
        let player = PresentationPlayer::new(library, bus, sync);

        player.start(Direction::LR, 200.0).unwrap();
        assert!(matches!(
            player.start(Direction::RL, 200.0),
            Err(IsiError::AlreadyPlaying)
        ));
        assert_eq!(player.current_direction(), Some(Direction::LR));
        player.stop();
        assert!(!player.is_playing());
        // Stop is idempotent.
        player.stop();
    }

    #[test]
    fn display_events_advance_by_one_with_nondecreasing_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());
        let n = library.direction(Direction::LR).unwrap().len();
        let player = PresentationPlayer::new(library, Arc::clone(&bus), Arc::clone(&sync));

        player.start(Direction::LR, 500.0).unwrap();
        // 500 fps over a short sweep: finishes fast.
        for _ in 0..400 {
            if player.sweep_complete() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        player.stop();

        let events = sync.snapshot().stimulus;
        assert_eq!(events.len(), n);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.frame_index, i as u64);
            assert_eq!(event.direction, "LR");
        }
        for pair in events.windows(2) {
            assert!(pair[1].publish_timestamp_ns >= pair[0].publish_timestamp_ns);
        }
        assert_eq!(bus.stimulus_frames_written(), n as u64);
    }

    #[test]
    fn event_sink_sees_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());
        let n = library.direction(Direction::TB).unwrap().len();
        let player = PresentationPlayer::new(library, bus, sync);

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        player.set_event_sink(Some(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })));

        player.start(Direction::TB, 500.0).unwrap();
        for _ in 0..400 {
            if player.sweep_complete() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        player.stop();
        assert_eq!(count.load(Ordering::SeqCst), n);
    }

    #[test]
    fn baseline_is_published_once_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());
        let player = PresentationPlayer::new(library, Arc::clone(&bus), sync);

        player.display_baseline(16, 8, 0.3).unwrap();
        player.display_baseline(16, 8, 0.3).unwrap();
        assert_eq!(bus.stimulus_frames_written(), 2);
    }

    #[test]
    fn camera_frame_mapping_matches_floor_formula() {
        assert_eq!(
            PresentationPlayer::stimulus_frame_index_for_camera_frame(100, 30.0, 60.0),
            Some(200)
        );
        assert_eq!(
            PresentationPlayer::stimulus_frame_index_for_camera_frame(0, 30.0, 60.0),
            Some(0)
        );
        assert_eq!(
            PresentationPlayer::stimulus_frame_index_for_camera_frame(7, 30.0, 60.0),
            Some(14)
        );
        assert_eq!(
            PresentationPlayer::stimulus_frame_index_for_camera_frame(7, 0.0, 60.0),
            None
        );
        assert_eq!(
            PresentationPlayer::stimulus_frame_index_for_camera_frame(7, 30.0, -1.0),
            None
        );
    }

    #[test]
    fn angle_lookup_returns_library_values() {
        let dir = tempfile::tempdir().unwrap();
        let (library, bus, sync) = fixture(dir.path());
        let angles = library.direction(Direction::LR).unwrap().angles.clone();
        let player = PresentationPlayer::new(library, bus, sync);

        // camera 100 fps, monitor 200 fps: camera frame k maps to 2k.
        let angle = player
            .stimulus_angle_for_camera_frame(1, 100.0, 200.0, Direction::LR)
            .unwrap();
        assert_eq!(angle, angles[2]);

        // Out of range maps to None.
        assert!(player
            .stimulus_angle_for_camera_frame(10_000, 100.0, 200.0, Direction::LR)
            .is_none());
    }
}
