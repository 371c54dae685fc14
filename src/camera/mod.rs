//! Camera acquisition service.
//!
//! Owns the device lifecycle (`closed → detected → open → streaming`) and
//! the asynchronous capture loop. Captured frames are cropped to a centered
//! square, converted to the single-channel wire format, optionally handed to
//! the active recorder, and published on the frame bus' camera channel.
//! Detection results are written into the volatile `camera` parameter group;
//! the only camera field the frontend may change is the selection.

pub mod device;

pub use device::{CameraBackend, CameraDevice, CameraInfo, CapturedFrame, MockBackend};

use crate::bus::{CameraFrameInfo, FrameBus, SidebandPublisher};
use crate::error::{IsiError, IsiResult};
use crate::params::{ParamMap, ParamValue, ParameterStore};
use crate::sync_log::SyncTracker;
use crate::timebase::wall_clock_ns;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timestamp provenance tag for device-reported timestamps.
pub const TS_SOURCE_HARDWARE: &str = "hardware";
/// Timestamp provenance tag for the dev-mode host-clock substitute.
pub const TS_SOURCE_SOFTWARE_DEV: &str = "software_dev_mode";

/// Frames between histogram broadcasts.
const HISTOGRAM_INTERVAL: u64 = 30;

/// Streaming health window: no frame for this long means not streaming.
const STREAM_STALL: Duration = Duration::from_secs(2);

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    /// No device handle.
    Closed,
    /// Devices enumerated, none open.
    Detected,
    /// Device open, capture loop not running.
    Open,
    /// Capture loop running.
    Streaming,
}

/// One wire-format frame as offered to the recorder tap.
pub struct CameraFrameRecord<'a> {
    /// Grayscale payload.
    pub data: &'a [u8],
    /// Side length of the square frame.
    pub width: u32,
    /// Side length of the square frame.
    pub height: u32,
    /// Capture timestamp, nanoseconds.
    pub capture_timestamp_ns: u64,
    /// Timestamp provenance tag.
    pub timestamp_source: &'a str,
}

/// Recorder tap invoked for each frame before it is published.
///
/// An error from the sink is fatal to the stream (and, upstream, to the
/// session): captured frames must never be silently withheld from an active
/// recording.
pub type CameraFrameSink = Arc<dyn Fn(&CameraFrameRecord<'_>) -> IsiResult<()> + Send + Sync>;

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

struct Inner {
    state: CameraState,
    worker: Option<Worker>,
    open_name: Option<String>,
}

/// The camera service.
pub struct CameraService {
    backend: Box<dyn CameraBackend>,
    params: Arc<ParameterStore>,
    bus: Arc<FrameBus>,
    sync: Arc<SyncTracker>,
    events: Option<Arc<SidebandPublisher>>,
    inner: Mutex<Inner>,
    device_slot: Arc<Mutex<Option<Box<dyn CameraDevice>>>>,
    last_frame_ns: Arc<AtomicU64>,
    frame_sink: Arc<RwLock<Option<CameraFrameSink>>>,
    fatal: Arc<Mutex<Option<IsiError>>>,
}

impl CameraService {
    /// Service over the given driver backend.
    pub fn new(
        backend: Box<dyn CameraBackend>,
        params: Arc<ParameterStore>,
        bus: Arc<FrameBus>,
        sync: Arc<SyncTracker>,
        events: Option<Arc<SidebandPublisher>>,
    ) -> Self {
        Self {
            backend,
            params,
            bus,
            sync,
            events,
            inner: Mutex::new(Inner {
                state: CameraState::Closed,
                worker: None,
                open_name: None,
            }),
            device_slot: Arc::new(Mutex::new(None)),
            last_frame_ns: Arc::new(AtomicU64::new(0)),
            frame_sink: Arc::new(RwLock::new(None)),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Enumerate devices and publish the results into the volatile
    /// `camera` group. Any probe handle is released by the backend before
    /// this returns.
    pub fn detect(&self) -> IsiResult<Vec<CameraInfo>> {
        let devices = self.backend.enumerate()?;
        info!(count = devices.len(), "camera detection complete");

        let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
        let mut partial = ParamMap::new();
        partial.insert("available_cameras".into(), ParamValue::StrArray(names));

        // If the selected device is among the detected ones, publish its
        // capabilities too.
        if let Ok(selected) = self.params.get_string("camera", "selected_camera") {
            if let Some(info) = devices.iter().find(|d| d.name == selected) {
                partial.insert("width_px".into(), ParamValue::Int(info.width as i64));
                partial.insert("height_px".into(), ParamValue::Int(info.height as i64));
                partial.insert("fps".into(), ParamValue::Float(info.fps));
            }
        }
        self.params.update("camera", partial)?;

        let mut inner = self.lock_inner();
        if inner.state == CameraState::Closed {
            inner.state = CameraState::Detected;
        }
        Ok(devices)
    }

    /// Open the device named by `camera.selected_camera`.
    pub fn open_selected(&self) -> IsiResult<()> {
        let name = self
            .params
            .get_string("camera", "selected_camera")
            .ok()
            .filter(|n| !n.is_empty())
            .ok_or(IsiError::NoCameraSelected)?;

        let mut inner = self.lock_inner();
        reap_finished_worker(&mut inner);
        if inner.state == CameraState::Streaming {
            return Err(IsiError::OpenFailed("camera is streaming".into()));
        }
        if inner.state == CameraState::Open && inner.open_name.as_deref() == Some(name.as_str()) {
            return Ok(());
        }

        let device = self.backend.open(&name)?;
        let info = device.info().clone();

        let mut partial = ParamMap::new();
        partial.insert("width_px".into(), ParamValue::Int(info.width as i64));
        partial.insert("height_px".into(), ParamValue::Int(info.height as i64));
        partial.insert("fps".into(), ParamValue::Float(info.fps));
        self.params.update("camera", partial)?;

        *lock_or_recover(&self.device_slot) = Some(device);
        inner.state = CameraState::Open;
        inner.open_name = Some(name.clone());
        info!(camera = %name, "camera opened");
        Ok(())
    }

    /// Start the capture loop. The device must be open.
    pub fn start(&self) -> IsiResult<()> {
        let mut inner = self.lock_inner();
        reap_finished_worker(&mut inner);
        if inner.state == CameraState::Streaming {
            return Ok(());
        }
        let device = lock_or_recover(&self.device_slot)
            .take()
            .ok_or_else(|| IsiError::OpenFailed("camera is not open".into()))?;

        let dev_mode = self
            .params
            .get_bool("system", "development_mode")
            .unwrap_or(false);

        *lock_or_recover(&self.fatal) = None;
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let bus = Arc::clone(&self.bus);
            let sync = Arc::clone(&self.sync);
            let events = self.events.clone();
            let sink = Arc::clone(&self.frame_sink);
            let fatal = Arc::clone(&self.fatal);
            let last_frame_ns = Arc::clone(&self.last_frame_ns);
            let device_slot = Arc::clone(&self.device_slot);

            std::thread::Builder::new()
                .name("camera-capture".into())
                .spawn(move || {
                    let mut device = device;
                    let result = capture_loop(
                        device.as_mut(),
                        dev_mode,
                        &bus,
                        &sync,
                        events.as_deref(),
                        &sink,
                        &last_frame_ns,
                        &stop,
                    );
                    if let Err(err) = result {
                        error!(error = %err, "camera capture loop failed");
                        *lock_or_recover(&fatal) = Some(err);
                    }
                    // Hand the handle back so the device survives stop/start.
                    *lock_or_recover(&device_slot) = Some(device);
                })
                .map_err(IsiError::Io)?
        };

        inner.worker = Some(Worker { handle, stop });
        inner.state = CameraState::Streaming;
        info!("camera capture started");
        Ok(())
    }

    /// Signal and join the capture loop. Idempotent.
    pub fn stop(&self) {
        let worker = {
            let mut inner = self.lock_inner();
            let worker = inner.worker.take();
            if worker.is_some() {
                inner.state = CameraState::Open;
            }
            worker
        };
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                warn!("camera capture thread panicked during stop");
            }
            debug!("camera capture stopped");
        }
    }

    /// Stop streaming and release the device handle.
    pub fn close(&self) {
        self.stop();
        let mut inner = self.lock_inner();
        *lock_or_recover(&self.device_slot) = None;
        inner.open_name = None;
        inner.state = CameraState::Closed;
    }

    /// Install (or clear) the recorder tap.
    pub fn set_frame_sink(&self, sink: Option<CameraFrameSink>) {
        *write_or_recover(&self.frame_sink) = sink;
    }

    /// `streaming` only while the capture thread is alive and a frame was
    /// published within the last two seconds.
    pub fn is_streaming(&self) -> bool {
        let inner = self.lock_inner();
        let thread_alive = inner
            .worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false);
        if !thread_alive {
            return false;
        }
        let last = self.last_frame_ns.load(Ordering::Acquire);
        last != 0 && wall_clock_ns().saturating_sub(last) < STREAM_STALL.as_nanos() as u64
    }

    /// Current lifecycle state (worker death degrades `Streaming` to `Open`).
    pub fn state(&self) -> CameraState {
        let inner = self.lock_inner();
        match inner.state {
            CameraState::Streaming => {
                let alive = inner
                    .worker
                    .as_ref()
                    .map(|w| !w.handle.is_finished())
                    .unwrap_or(false);
                if alive {
                    CameraState::Streaming
                } else {
                    CameraState::Open
                }
            }
            other => other,
        }
    }

    /// Take the fatal error left behind by a dead capture loop, if any.
    pub fn take_fatal_error(&self) -> Option<IsiError> {
        lock_or_recover(&self.fatal).take()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        lock_or_recover(&self.inner)
    }
}

/// A capture loop that died on its own leaves `Streaming` state behind;
/// fold it back to `Open` before acting on the state.
fn reap_finished_worker(inner: &mut Inner) {
    let finished = inner
        .worker
        .as_ref()
        .map(|w| w.handle.is_finished())
        .unwrap_or(false);
    if finished {
        if let Some(worker) = inner.worker.take() {
            let _ = worker.handle.join();
        }
        if inner.state == CameraState::Streaming {
            inner.state = CameraState::Open;
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn read_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    device: &mut dyn CameraDevice,
    dev_mode: bool,
    bus: &FrameBus,
    sync: &SyncTracker,
    events: Option<&SidebandPublisher>,
    sink: &RwLock<Option<CameraFrameSink>>,
    last_frame_ns: &AtomicU64,
    stop: &AtomicBool,
) -> IsiResult<()> {
    let info = device.info().clone();
    let period = if info.fps > 0.0 {
        Duration::from_secs_f64(1.0 / info.fps)
    } else {
        Duration::from_millis(33)
    };
    let mut warned_dev_mode = false;
    let mut frames_published: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        let tick = Instant::now();

        let frame = device
            .read_frame()
            .map_err(|e| IsiError::CaptureFailed(e.to_string()))?;

        let (timestamp_ns, source) = match frame.hardware_timestamp_us {
            Some(us) => (us * 1_000, TS_SOURCE_HARDWARE),
            None if dev_mode => {
                if !warned_dev_mode {
                    warn!(
                        "camera provides no hardware timestamp; substituting host clock \
                         (development mode). Data is tagged software_dev_mode."
                    );
                    warned_dev_mode = true;
                }
                (wall_clock_ns(), TS_SOURCE_SOFTWARE_DEV)
            }
            None => return Err(IsiError::HardwareTimestampUnavailable),
        };

        let (data, side) = device::to_wire_format(&frame);

        // Recording tap first: a captured frame is never withheld from the
        // recorder because a downstream reader is slow.
        if let Some(sink) = read_or_recover(sink).clone() {
            sink(&CameraFrameRecord {
                data: &data,
                width: side,
                height: side,
                capture_timestamp_ns: timestamp_ns,
                timestamp_source: source,
            })?;
        }

        match bus.write_camera_frame(
            &data,
            CameraFrameInfo {
                capture_timestamp_ns: timestamp_ns,
                timestamp_source: source.to_string(),
                exposure_us: frame.exposure_us,
                gain: frame.gain,
                width: side,
                height: side,
                camera_name: info.name.clone(),
            },
        ) {
            Ok(meta) => {
                sync.record_camera(meta.frame_id, timestamp_ns);
                last_frame_ns.store(wall_clock_ns(), Ordering::Release);
                frames_published += 1;

                if frames_published % HISTOGRAM_INTERVAL == 0 {
                    if let Some(events) = events {
                        let histogram = compute_histogram(&data);
                        events.publish(&json!({
                            "type": "camera_histogram_update",
                            "frame_id": meta.frame_id,
                            "histogram": histogram,
                        }));
                    }
                }
            }
            Err(err) => {
                // The renderer loses this frame; the stream keeps going.
                warn!(error = %err, "camera frame publish failed");
            }
        }

        let elapsed = tick.elapsed();
        if elapsed < period {
            let mut remaining = period - elapsed;
            while remaining > Duration::ZERO && !stop.load(Ordering::Acquire) {
                let chunk = remaining.min(Duration::from_millis(50));
                std::thread::sleep(chunk);
                remaining = remaining.saturating_sub(chunk);
            }
        }
    }
    Ok(())
}

fn compute_histogram(data: &[u8]) -> Vec<u32> {
    let mut bins = vec![0u32; 256];
    for &px in data {
        bins[px as usize] += 1;
    }
    bins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FrameBusConfig;
    use crate::params::standard_descriptors;
    use tempfile::tempdir;

    fn service(
        dir: &std::path::Path,
        backend: MockBackend,
    ) -> (CameraService, Arc<ParameterStore>, Arc<FrameBus>) {
        let params = Arc::new(
            ParameterStore::new(dir.join("params.json"), standard_descriptors()).unwrap(),
        );
        let bus = Arc::new(
            FrameBus::new(&FrameBusConfig {
                shm_dir: dir.join("shm"),
                stimulus_slot_bytes: 8192,
                camera_slot_bytes: 8192,
                slot_count: 8,
                stimulus_port: 0,
                camera_port: 0,
            })
            .unwrap(),
        );
        let sync = Arc::new(SyncTracker::default());
        let service = CameraService::new(
            Box::new(backend),
            Arc::clone(&params),
            Arc::clone(&bus),
            sync,
            None,
        );
        (service, params, bus)
    }

    fn select(params: &ParameterStore, name: &str) {
        let mut partial = ParamMap::new();
        partial.insert("selected_camera".into(), ParamValue::Str(name.into()));
        params.update("camera", partial).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn detect_populates_volatile_group() {
        let dir = tempdir().unwrap();
        let (service, params, _bus) = service(dir.path(), MockBackend::new(2, 32, 32, 30.0, true));

        let devices = service.detect().unwrap();
        assert_eq!(devices.len(), 2);
        let available = params.get("camera", "available_cameras").unwrap();
        assert_eq!(
            available.as_str_array().unwrap(),
            &["Mock-0".to_string(), "Mock-1".to_string()]
        );
        assert_eq!(service.state(), CameraState::Detected);
    }

    #[test]
    fn open_requires_selection() {
        let dir = tempdir().unwrap();
        let (service, _params, _bus) = service(dir.path(), MockBackend::single_fast());
        assert!(matches!(
            service.open_selected(),
            Err(IsiError::NoCameraSelected)
        ));
    }

    #[test]
    fn capture_publishes_frames_and_timing() {
        let dir = tempdir().unwrap();
        let (service, params, bus) = service(dir.path(), MockBackend::single_fast());
        select(&params, "Mock-0");

        service.open_selected().unwrap();
        assert_eq!(service.state(), CameraState::Open);
        assert_eq!(params.get_i64("camera", "width_px").unwrap(), 64);

        service.start().unwrap();
        wait_for(|| bus.camera_frames_written() >= 3);
        assert!(service.is_streaming());
        service.stop();
        assert_eq!(service.state(), CameraState::Open);

        let written = bus.camera_frames_written();
        assert!(written >= 3);
        // Stop really stopped the loop.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(bus.camera_frames_written(), written);
    }

    #[test]
    fn hardware_timestamps_are_monotonic_and_ids_consecutive() {
        let dir = tempdir().unwrap();
        let (service, params, bus) = service(dir.path(), MockBackend::single_fast());
        select(&params, "Mock-0");
        service.open_selected().unwrap();

        let sync = Arc::new(SyncTracker::default());
        // Re-wire a service with our sync handle for inspection.
        drop(service);
        let service = CameraService::new(
            Box::new(MockBackend::single_fast()),
            Arc::clone(&params),
            Arc::clone(&bus),
            Arc::clone(&sync),
            None,
        );
        service.open_selected().unwrap();
        service.start().unwrap();
        wait_for(|| sync.snapshot().camera.len() >= 5);
        service.stop();

        let camera = sync.snapshot().camera;
        for pair in camera.windows(2) {
            assert!(pair[1].timestamp_ns >= pair[0].timestamp_ns);
            assert_eq!(pair[1].frame_id, pair[0].frame_id + 1);
        }
    }

    #[test]
    fn missing_hardware_timestamp_without_dev_mode_is_fatal() {
        let dir = tempdir().unwrap();
        let (service, params, bus) =
            service(dir.path(), MockBackend::new(1, 16, 16, 100.0, false));
        select(&params, "Mock-0");
        service.open_selected().unwrap();
        service.start().unwrap();

        // The loop dies on its first frame.
        wait_for(|| service.state() == CameraState::Open);
        let fatal = service.take_fatal_error().unwrap();
        assert!(matches!(fatal, IsiError::HardwareTimestampUnavailable));
        service.stop();
        assert_eq!(bus.camera_frames_written(), 0);
    }

    #[test]
    fn dev_mode_substitutes_software_timestamps() {
        let dir = tempdir().unwrap();
        let (service, params, bus) =
            service(dir.path(), MockBackend::new(1, 16, 16, 100.0, false));
        select(&params, "Mock-0");
        let mut partial = ParamMap::new();
        partial.insert("development_mode".into(), ParamValue::Bool(true));
        params.update("system", partial).unwrap();

        service.open_selected().unwrap();
        service.start().unwrap();
        wait_for(|| bus.camera_frames_written() >= 2);
        service.stop();
        assert!(service.take_fatal_error().is_none());
    }

    #[test]
    fn recorder_sink_error_is_fatal_to_the_stream() {
        let dir = tempdir().unwrap();
        let (service, params, _bus) = service(dir.path(), MockBackend::single_fast());
        select(&params, "Mock-0");
        service.open_selected().unwrap();

        service.set_frame_sink(Some(Arc::new(|_record| {
            Err(IsiError::RecorderIoFailed("disk full".into()))
        })));
        service.start().unwrap();

        wait_for(|| service.state() == CameraState::Open);
        let fatal = service.take_fatal_error().unwrap();
        assert!(fatal.is_fatal());
        service.stop();
    }
}
