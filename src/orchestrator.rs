//! The acquisition orchestrator.
//!
//! Top-level state machine coordinating the stimulus library, presentation
//! player, camera service, and per-trial recorders:
//!
//! ```text
//! IDLE ──start_record──▶ BASELINE_INITIAL
//!                              ▼
//!                       STIMULUS(direction_i) ──repeat──▶ (same direction)
//!                              │ end of repetitions
//!                              ▼
//!                          INTER_TRIAL ──▶ STIMULUS(direction_{i+1}) ...
//!                              ▼
//!                       BASELINE_FINAL ──▶ COMPLETE
//! ```
//!
//! `PREVIEW` and `PLAYBACK` are parallel modes; any state can fall to
//! `ERROR`, which preserves recorded data, attempts `RECOVERY`, and lands on
//! `IDLE`.
//!
//! Sessions snapshot the parameter store and the library's sweeps when they
//! start: a parameter change that invalidates the library mid-record emits
//! `library_invalidated` but the in-flight session continues on its
//! snapshot. Subsequent sessions pick up the new parameters.

use crate::bus::{CameraFrameInfo, FrameBus, SidebandPublisher};
use crate::camera::{CameraFrameRecord, CameraService, CameraState};
use crate::control::protocol::event;
use crate::error::{IsiError, IsiResult};
use crate::params::ParameterStore;
use crate::player::PresentationPlayer;
use crate::recorder::{RecordPhase, TrialRecorder};
use crate::session::{
    InterruptionPoint, Session, SessionPlan, SessionState, SessionStatus,
};
use crate::stimulus::{
    self, fingerprint, Direction, DirectionLibrary, LibraryStatus, MonitorGeometry,
    StimulusLibrary, StimulusParams,
};
use ndarray::Ix3;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Orchestrator phase, broadcast with every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing running.
    Idle,
    /// Baseline before the first direction.
    BaselineInitial,
    /// A direction's sweep is on screen and recording.
    Stimulus,
    /// Baseline between directions.
    InterTrial,
    /// Baseline after the last direction.
    BaselineFinal,
    /// Session finished normally.
    Complete,
    /// Player + camera streaming, no recorder.
    Preview,
    /// Replaying a finished session from disk.
    Playback,
    /// Fatal failure; data preserved.
    Error,
    /// Re-initialization after an error.
    Recovery,
}

/// Live progress of the current run, readable by `get_acquisition_status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunStatus {
    /// Session id, when recording.
    pub session_id: Option<String>,
    /// Session directory, when recording.
    pub session_root: Option<String>,
    /// Direction currently presented.
    pub direction: Option<String>,
    /// Zero-based repetition of the current direction.
    pub repetition: Option<u32>,
    /// Directions completed so far.
    pub directions_completed: Vec<String>,
    /// Camera frames written to the current trial.
    pub frames_captured: u64,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

struct Inner {
    phase: Phase,
    worker: Option<Worker>,
    last_error: Option<String>,
}

/// Shared state between the camera tap, the player tap, and the worker.
struct RecordShared {
    recorder: Mutex<Option<TrialRecorder>>,
    phase: Mutex<RecordPhase>,
    in_stimulus: AtomicBool,
    stim_frames_seen: AtomicU64,
    sweep_len: AtomicU64,
    camera_fps: f64,
    monitor_fps: f64,
}

impl RecordShared {
    fn stimulus_index_for_next_camera_frame(&self) -> Option<u64> {
        if !self.in_stimulus.load(Ordering::Acquire) {
            return None;
        }
        let k = self.stim_frames_seen.fetch_add(1, Ordering::AcqRel);
        let index =
            PresentationPlayer::stimulus_frame_index_for_camera_frame(k, self.camera_fps, self.monitor_fps)?;
        let len = self.sweep_len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        Some(index.min(len - 1))
    }
}

/// The acquisition orchestrator.
pub struct Orchestrator {
    params: Arc<ParameterStore>,
    library: Arc<StimulusLibrary>,
    player: Arc<PresentationPlayer>,
    camera: Arc<CameraService>,
    bus: Arc<FrameBus>,
    events: Arc<SidebandPublisher>,
    library_dir: PathBuf,
    sessions_dir: PathBuf,
    memory_budget_bytes: u64,
    inner: Mutex<Inner>,
    run_status: Arc<Mutex<RunStatus>>,
    emergency: Arc<AtomicBool>,
    generation_cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wire the orchestrator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Arc<ParameterStore>,
        library: Arc<StimulusLibrary>,
        player: Arc<PresentationPlayer>,
        camera: Arc<CameraService>,
        bus: Arc<FrameBus>,
        events: Arc<SidebandPublisher>,
        data_dir: PathBuf,
        memory_budget_bytes: u64,
    ) -> Self {
        Self {
            params,
            library,
            player,
            camera,
            bus,
            events,
            library_dir: data_dir.join("stimulus_library"),
            sessions_dir: data_dir.join("sessions"),
            memory_budget_bytes,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                worker: None,
                last_error: None,
            }),
            run_status: Arc::new(Mutex::new(RunStatus::default())),
            emergency: Arc::new(AtomicBool::new(false)),
            generation_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the parameter groups whose changes invalidate the
    /// stimulus library. Must be called once after construction.
    pub fn wire_parameter_subscriptions(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.params.subscribe("stimulus", "stimulus-library", move |_partial| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_library_parameters_changed();
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        self.params.subscribe("monitor", "stimulus-library", move |partial| {
            // Only the geometry/timing subset invalidates; selection-only
            // changes do not.
            let geometry_changed = partial
                .keys()
                .any(|k| stimulus::geometry::GEOMETRY_KEYS.contains(&k.as_str()));
            if !geometry_changed {
                return;
            }
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_library_parameters_changed();
            }
        });
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.lock_inner().phase
    }

    /// Process-wide emergency-stop flag, checked by long-running loops.
    pub fn emergency_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.emergency)
    }

    fn set_phase(&self, phase: Phase) {
        {
            let mut inner = self.lock_inner();
            if inner.phase == phase {
                return;
            }
            inner.phase = phase;
        }
        let status = lock_or_recover(&self.run_status).clone();
        self.events.publish(&event(
            "acquisition_progress",
            json!({
                "phase": phase,
                "direction": status.direction,
                "repetition": status.repetition,
            }),
        ));
    }

    /// Make the library ready for the current parameters, generating (with
    /// progress events) when needed. Blocking.
    pub fn ensure_library_ready(&self) -> IsiResult<()> {
        let geometry = MonitorGeometry::from_store(&self.params)?;
        let params = StimulusParams::from_store(&self.params)?;
        let expected = fingerprint(&geometry, &params);

        if self.library.status() == LibraryStatus::Ready
            && self.library.fingerprint().as_deref() == Some(expected.as_str())
        {
            return Ok(());
        }

        self.events.publish(&event("pregeneration_started", json!({})));
        self.generation_cancel.store(false, Ordering::Release);
        let started = Instant::now();
        let result = self.library.pregenerate(
            &geometry,
            &params,
            self.memory_budget_bytes,
            &self.generation_cancel,
        );

        match result {
            Ok(()) => {
                self.events.publish(&event(
                    "pregeneration_complete",
                    json!({ "elapsed_ms": started.elapsed().as_millis() as u64 }),
                ));
                // Auto-save is best effort; a save failure never fails
                // pre-generation.
                if let Err(err) =
                    stimulus::io::save_library(&self.library_dir, &self.library, &geometry, &params)
                {
                    warn!(error = %err, "stimulus library auto-save failed");
                }
                Ok(())
            }
            Err(err) => {
                self.events.publish(&event(
                    "pregeneration_failed",
                    json!({ "error": err.to_string() }),
                ));
                Err(err)
            }
        }
    }

    /// Load the on-disk library if its fingerprint matches the current
    /// parameters.
    pub fn load_library(&self) -> IsiResult<()> {
        let geometry = MonitorGeometry::from_store(&self.params)?;
        let params = StimulusParams::from_store(&self.params)?;
        let expected = fingerprint(&geometry, &params);

        let (print, directions) = stimulus::io::load_library(&self.library_dir, &expected)?;
        self.library.install(print, directions)?;
        info!("stimulus library loaded from disk");
        Ok(())
    }

    /// Save the in-memory library to disk.
    pub fn save_library(&self) -> IsiResult<()> {
        let geometry = MonitorGeometry::from_store(&self.params)?;
        let params = StimulusParams::from_store(&self.params)?;
        stimulus::io::save_library(&self.library_dir, &self.library, &geometry, &params)
    }

    /// Start preview: library ready, camera streaming, player running, no
    /// recorder.
    pub fn start_preview(&self, direction: Direction) -> IsiResult<()> {
        // PREVIEW and RECORD cannot overlap; starting one stops the other.
        if self.is_run_active() {
            self.stop_record();
        }

        self.ensure_library_ready()?;
        self.ensure_camera_streaming()?;

        let monitor_fps = self.params.get_f64("monitor", "refresh_rate_hz")?;
        self.player.start(direction, monitor_fps)?;
        self.set_phase(Phase::Preview);
        self.events.publish(&event(
            "preview_started",
            json!({ "direction": direction.as_str() }),
        ));
        Ok(())
    }

    /// Stop preview if running. Idempotent.
    pub fn stop_preview(&self) {
        if self.phase() != Phase::Preview {
            return;
        }
        self.player.stop();
        self.set_phase(Phase::Idle);
        self.events.publish(&event("preview_stopped", json!({})));
    }

    /// Start a recording session; returns the new session id.
    pub fn start_record(self: &Arc<Self>, payload: &Value) -> IsiResult<String> {
        if self.phase() == Phase::Preview {
            self.stop_preview();
        }
        if self.is_run_active() {
            return Err(IsiError::ValidationFailed(
                "a recording session is already active".into(),
            ));
        }

        self.ensure_library_ready()?;
        self.ensure_camera_streaming()?;

        let plan = SessionPlan::from_params(&self.params)?.merge_json(payload)?;
        let snapshot = self.params.snapshot_all();
        let geometry = MonitorGeometry::from_store(&self.params)?;
        let camera_fps = self.params.get_f64("camera", "fps")?;
        if camera_fps <= 0.0 {
            return Err(IsiError::ValidationFailed(
                "camera fps not detected".into(),
            ));
        }

        // Snapshot the sweeps so a mid-session library invalidation cannot
        // touch the in-flight session.
        let mut sweeps: BTreeMap<Direction, Arc<DirectionLibrary>> = BTreeMap::new();
        for direction in &plan.directions {
            let sweep = self
                .library
                .direction(*direction)
                .ok_or(IsiError::EmptyLibrary)?;
            sweeps.insert(*direction, sweep);
        }

        let timestamp_source = if self
            .params
            .get_bool("system", "development_mode")
            .unwrap_or(false)
        {
            "software_dev_mode"
        } else {
            "hardware"
        };

        let session = Session::create(&self.sessions_dir, plan, snapshot, timestamp_source)?;
        let session_id = session.id().to_string();

        {
            let mut status = lock_or_recover(&self.run_status);
            *status = RunStatus {
                session_id: Some(session_id.clone()),
                session_root: Some(session.root().display().to_string()),
                ..RunStatus::default()
            };
        }

        let shared = Arc::new(RecordShared {
            recorder: Mutex::new(None),
            phase: Mutex::new(RecordPhase::BaselineInitial),
            in_stimulus: AtomicBool::new(false),
            stim_frames_seen: AtomicU64::new(0),
            sweep_len: AtomicU64::new(0),
            camera_fps,
            monitor_fps: geometry.refresh_rate_hz,
        });

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = Arc::clone(&stop);
            let shared = Arc::clone(&shared);
            // The worker holds the orchestrator alive only while the thread
            // runs; the closure (and this Arc) drop when it exits.
            let this = Arc::clone(self);
            let geometry = geometry.clone();

            std::thread::Builder::new()
                .name("acquisition-run".into())
                .spawn(move || {
                    this.run_record_worker(session, sweeps, geometry, shared, stop);
                })
                .map_err(IsiError::Io)?
        };

        self.lock_inner().worker = Some(Worker {
            handle: worker,
            stop,
        });
        info!(session = %session_id, "recording session started");
        Ok(session_id)
    }

    /// Cooperatively cancel the active run and wait for it to flush.
    pub fn stop_record(&self) {
        let worker = self.lock_inner().worker.take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                error!("acquisition worker panicked during stop");
                self.set_phase(Phase::Idle);
            }
        }
        // The record worker resets the phase itself; the playback worker
        // does not.
        if self.phase() == Phase::Playback {
            self.set_phase(Phase::Idle);
        }
    }

    /// Replay a finished session's camera frames onto the camera channel.
    ///
    /// No camera, no recorder; the frames stream at the recorded cadence.
    pub fn start_playback(&self, payload: &Value) -> IsiResult<()> {
        if self.is_run_active() || self.phase() == Phase::Preview {
            return Err(IsiError::ValidationFailed(
                "cannot start playback while a run is active".into(),
            ));
        }

        // Playback owns the camera channel; the live capture loop must be
        // quiet (single writer per ring).
        self.camera.stop();

        let session_root = match payload.get("session_dir").and_then(|v| v.as_str()) {
            Some(dir) => PathBuf::from(dir),
            None => Session::latest(&self.sessions_dir).ok_or_else(|| {
                IsiError::ValidationFailed("no recorded session found".into())
            })?,
        };
        let direction = payload
            .get("direction")
            .and_then(|v| v.as_str())
            .unwrap_or("LR");
        let direction = Direction::parse(direction)
            .ok_or_else(|| IsiError::UnknownDirection(direction.to_string()))?;
        let trial = payload.get("trial").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let h5_path = session_root
            .join("acquisition")
            .join(format!("{direction}_trial_{trial:03}.h5"));
        let file = hdf5::File::open(&h5_path)?;
        let frames = file
            .dataset("frames")?
            .read_dyn::<u8>()?
            .into_dimensionality::<Ix3>()
            .map_err(|e| IsiError::ValidationFailed(format!("frames dataset shape: {e}")))?;
        let timestamps = file.dataset("timestamps_ns")?.read_1d::<u64>()?.to_vec();
        drop(file);

        let period = playback_period(&timestamps);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let bus = Arc::clone(&self.bus);
            let emergency = Arc::clone(&self.emergency);
            std::thread::Builder::new()
                .name("playback".into())
                .spawn(move || {
                    let n = frames.shape()[0];
                    let (h, w) = (frames.shape()[1] as u32, frames.shape()[2] as u32);
                    for i in 0..n {
                        if stop.load(Ordering::Acquire) || emergency.load(Ordering::Acquire) {
                            break;
                        }
                        let frame = frames.index_axis(ndarray::Axis(0), i);
                        let data = frame.to_owned().into_raw_vec();
                        let result = bus.write_camera_frame(
                            &data,
                            CameraFrameInfo {
                                capture_timestamp_ns: timestamps.get(i).copied().unwrap_or(0),
                                timestamp_source: "playback".to_string(),
                                exposure_us: 0.0,
                                gain: 0.0,
                                width: w,
                                height: h,
                                camera_name: "PLAYBACK".to_string(),
                            },
                        );
                        if let Err(err) = result {
                            warn!(error = %err, "playback publish failed");
                        }
                        std::thread::sleep(period);
                    }
                })
                .map_err(IsiError::Io)?
        };

        self.lock_inner().worker = Some(Worker { handle, stop });
        self.set_phase(Phase::Playback);
        Ok(())
    }

    /// Emergency stop: every component halts between operations; recorders
    /// flush and close; data is preserved.
    pub fn emergency_stop(&self) {
        warn!("emergency stop requested");
        self.emergency.store(true, Ordering::Release);
        self.generation_cancel.store(true, Ordering::Release);

        let worker = self.lock_inner().worker.take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
        self.player.stop();
        self.camera.stop();

        self.emergency.store(false, Ordering::Release);
        self.set_phase(Phase::Idle);
    }

    /// Full status for `get_acquisition_status`.
    pub fn status(&self) -> Value {
        let inner = self.lock_inner();
        let status = lock_or_recover(&self.run_status).clone();

        // Offer resume when the latest session on disk was interrupted.
        let resume = Session::latest(&self.sessions_dir)
            .and_then(|root| Session::load_state(&root).ok().map(|s| (root, s)))
            .filter(|(_, state)| state.interruption_point.is_some())
            .map(|(root, state): (PathBuf, SessionState)| {
                json!({
                    "session_dir": root.display().to_string(),
                    "session_id": state.session_id,
                    "interruption_point": state.interruption_point,
                    "directions_completed": state.directions_completed,
                })
            });

        json!({
            "phase": inner.phase,
            "library_status": self.library.status(),
            "library_fingerprint": self.library.fingerprint(),
            "camera_state": self.camera.state(),
            "camera_streaming": self.camera.is_streaming(),
            "player_playing": self.player.is_playing(),
            "run": status,
            "last_error": inner.last_error,
            "resume_available": resume,
        })
    }

    fn on_library_parameters_changed(&self) {
        if self.library.invalidate() {
            self.events.publish(&event("library_invalidated", json!({})));
            if self.phase() == Phase::Preview {
                self.stop_preview();
            }
            // An in-flight recording session keeps its snapshotted sweeps;
            // the event is delivered but the session continues.
        }
    }

    fn ensure_camera_streaming(&self) -> IsiResult<()> {
        if self.camera.is_streaming() {
            return Ok(());
        }
        if self.camera.state() != CameraState::Open
            && self.camera.state() != CameraState::Streaming
        {
            self.camera.open_selected()?;
        }
        self.camera.stop();
        self.camera.start()?;

        // Wait for the first frame (or a fast failure).
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if self.camera.is_streaming() {
                return Ok(());
            }
            if let Some(err) = self.camera.take_fatal_error() {
                return Err(err);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(IsiError::CaptureFailed(
            "camera produced no frames within 3 s".into(),
        ))
    }

    fn is_run_active(&self) -> bool {
        let mut inner = self.lock_inner();
        match inner.worker.as_ref() {
            Some(worker) if worker.handle.is_finished() => {
                if let Some(worker) = inner.worker.take() {
                    let _ = worker.handle.join();
                }
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        lock_or_recover(&self.inner)
    }

    fn run_record_worker(
        &self,
        mut session: Session,
        sweeps: BTreeMap<Direction, Arc<DirectionLibrary>>,
        geometry: MonitorGeometry,
        shared: Arc<RecordShared>,
        stop: Arc<AtomicBool>,
    ) {
        let outcome = record_run(self, &mut session, &sweeps, &geometry, &shared, &stop);

        // Whatever happened, tear down the taps and the player.
        self.player.set_event_sink(None);
        self.camera.set_frame_sink(None);
        self.player.stop();

        // Close any recorder still open, preserving its data, and persist
        // how far the session got.
        let session_status = match &outcome {
            RunOutcome::Fatal(_) => SessionStatus::Error,
            _ => SessionStatus::Interrupted,
        };
        let leftover = lock_or_recover(&shared.recorder).take();
        if let Some(recorder) = leftover {
            let frames = recorder.frames_written();
            let last_ts = recorder.last_timestamp_ns();
            if let Err(err) = recorder.close(false) {
                error!(error = %err, "failed to close recorder after interruption");
            }
            let status = lock_or_recover(&self.run_status).clone();
            let point = InterruptionPoint {
                direction: status.direction.unwrap_or_default(),
                repetition: status.repetition.unwrap_or(0),
                frames_captured: frames,
                last_camera_timestamp_ns: last_ts,
            };
            if let Err(err) = session.set_interruption(session_status, point) {
                error!(error = %err, "failed to persist interruption point");
            }
        } else if !matches!(outcome, RunOutcome::Complete) {
            if let Err(err) = session.set_status(session_status) {
                error!(error = %err, "failed to persist session status");
            }
        }

        match outcome {
            RunOutcome::Complete => {
                if let Err(err) = session.set_status(SessionStatus::Complete) {
                    error!(error = %err, "failed to persist session completion");
                }
                self.set_phase(Phase::Complete);
                self.events.publish(&event(
                    "acquisition_progress",
                    json!({
                        "phase": Phase::Complete,
                        "session_id": session.id(),
                        "directions_completed": session.state().directions_completed,
                    }),
                ));
                info!(session = %session.id(), "recording session complete");
            }
            RunOutcome::Stopped => {
                self.set_phase(Phase::Idle);
                info!(session = %session.id(), "recording session stopped by user");
            }
            RunOutcome::Fatal(err) => {
                self.lock_inner().last_error = Some(err.clone());
                self.set_phase(Phase::Error);
                self.events
                    .publish(&event("acquisition_error", json!({ "error": err })));

                // Recovery: re-initialize the camera stream, then rest at
                // IDLE with data preserved.
                self.set_phase(Phase::Recovery);
                self.camera.stop();
                match self.camera.start() {
                    Ok(()) => info!("camera re-initialized after error"),
                    Err(err) => warn!(error = %err, "camera re-initialization failed"),
                }
                self.set_phase(Phase::Idle);
            }
        }
    }
}

enum RunOutcome {
    Complete,
    Stopped,
    Fatal(String),
}

fn record_run(
    orchestrator: &Orchestrator,
    session: &mut Session,
    sweeps: &BTreeMap<Direction, Arc<DirectionLibrary>>,
    geometry: &MonitorGeometry,
    shared: &Arc<RecordShared>,
    stop: &Arc<AtomicBool>,
) -> RunOutcome {
    let player = &orchestrator.player;
    let camera = &orchestrator.camera;
    let emergency = &orchestrator.emergency;
    let run_status = &orchestrator.run_status;
    let plan = session.plan().clone();
    let background = session
        .parameters()
        .get("stimulus")
        .and_then(|g| g.get("background_luminance"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5);
    let timestamp_source = if orchestrator
        .params
        .get_bool("system", "development_mode")
        .unwrap_or(false)
    {
        "software_dev_mode"
    } else {
        "hardware"
    };

    // Install the camera tap: recorder first, publish after (the service
    // guarantees that ordering).
    {
        let shared = Arc::clone(shared);
        let run_status = Arc::clone(run_status);
        camera.set_frame_sink(Some(Arc::new(move |record: &CameraFrameRecord<'_>| {
            let stimulus_index = shared.stimulus_index_for_next_camera_frame();
            let phase = *lock_or_recover(&shared.phase);
            let mut guard = lock_or_recover(&shared.recorder);
            if let Some(recorder) = guard.as_mut() {
                recorder.write_camera_frame(record, stimulus_index, phase)?;
                lock_or_recover(&run_status).frames_captured = recorder.frames_written();
            }
            Ok(())
        })));
    }

    // Install the player tap: each display event goes to the open recorder.
    {
        let shared = Arc::clone(shared);
        player.set_event_sink(Some(Arc::new(move |display_event| {
            let mut guard = lock_or_recover(&shared.recorder);
            if let Some(recorder) = guard.as_mut() {
                recorder.write_stimulus_event(display_event.clone());
            }
        })));
    }

    fn open_recorder(
        session: &Session,
        direction: Direction,
        trial: u32,
        timestamp_source: &str,
    ) -> IsiResult<TrialRecorder> {
        TrialRecorder::create(
            &session.trial_h5_path(direction, trial),
            &session.trial_events_path(direction, trial),
            session.id(),
            direction.as_str(),
            trial,
            session.parameters().clone(),
            timestamp_source,
        )
    }

    let set_record_phase = |phase: RecordPhase| {
        *lock_or_recover(&shared.phase) = phase;
    };
    let set_direction = |direction: Option<Direction>, repetition: Option<u32>| {
        let mut status = lock_or_recover(run_status);
        status.direction = direction.map(|d| d.to_string());
        status.repetition = repetition;
    };

    let check_fatal = || -> Option<String> {
        if let Some(err) = camera.take_fatal_error() {
            return Some(err.to_string());
        }
        if let Some(err) = player.take_fatal_error() {
            return Some(err.to_string());
        }
        None
    };

    // Cooperative wait returning early on stop/emergency/fatal.
    let wait = |duration: Duration, done: &dyn Fn() -> bool| -> Result<(), RunOutcome> {
        let deadline = Instant::now() + duration;
        loop {
            if stop.load(Ordering::Acquire) || emergency.load(Ordering::Acquire) {
                return Err(RunOutcome::Stopped);
            }
            if let Some(err) = check_fatal() {
                return Err(RunOutcome::Fatal(err));
            }
            if done() || Instant::now() >= deadline {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    };
    let no_early_exit = || false;

    let directions = plan.directions.clone();
    let baseline = Duration::from_secs_f64(plan.baseline_sec.max(0.0));
    let inter_trial = Duration::from_secs_f64(plan.inter_trial_sec.max(0.0));

    macro_rules! run_step {
        ($expr:expr) => {
            match $expr {
                Ok(v) => v,
                Err(err) => return RunOutcome::Fatal(err.to_string()),
            }
        };
    }

    // BASELINE_INITIAL: the first trial's recorder captures it.
    orchestrator.set_phase(Phase::BaselineInitial);
    set_record_phase(RecordPhase::BaselineInitial);
    set_direction(Some(directions[0]), Some(0));
    *lock_or_recover(&shared.recorder) = Some(run_step!(open_recorder(session, directions[0], 0, timestamp_source)));
    run_step!(player.display_baseline(geometry.width_px, geometry.height_px, background));
    if let Err(outcome) = wait(baseline, &no_early_exit) {
        return outcome;
    }

    for (dir_index, &direction) in directions.iter().enumerate() {
        let sweep = match sweeps.get(&direction) {
            Some(s) => Arc::clone(s),
            None => return RunOutcome::Fatal("missing sweep snapshot".into()),
        };

        for repetition in 0..plan.repetitions {
            // Recorders are opened lazily: the first one exists already,
            // later ones are created at the phase boundary that precedes
            // their first frame.
            if lock_or_recover(&shared.recorder).is_none() {
                *lock_or_recover(&shared.recorder) =
                    Some(run_step!(open_recorder(session, direction, repetition, timestamp_source)));
            }
            set_direction(Some(direction), Some(repetition));

            orchestrator.set_phase(Phase::Stimulus);
            set_record_phase(RecordPhase::Stimulus);
            shared.sweep_len.store(sweep.len() as u64, Ordering::Release);
            shared.stim_frames_seen.store(0, Ordering::Release);
            shared.in_stimulus.store(true, Ordering::Release);

            run_step!(player.start_sweep(direction, Arc::clone(&sweep), geometry.refresh_rate_hz));

            let sweep_duration =
                Duration::from_secs_f64(sweep.len() as f64 / geometry.refresh_rate_hz + 1.0);
            let done = || player.sweep_complete();
            let result = wait(sweep_duration, &done);
            shared.in_stimulus.store(false, Ordering::Release);
            player.stop();
            if let Err(outcome) = result {
                return outcome;
            }

            let is_last_rep = repetition + 1 == plan.repetitions;
            if !is_last_rep {
                // Repeat loop: next repetition of the same direction gets
                // its own trial file, no inter-trial in between.
                let recorder = lock_or_recover(&shared.recorder).take();
                if let Some(recorder) = recorder {
                    run_step!(recorder.close(true));
                }
            }
        }

        run_step!(session.mark_direction_completed(direction));
        {
            let mut status = lock_or_recover(run_status);
            status.directions_completed.push(direction.to_string());
        }

        let is_last_direction = dir_index + 1 == directions.len();
        if !is_last_direction {
            // INTER_TRIAL: the next direction's recorder captures it.
            orchestrator.set_phase(Phase::InterTrial);
            set_record_phase(RecordPhase::InterTrial);
            let recorder = lock_or_recover(&shared.recorder).take();
            if let Some(recorder) = recorder {
                run_step!(recorder.close(true));
            }
            let next = directions[dir_index + 1];
            *lock_or_recover(&shared.recorder) = Some(run_step!(open_recorder(session, next, 0, timestamp_source)));
            set_direction(Some(next), Some(0));

            run_step!(player.display_baseline(geometry.width_px, geometry.height_px, background));
            if let Err(outcome) = wait(inter_trial, &no_early_exit) {
                return outcome;
            }
        }
    }

    // BASELINE_FINAL: captured by the last trial's recorder.
    orchestrator.set_phase(Phase::BaselineFinal);
    set_record_phase(RecordPhase::BaselineFinal);
    run_step!(player.display_baseline(geometry.width_px, geometry.height_px, background));
    if let Err(outcome) = wait(baseline, &no_early_exit) {
        return outcome;
    }

    let recorder = lock_or_recover(&shared.recorder).take();
    if let Some(recorder) = recorder {
        run_step!(recorder.close(true));
    }
    RunOutcome::Complete
}

fn playback_period(timestamps: &[u64]) -> Duration {
    if timestamps.len() >= 2 {
        let span = timestamps[timestamps.len() - 1].saturating_sub(timestamps[0]);
        let mean = span / (timestamps.len() as u64 - 1);
        if mean > 0 {
            return Duration::from_nanos(mean);
        }
    }
    Duration::from_millis(33)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
