//! Periodic health and sync broadcasts.
//!
//! A small sampler thread publishes two messages on the event channel once
//! per second: a health snapshot (system state, camera streaming, player
//! activity, ring write counters, orchestrator phase) and a sync message
//! carrying the tail of both timing streams for real-time stimulus/camera
//! correlation in the renderer. Stale samples are simply dropped by the
//! lossy event channel; the full streams stay in the tracker for post hoc
//! use.

use crate::bus::{FrameBus, SidebandPublisher};
use crate::camera::CameraService;
use crate::control::protocol::event;
use crate::orchestrator::Orchestrator;
use crate::startup::StartupCoordinator;
use crate::sync_log::SyncTracker;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Sampling interval.
const INTERVAL: Duration = Duration::from_secs(1);

/// Events of each stream included in a sync broadcast.
const SYNC_TAIL: usize = 20;

/// Handle to the running sampler thread.
pub struct HealthSampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthSampler {
    /// Spawn the sampler.
    pub fn spawn(
        events: Arc<SidebandPublisher>,
        bus: Arc<FrameBus>,
        camera: Arc<CameraService>,
        orchestrator: Arc<Orchestrator>,
        startup: Arc<StartupCoordinator>,
        sync: Arc<SyncTracker>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("health-sampler".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        events.publish(&event(
                            "health",
                            json!({
                                "system_state": startup.state(),
                                "phase": orchestrator.phase(),
                                "camera_streaming": camera.is_streaming(),
                                "camera_state": camera.state(),
                                "stimulus_frames_written": bus.stimulus_frames_written(),
                                "camera_frames_written": bus.camera_frames_written(),
                            }),
                        ));

                        let snapshot = sync.snapshot();
                        let stimulus_tail =
                            &snapshot.stimulus[snapshot.stimulus.len().saturating_sub(SYNC_TAIL)..];
                        let camera_tail =
                            &snapshot.camera[snapshot.camera.len().saturating_sub(SYNC_TAIL)..];
                        events.publish(&event(
                            "sync",
                            json!({
                                "stimulus": stimulus_tail,
                                "camera": camera_tail,
                            }),
                        ));
                        // Stop-aware sleep.
                        let mut remaining = INTERVAL;
                        while remaining > Duration::ZERO && !stop.load(Ordering::Acquire) {
                            let chunk = remaining.min(Duration::from_millis(100));
                            std::thread::sleep(chunk);
                            remaining = remaining.saturating_sub(chunk);
                        }
                    }
                })?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the sampler and join its thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("health sampler panicked during shutdown");
            }
        }
    }
}

impl Drop for HealthSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
