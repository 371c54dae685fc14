//! Startup requirements and the cross-process bring-up handshake.
//!
//! The handshake defeats the publish-before-subscribe race: publishers do
//! not start until every subscriber has proven it is receiving. Sequence:
//!
//! 1. Backend initializes services and validates system requirements.
//! 2. Backend binds the control, event, and sideband sockets and creates
//!    the shared-memory rings.
//! 3. Each control connection is greeted with `transport_ready` + ports.
//! 4. Renderer subscribes to the event channel and both frame sidebands.
//! 5. Renderer sends `shared_memory_readers_ready`.
//! 6. Backend publishes a sentinel frame (`camera_name: "TEST"`) on the
//!    camera sideband.
//! 7. Renderer receives the sentinel and sends `camera_subscriber_confirmed`;
//!    only now does the backend start the camera capture loop.
//! 8. Backend broadcasts `system_state: ready`; the renderer unlocks its UI.
//!
//! There are no fixed delays anywhere in this sequence, and no timeouts on
//! the control channel: a missing confirmation keeps the system visibly in
//! `waiting_frontend` instead of silently dropping frames.

use crate::bus::{FrameBus, SidebandPublisher};
use crate::camera::CameraService;
use crate::control::protocol::event;
use crate::error::{IsiError, IsiResult};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Backend lifecycle state as broadcast on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Services constructed, transport not yet confirmed.
    WaitingFrontend,
    /// Handshake complete; publishers running.
    Ready,
    /// Startup failed.
    Error,
}

/// Validate system requirements before any service starts.
///
/// The data directory must be creatable and writable; the shared-memory
/// directory likewise. Failures abort startup with a clear error instead of
/// failing later mid-acquisition.
pub fn check_system_requirements(data_dir: &Path) -> IsiResult<()> {
    for sub in ["runtime", "sessions", "stimulus_library"] {
        let dir = data_dir.join(sub);
        std::fs::create_dir_all(&dir)?;
        let probe = dir.join(".write_probe");
        std::fs::write(&probe, b"probe")
            .map_err(|e| IsiError::Io(e))
            .and_then(|_| std::fs::remove_file(&probe).map_err(IsiError::Io))
            .map_err(|e| {
                IsiError::ValidationFailed(format!(
                    "data directory {} is not writable: {e}",
                    dir.display()
                ))
            })?;
    }
    Ok(())
}

/// Tracks handshake progress and gates the camera start.
pub struct StartupCoordinator {
    bus: Arc<FrameBus>,
    camera: Arc<CameraService>,
    events: Arc<SidebandPublisher>,
    readers_ready: AtomicBool,
    camera_confirmed: AtomicBool,
    state: Mutex<SystemState>,
}

impl StartupCoordinator {
    /// Coordinator in `waiting_frontend`.
    pub fn new(
        bus: Arc<FrameBus>,
        camera: Arc<CameraService>,
        events: Arc<SidebandPublisher>,
    ) -> Self {
        Self {
            bus,
            camera,
            events,
            readers_ready: AtomicBool::new(false),
            camera_confirmed: AtomicBool::new(false),
            state: Mutex::new(SystemState::WaitingFrontend),
        }
    }

    /// Current state.
    pub fn state(&self) -> SystemState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    /// Handle `shared_memory_readers_ready`: prove the camera sideband path
    /// works by publishing the sentinel frame.
    pub fn on_readers_ready(&self) -> IsiResult<()> {
        self.readers_ready.store(true, Ordering::Release);
        let meta = self.bus.publish_sentinel()?;
        info!(frame_id = meta.frame_id, "handshake sentinel published");
        Ok(())
    }

    /// Handle `camera_subscriber_confirmed`: start the capture loop (when a
    /// camera is selected) and broadcast `ready`.
    pub fn on_camera_confirmed(&self) -> IsiResult<()> {
        if !self.readers_ready.load(Ordering::Acquire) {
            return Err(IsiError::SubscriberNotReady(
                "camera_subscriber_confirmed before shared_memory_readers_ready".into(),
            ));
        }
        self.camera_confirmed.store(true, Ordering::Release);

        // Cameras may legitimately be unselected at bring-up; preview and
        // record will start the loop later. A selected camera starts now.
        match self.camera.open_selected().and_then(|_| self.camera.start()) {
            Ok(()) => info!("camera capture loop started after handshake"),
            Err(IsiError::NoCameraSelected) => {
                info!("no camera selected at handshake; capture deferred")
            }
            Err(err) => warn!(error = %err, "camera start after handshake failed"),
        }

        self.set_state(SystemState::Ready);
        Ok(())
    }

    /// Whether the full handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.state() == SystemState::Ready
    }

    fn set_state(&self, state: SystemState) {
        {
            let mut guard = match self.state.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            *guard = state;
        }
        self.events
            .publish(&event("system_state", json!({ "state": state })));
        info!(?state, "system state changed");
    }
}
