//! Composition root.
//!
//! Every component is constructed here with its dependencies passed in
//! explicitly: no registries, no service locators, no globals. The command
//! dispatcher is likewise a plain map built in [`build_dispatcher`], with
//! each handler closing over exactly the services it needs.

use crate::bus::{FrameBus, FrameBusConfig, SidebandPublisher};
use crate::camera::{CameraService, MockBackend};
use crate::control::{
    error_reply, ok_reply, ChannelPorts, CommandDispatcher, ControlServer,
};
use crate::error::{IsiError, IsiResult};
use crate::health::HealthSampler;
use crate::orchestrator::Orchestrator;
use crate::params::{standard_descriptors, ParamMap, ParamValue, ParameterStore};
use crate::player::PresentationPlayer;
use crate::startup::{check_system_requirements, StartupCoordinator};
use crate::stimulus::{Direction, StimulusLibrary};
use crate::sync_log::SyncTracker;
use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Everything the backend needs to come up.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Root of the persistent data tree.
    pub data_dir: PathBuf,
    /// Path of the parameter file.
    pub config_path: PathBuf,
    /// Control channel port (0 for ephemeral).
    pub control_port: u16,
    /// Event channel port (0 for ephemeral).
    pub event_port: u16,
    /// Stimulus sideband port (0 for ephemeral).
    pub stimulus_port: u16,
    /// Camera sideband port (0 for ephemeral).
    pub camera_port: u16,
    /// Development-mode override applied to the parameter store at startup.
    pub dev_mode: Option<bool>,
    /// Budget for in-memory stimulus frames.
    pub memory_budget_bytes: u64,
    /// Frame ring slot size.
    pub slot_bytes: usize,
    /// Frame ring slot count.
    pub slot_count: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            config_path: PathBuf::from("config/isi_parameters.json"),
            control_port: 5555,
            event_port: 5556,
            stimulus_port: 5557,
            camera_port: 5558,
            dev_mode: None,
            memory_budget_bytes: 16 * 1024 * 1024 * 1024,
            slot_bytes: 8 * 1024 * 1024,
            slot_count: 16,
        }
    }
}

/// The assembled backend.
pub struct Backend {
    /// Parameter store (single source of truth).
    pub params: Arc<ParameterStore>,
    /// Frame bus.
    pub bus: Arc<FrameBus>,
    /// Event broadcast channel.
    pub events: Arc<SidebandPublisher>,
    /// Stimulus library.
    pub library: Arc<StimulusLibrary>,
    /// Presentation player.
    pub player: Arc<PresentationPlayer>,
    /// Camera service.
    pub camera: Arc<CameraService>,
    /// Timing log.
    pub sync: Arc<SyncTracker>,
    /// Acquisition orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// Handshake coordinator.
    pub startup: Arc<StartupCoordinator>,
    /// Control server.
    pub control: ControlServer,
    health: Mutex<Option<HealthSampler>>,
    shutdown_rx: Receiver<()>,
}

impl Backend {
    /// Construct and wire every component, bind all channels, and start the
    /// health sampler. The camera capture loop stays off until the
    /// handshake confirms a subscriber.
    pub fn build(config: BackendConfig) -> anyhow::Result<Arc<Backend>> {
        check_system_requirements(&config.data_dir).context("system requirements check")?;

        let params = Arc::new(
            ParameterStore::new(&config.config_path, standard_descriptors())
                .context("parameter store")?,
        );
        if let Some(dev_mode) = config.dev_mode {
            let mut partial = ParamMap::new();
            partial.insert("development_mode".into(), ParamValue::Bool(dev_mode));
            params
                .update("system", partial)
                .context("development-mode override")?;
        }
        let dev_mode = params.get_bool("system", "development_mode").unwrap_or(false);

        let bus = Arc::new(
            FrameBus::new(&FrameBusConfig {
                shm_dir: config.data_dir.join("runtime"),
                stimulus_slot_bytes: config.slot_bytes,
                camera_slot_bytes: config.slot_bytes,
                slot_count: config.slot_count,
                stimulus_port: config.stimulus_port,
                camera_port: config.camera_port,
            })
            .context("frame bus")?,
        );
        let events = Arc::new(SidebandPublisher::bind("event", config.event_port)?);
        let sync = Arc::new(SyncTracker::default());
        let library = Arc::new(StimulusLibrary::new());
        let player = Arc::new(PresentationPlayer::new(
            Arc::clone(&library),
            Arc::clone(&bus),
            Arc::clone(&sync),
        ));

        // The in-tree driver is the synthetic mock; vendor drivers slot in
        // behind the same CameraBackend trait.
        let camera = Arc::new(CameraService::new(
            Box::new(MockBackend::new(1, 640, 480, 30.0, true)),
            Arc::clone(&params),
            Arc::clone(&bus),
            Arc::clone(&sync),
            Some(Arc::clone(&events)),
        ));

        // Hardware detection: volatile groups updated in memory only.
        if let Err(err) = camera.detect() {
            warn!(error = %err, "camera detection failed at startup");
        }
        detect_displays(&params, dev_mode)?;

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&params),
            Arc::clone(&library),
            Arc::clone(&player),
            Arc::clone(&camera),
            Arc::clone(&bus),
            Arc::clone(&events),
            config.data_dir.clone(),
            config.memory_budget_bytes,
        ));
        orchestrator.wire_parameter_subscriptions();

        let startup = Arc::new(StartupCoordinator::new(
            Arc::clone(&bus),
            Arc::clone(&camera),
            Arc::clone(&events),
        ));

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let dispatcher = build_dispatcher(
            Arc::clone(&params),
            Arc::clone(&camera),
            Arc::clone(&orchestrator),
            Arc::clone(&startup),
            shutdown_tx,
        );

        let control = ControlServer::bind(
            config.control_port,
            Arc::new(dispatcher),
            ChannelPorts {
                control: 0, // filled per-connection by the server
                event: events.port(),
                stimulus: bus.stimulus_port(),
                camera: bus.camera_port(),
            },
        )
        .context("control server")?;

        let backend = Arc::new(Backend {
            params,
            bus,
            events,
            library,
            player,
            camera,
            sync,
            orchestrator,
            startup,
            control,
            health: Mutex::new(None),
            shutdown_rx,
        });

        let sampler = HealthSampler::spawn(
            Arc::clone(&backend.events),
            Arc::clone(&backend.bus),
            Arc::clone(&backend.camera),
            Arc::clone(&backend.orchestrator),
            Arc::clone(&backend.startup),
            Arc::clone(&backend.sync),
        )
        .context("health sampler")?;
        if let Ok(mut slot) = backend.health.lock() {
            *slot = Some(sampler);
        }

        info!(
            control = backend.control.port(),
            event = backend.events.port(),
            stimulus = backend.bus.stimulus_port(),
            camera = backend.bus.camera_port(),
            "backend channels bound"
        );
        Ok(backend)
    }

    /// Block until a `shutdown` command arrives, then tear down.
    pub fn run(&self) {
        let _ = self.shutdown_rx.recv();
        info!("shutdown requested");
        self.shutdown();
    }

    /// Orderly teardown; safe to call more than once.
    pub fn shutdown(&self) {
        self.orchestrator.stop_record();
        self.player.stop();
        self.camera.close();
        if let Ok(mut slot) = self.health.lock() {
            if let Some(mut sampler) = slot.take() {
                sampler.shutdown();
            }
        }
        if let Err(err) = self.params.save() {
            warn!(error = %err, "final parameter save failed");
        }
        self.control.shutdown();
        self.events.shutdown();
    }
}

/// Populate the volatile `monitor` group.
///
/// Display enumeration is delegated to the platform layer in production; in
/// development mode a virtual display is published so the full pipeline can
/// run headless.
fn detect_displays(params: &ParameterStore, dev_mode: bool) -> IsiResult<()> {
    if !dev_mode {
        info!("display detection delegated to platform layer (monitor group at sentinels)");
        return Ok(());
    }
    let mut partial = ParamMap::new();
    partial.insert("width_px".into(), ParamValue::Int(1920));
    partial.insert("height_px".into(), ParamValue::Int(1080));
    partial.insert("refresh_rate_hz".into(), ParamValue::Float(60.0));
    partial.insert(
        "available_monitors".into(),
        ParamValue::StrArray(vec!["virtual-0".into()]),
    );
    params.update("monitor", partial)?;
    info!("virtual display published (development mode)");
    Ok(())
}

/// The explicit command map: every command surface entry, one closure each.
pub fn build_dispatcher(
    params: Arc<ParameterStore>,
    camera: Arc<CameraService>,
    orchestrator: Arc<Orchestrator>,
    startup: Arc<StartupCoordinator>,
    shutdown_tx: Sender<()>,
) -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();

    dispatcher.register("ping", |_| ok_reply(json!({ "pong": true })));

    {
        let params = Arc::clone(&params);
        dispatcher.register("get_parameters", move |_| {
            ok_reply(json!({ "parameters": params.snapshot_all() }))
        });
    }

    {
        let params = Arc::clone(&params);
        dispatcher.register("update_parameters", move |command| {
            reply_of(update_parameters(&params, command))
        });
    }

    {
        let camera = Arc::clone(&camera);
        dispatcher.register("detect_cameras", move |_| {
            reply_of(
                camera
                    .detect()
                    .map(|cameras| ok_reply(json!({ "cameras": cameras }))),
            )
        });
    }

    {
        let params = Arc::clone(&params);
        let camera = Arc::clone(&camera);
        dispatcher.register("select_camera", move |command| {
            let name = command.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let mut partial = ParamMap::new();
            partial.insert("selected_camera".into(), ParamValue::Str(name.into()));
            let result = params
                .update_from_frontend("camera", partial)
                .map(|_| {
                    // Release any previously open device; the next preview
                    // or record opens the new selection.
                    camera.close();
                    ok_reply(json!({ "selected": name }))
                });
            reply_of(result)
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("start_preview", move |command| {
            let result = parse_direction(command)
                .and_then(|direction| orchestrator.start_preview(direction))
                .map(|_| ok_reply(json!({})));
            reply_of(result)
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("stop_preview", move |_| {
            orchestrator.stop_preview();
            ok_reply(json!({}))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("start_record", move |command| {
            reply_of(
                orchestrator
                    .start_record(command)
                    .map(|session_id| ok_reply(json!({ "session_id": session_id }))),
            )
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("stop_record", move |_| {
            orchestrator.stop_record();
            ok_reply(json!({}))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("pregenerate_stimulus", move |_| {
            reply_of(orchestrator.ensure_library_ready().map(|_| {
                ok_reply(json!({}))
            }))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("load_library", move |_| {
            reply_of(orchestrator.load_library().map(|_| ok_reply(json!({}))))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("save_library", move |_| {
            reply_of(orchestrator.save_library().map(|_| ok_reply(json!({}))))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("get_acquisition_status", move |_| {
            ok_reply(json!({ "status": orchestrator.status() }))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("start_playback", move |command| {
            reply_of(orchestrator.start_playback(command).map(|_| ok_reply(json!({}))))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("stop_playback", move |_| {
            orchestrator.stop_record();
            ok_reply(json!({}))
        });
    }

    {
        let orchestrator = Arc::clone(&orchestrator);
        dispatcher.register("emergency_stop", move |_| {
            orchestrator.emergency_stop();
            ok_reply(json!({}))
        });
    }

    {
        let startup = Arc::clone(&startup);
        dispatcher.register("shared_memory_readers_ready", move |_| {
            reply_of(startup.on_readers_ready().map(|_| ok_reply(json!({}))))
        });
    }

    {
        let startup = Arc::clone(&startup);
        dispatcher.register("camera_subscriber_confirmed", move |_| {
            reply_of(startup.on_camera_confirmed().map(|_| ok_reply(json!({}))))
        });
    }

    dispatcher.register("shutdown", move |_| {
        let _ = shutdown_tx.try_send(());
        ok_reply(json!({}))
    });

    dispatcher
}

fn reply_of(result: IsiResult<Value>) -> Value {
    match result {
        Ok(reply) => reply,
        Err(err) => error_reply(err),
    }
}

fn parse_direction(command: &Value) -> IsiResult<Direction> {
    let raw = command
        .get("direction")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    Direction::parse(raw).ok_or_else(|| IsiError::UnknownDirection(raw.to_string()))
}

fn update_parameters(params: &ParameterStore, command: &Value) -> IsiResult<Value> {
    let group = command
        .get("group")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IsiError::ValidationFailed("missing 'group'".into()))?;
    let partial: ParamMap = serde_json::from_value(
        command
            .get("parameters")
            .cloned()
            .ok_or_else(|| IsiError::ValidationFailed("missing 'parameters'".into()))?,
    )?;
    params.update_from_frontend(group, partial)?;
    Ok(ok_reply(json!({ "group": group })))
}
