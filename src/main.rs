//! Backend entry point.
//!
//! Parses the CLI, initializes tracing, builds the composition root, and
//! blocks until a `shutdown` command arrives on the control channel. The
//! recognized environment variables are `ISI_LOG` / `RUST_LOG` (log filter)
//! and `ISI_DEV_MODE` (development-mode override); nothing else in the
//! environment affects behavior.

use anyhow::Result;
use clap::Parser;
use isi_daq::{Backend, BackendConfig};
use std::path::PathBuf;

/// Acquisition backend for the ISI macroscope.
#[derive(Parser, Debug)]
#[command(name = "isi-backend", version, about)]
struct Args {
    /// Root of the persistent data tree.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Parameter file path.
    #[arg(long, default_value = "config/isi_parameters.json")]
    config: PathBuf,

    /// Control channel port.
    #[arg(long, default_value_t = 5555)]
    control_port: u16,

    /// Event channel port.
    #[arg(long, default_value_t = 5556)]
    event_port: u16,

    /// Stimulus sideband port.
    #[arg(long, default_value_t = 5557)]
    stimulus_port: u16,

    /// Camera sideband port.
    #[arg(long, default_value_t = 5558)]
    camera_port: u16,

    /// Enable development mode (software timestamps permitted, tagged).
    #[arg(long)]
    dev_mode: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_dev_mode = std::env::var("ISI_DEV_MODE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let dev_mode = args.dev_mode || env_dev_mode;

    isi_daq::logging::init("info", dev_mode);

    let backend = Backend::build(BackendConfig {
        data_dir: args.data_dir,
        config_path: args.config,
        control_port: args.control_port,
        event_port: args.event_port,
        stimulus_port: args.stimulus_port,
        camera_port: args.camera_port,
        dev_mode: dev_mode.then_some(true),
        ..BackendConfig::default()
    })?;

    backend.run();
    Ok(())
}
