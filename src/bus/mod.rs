//! The frame bus: two shared-memory frame channels plus their sidebands.
//!
//! The presentation player writes the stimulus channel; the camera service
//! writes the camera channel. There is never more than one writer per
//! channel, which keeps the rings coordination-free. Each written frame is
//! announced on the channel's sideband as a JSON metadata record carrying
//! the shared-memory location of the payload; consumers read the payload
//! directly from the mapped file.
//!
//! The wire format is single-channel grayscale `u8`, C-contiguous. Consumers
//! that want RGBA expand on their side; `channels` is always present in the
//! metadata so the payload stays self-describing.

pub mod ring;
pub mod sideband;

pub use ring::{FrameRing, FrameSlot};
pub use sideband::SidebandPublisher;

use crate::error::{IsiError, IsiResult};
use crate::timebase::wall_clock_ns;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

/// Direction tag used for baseline frames on the stimulus channel.
pub const BASELINE_DIRECTION: &str = "baseline";

/// Camera name used for the handshake sentinel frame.
pub const SENTINEL_CAMERA_NAME: &str = "TEST";

/// Sizing and transport configuration of the frame bus.
#[derive(Debug, Clone)]
pub struct FrameBusConfig {
    /// Directory holding the mapped ring files.
    pub shm_dir: PathBuf,
    /// Slot size of the stimulus ring in bytes (one full monitor frame).
    pub stimulus_slot_bytes: usize,
    /// Slot size of the camera ring in bytes (one full camera frame).
    pub camera_slot_bytes: usize,
    /// Slots per ring.
    pub slot_count: usize,
    /// Stimulus sideband TCP port (0 for ephemeral).
    pub stimulus_port: u16,
    /// Camera sideband TCP port (0 for ephemeral).
    pub camera_port: u16,
}

impl Default for FrameBusConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from("data/runtime"),
            stimulus_slot_bytes: 8 * 1024 * 1024,
            camera_slot_bytes: 8 * 1024 * 1024,
            slot_count: 16,
            stimulus_port: 5557,
            camera_port: 5558,
        }
    }
}

/// Metadata record announced for each stimulus frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusFrameMeta {
    /// Ring-assigned monotonic id.
    pub frame_id: u64,
    /// Index of the frame within its direction's sweep.
    pub frame_index: u64,
    /// Sweep direction, or `"baseline"`.
    pub direction: String,
    /// Bar-center angle shown in this frame, degrees.
    pub angle_degrees: f64,
    /// Wall-clock publish time, nanoseconds.
    pub publish_timestamp_ns: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Channel count of the payload (always 1 on the wire).
    pub channels: u8,
    /// Payload length in bytes.
    pub data_size_bytes: u64,
    /// Payload offset within the shared-memory file.
    pub offset_bytes: u64,
    /// Path of the shared-memory file.
    pub shm_path: String,
}

/// Metadata record announced for each camera frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraFrameMeta {
    /// Ring-assigned monotonic id.
    pub frame_id: u64,
    /// Capture timestamp, nanoseconds.
    pub capture_timestamp_ns: u64,
    /// Where the timestamp came from: `"hardware"` or `"software_dev_mode"`.
    pub timestamp_source: String,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Analog gain.
    pub gain: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Channel count of the payload (always 1 on the wire).
    pub channels: u8,
    /// Payload length in bytes.
    pub data_size_bytes: u64,
    /// Payload offset within the shared-memory file.
    pub offset_bytes: u64,
    /// Path of the shared-memory file.
    pub shm_path: String,
    /// Name of the producing camera.
    pub camera_name: String,
}

/// Caller-supplied portion of a stimulus frame publication.
#[derive(Debug, Clone)]
pub struct StimulusFrameInfo {
    /// Index within the direction's sweep.
    pub frame_index: u64,
    /// Direction tag.
    pub direction: String,
    /// Bar-center angle, degrees.
    pub angle_degrees: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Caller-supplied portion of a camera frame publication.
#[derive(Debug, Clone)]
pub struct CameraFrameInfo {
    /// Capture timestamp, nanoseconds.
    pub capture_timestamp_ns: u64,
    /// Timestamp provenance tag.
    pub timestamp_source: String,
    /// Exposure time, microseconds.
    pub exposure_us: f64,
    /// Analog gain.
    pub gain: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producing camera name.
    pub camera_name: String,
}

/// Two single-writer frame channels with metadata sidebands.
pub struct FrameBus {
    stimulus_ring: FrameRing,
    camera_ring: FrameRing,
    stimulus_sideband: SidebandPublisher,
    camera_sideband: SidebandPublisher,
}

impl FrameBus {
    /// Create both rings (truncating previous contents) and bind both
    /// sidebands.
    pub fn new(config: &FrameBusConfig) -> IsiResult<Self> {
        let stimulus_ring = FrameRing::create(
            &config.shm_dir.join("stimulus_frames.shm"),
            config.stimulus_slot_bytes,
            config.slot_count,
        )?;
        let camera_ring = FrameRing::create(
            &config.shm_dir.join("camera_frames.shm"),
            config.camera_slot_bytes,
            config.slot_count,
        )?;
        let stimulus_sideband = SidebandPublisher::bind("stimulus", config.stimulus_port)?;
        let camera_sideband = SidebandPublisher::bind("camera", config.camera_port)?;

        Ok(Self {
            stimulus_ring,
            camera_ring,
            stimulus_sideband,
            camera_sideband,
        })
    }

    /// Publish one stimulus frame; returns the full announced metadata.
    pub fn write_stimulus_frame(
        &self,
        data: &[u8],
        info: StimulusFrameInfo,
    ) -> IsiResult<StimulusFrameMeta> {
        check_payload(data, info.width, info.height)?;
        let slot = self.stimulus_ring.write_frame(data)?;
        let meta = StimulusFrameMeta {
            frame_id: slot.frame_id,
            frame_index: info.frame_index,
            direction: info.direction,
            angle_degrees: info.angle_degrees,
            publish_timestamp_ns: wall_clock_ns(),
            width: info.width,
            height: info.height,
            channels: 1,
            data_size_bytes: slot.data_size_bytes,
            offset_bytes: slot.offset_bytes,
            shm_path: self.stimulus_ring.path().display().to_string(),
        };
        self.stimulus_sideband
            .publish(&meta_message("stimulus_frame", &meta)?);
        Ok(meta)
    }

    /// Publish one camera frame; returns the full announced metadata.
    pub fn write_camera_frame(
        &self,
        data: &[u8],
        info: CameraFrameInfo,
    ) -> IsiResult<CameraFrameMeta> {
        check_payload(data, info.width, info.height)?;
        let slot = self.camera_ring.write_frame(data)?;
        let meta = CameraFrameMeta {
            frame_id: slot.frame_id,
            capture_timestamp_ns: info.capture_timestamp_ns,
            timestamp_source: info.timestamp_source,
            exposure_us: info.exposure_us,
            gain: info.gain,
            width: info.width,
            height: info.height,
            channels: 1,
            data_size_bytes: slot.data_size_bytes,
            offset_bytes: slot.offset_bytes,
            shm_path: self.camera_ring.path().display().to_string(),
        };
        self.camera_sideband
            .publish(&meta_message("camera_frame", &meta)?);
        Ok(meta)
    }

    /// Synthesize and publish a solid-luminance baseline frame.
    pub fn publish_baseline(
        &self,
        width: u32,
        height: u32,
        luminance: f64,
    ) -> IsiResult<StimulusFrameMeta> {
        let level = (luminance.clamp(0.0, 1.0) * 255.0).round() as u8;
        let data = vec![level; width as usize * height as usize];
        self.write_stimulus_frame(
            &data,
            StimulusFrameInfo {
                frame_index: 0,
                direction: BASELINE_DIRECTION.to_string(),
                angle_degrees: 0.0,
                width,
                height,
            },
        )
    }

    /// Publish the handshake sentinel on the camera sideband.
    ///
    /// The payload is a minimal valid frame; the renderer recognizes it by
    /// `camera_name == "TEST"` and confirms its subscription.
    pub fn publish_sentinel(&self) -> IsiResult<CameraFrameMeta> {
        let data = [0u8; 4];
        self.write_camera_frame(
            &data,
            CameraFrameInfo {
                capture_timestamp_ns: wall_clock_ns(),
                timestamp_source: "sentinel".to_string(),
                exposure_us: 0.0,
                gain: 0.0,
                width: 2,
                height: 2,
                camera_name: SENTINEL_CAMERA_NAME.to_string(),
            },
        )
    }

    /// Stimulus sideband port.
    pub fn stimulus_port(&self) -> u16 {
        self.stimulus_sideband.port()
    }

    /// Camera sideband port.
    pub fn camera_port(&self) -> u16 {
        self.camera_sideband.port()
    }

    /// Live subscriber connections on the stimulus sideband.
    pub fn stimulus_subscriber_count(&self) -> usize {
        self.stimulus_sideband.subscriber_count()
    }

    /// Live subscriber connections on the camera sideband.
    pub fn camera_subscriber_count(&self) -> usize {
        self.camera_sideband.subscriber_count()
    }

    /// Frames written on the stimulus channel.
    pub fn stimulus_frames_written(&self) -> u64 {
        self.stimulus_ring.frames_written()
    }

    /// Frames written on the camera channel.
    pub fn camera_frames_written(&self) -> u64 {
        self.camera_ring.frames_written()
    }

    /// The stimulus ring (reader-side access for tests and diagnostics).
    pub fn stimulus_ring(&self) -> &FrameRing {
        &self.stimulus_ring
    }

    /// The camera ring (reader-side access for tests and diagnostics).
    pub fn camera_ring(&self) -> &FrameRing {
        &self.camera_ring
    }
}

fn check_payload(data: &[u8], width: u32, height: u32) -> IsiResult<()> {
    let expected = width as usize * height as usize;
    if data.len() != expected {
        return Err(IsiError::PublishFailed(format!(
            "payload of {} bytes does not match {width}x{height} grayscale frame",
            data.len()
        )));
    }
    Ok(())
}

fn meta_message<T: Serialize>(kind: &str, meta: &T) -> IsiResult<serde_json::Value> {
    let mut value = serde_json::to_value(meta)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("type".to_string(), json!(kind));
    }
    Ok(value)
}
