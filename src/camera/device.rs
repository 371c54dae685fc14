//! Camera device abstraction and the in-tree mock backend.
//!
//! Real vendor drivers implement [`CameraBackend`] / [`CameraDevice`];
//! the service layer above is agnostic to the driver. The [`MockBackend`]
//! generates deterministic synthetic frames and is the device used in
//! development mode and in tests. It can simulate a camera with or without
//! hardware timestamps, which is how the dev-mode timestamp policy gets
//! exercised end to end.

use crate::error::{IsiError, IsiResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

/// Enumerated camera description.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CameraInfo {
    /// Enumeration index.
    pub index: u32,
    /// Device name, used for selection.
    pub name: String,
    /// Native frame width in pixels.
    pub width: u32,
    /// Native frame height in pixels.
    pub height: u32,
    /// Native frame rate.
    pub fps: f64,
}

/// One frame as it comes off a device, before wire-format conversion.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Pixel data, row-major, `channels` interleaved.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Interleaved channel count (1 = grayscale, 3 = BGR).
    pub channels: u8,
    /// Device-reported hardware timestamp in microseconds, if provided.
    pub hardware_timestamp_us: Option<u64>,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Analog gain.
    pub gain: f64,
}

/// An open camera handle.
pub trait CameraDevice: Send {
    /// Static description of this device.
    fn info(&self) -> &CameraInfo;

    /// Blocking read of the next frame.
    fn read_frame(&mut self) -> IsiResult<CapturedFrame>;
}

/// A camera driver: enumeration plus open.
pub trait CameraBackend: Send + Sync {
    /// Enumerate attached devices. Implementations must release any probe
    /// handle they open before returning.
    fn enumerate(&self) -> IsiResult<Vec<CameraInfo>>;

    /// Open the device with the given name.
    fn open(&self, name: &str) -> IsiResult<Box<dyn CameraDevice>>;
}

/// Synthetic camera backend for development mode and tests.
pub struct MockBackend {
    devices: Vec<CameraInfo>,
    /// Whether opened devices report hardware timestamps.
    hardware_timestamps: bool,
}

impl MockBackend {
    /// Backend exposing `count` synthetic devices.
    pub fn new(count: u32, width: u32, height: u32, fps: f64, hardware_timestamps: bool) -> Self {
        let devices = (0..count)
            .map(|index| CameraInfo {
                index,
                name: format!("Mock-{index}"),
                width,
                height,
                fps,
            })
            .collect();
        Self {
            devices,
            hardware_timestamps,
        }
    }

    /// A single 64x64 @ 50 fps device with hardware timestamps.
    pub fn single_fast() -> Self {
        Self::new(1, 64, 64, 50.0, true)
    }
}

impl CameraBackend for MockBackend {
    fn enumerate(&self) -> IsiResult<Vec<CameraInfo>> {
        Ok(self.devices.clone())
    }

    fn open(&self, name: &str) -> IsiResult<Box<dyn CameraDevice>> {
        let info = self
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| IsiError::OpenFailed(format!("no such device: {name}")))?;
        Ok(Box::new(MockCamera::new(info, self.hardware_timestamps)))
    }
}

/// A deterministic synthetic camera.
pub struct MockCamera {
    info: CameraInfo,
    rng: StdRng,
    frame_counter: u64,
    opened_at: Instant,
    hardware_timestamps: bool,
}

impl MockCamera {
    fn new(info: CameraInfo, hardware_timestamps: bool) -> Self {
        Self {
            rng: StdRng::seed_from_u64(info.index as u64),
            info,
            frame_counter: 0,
            opened_at: Instant::now(),
            hardware_timestamps,
        }
    }
}

impl CameraDevice for MockCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn read_frame(&mut self) -> IsiResult<CapturedFrame> {
        let (w, h) = (self.info.width as usize, self.info.height as usize);
        let mut data = vec![0u8; w * h];

        // A drifting gradient plus shot noise; enough structure for
        // histogram and preview sanity checks.
        let phase = (self.frame_counter % 256) as u16;
        for (r, row) in data.chunks_mut(w).enumerate() {
            let base = ((r as u16 * 2 + phase) % 256) as u8;
            for px in row.iter_mut() {
                let noise: i16 = self.rng.gen_range(-8..=8);
                *px = (base as i16 + noise).clamp(0, 255) as u8;
            }
        }

        let hardware_timestamp_us = self
            .hardware_timestamps
            .then(|| self.opened_at.elapsed().as_micros() as u64);

        self.frame_counter += 1;
        Ok(CapturedFrame {
            data,
            width: self.info.width,
            height: self.info.height,
            channels: 1,
            hardware_timestamp_us,
            exposure_us: 10_000.0,
            gain: 1.0,
        })
    }
}

/// Crop to a centered square and collapse to single-channel grayscale.
///
/// This is the wire-format conversion applied to every captured frame
/// before it reaches the frame bus. Multi-channel input is averaged.
pub fn to_wire_format(frame: &CapturedFrame) -> (Vec<u8>, u32) {
    let side = frame.width.min(frame.height) as usize;
    let (w, h) = (frame.width as usize, frame.height as usize);
    let ch = frame.channels as usize;
    let x0 = (w - side) / 2;
    let y0 = (h - side) / 2;

    let mut out = Vec::with_capacity(side * side);
    for r in y0..y0 + side {
        let row = &frame.data[r * w * ch..(r + 1) * w * ch];
        if ch == 1 {
            out.extend_from_slice(&row[x0..x0 + side]);
        } else {
            for c in x0..x0 + side {
                let px = &row[c * ch..(c + 1) * ch];
                let sum: u32 = px.iter().map(|&v| v as u32).sum();
                out.push((sum / ch as u32) as u8);
            }
        }
    }
    (out, side as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_lists_named_devices() {
        let backend = MockBackend::new(2, 32, 24, 30.0, true);
        let devices = backend.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Mock-0");
        assert_eq!(devices[1].name, "Mock-1");
    }

    #[test]
    fn open_unknown_device_fails() {
        let backend = MockBackend::new(1, 32, 24, 30.0, true);
        assert!(matches!(
            backend.open("Ghost-9"),
            Err(IsiError::OpenFailed(_))
        ));
    }

    #[test]
    fn mock_reports_hardware_timestamps_when_configured() {
        let backend = MockBackend::new(1, 8, 8, 30.0, true);
        let mut device = backend.open("Mock-0").unwrap();
        let frame = device.read_frame().unwrap();
        assert!(frame.hardware_timestamp_us.is_some());

        let backend = MockBackend::new(1, 8, 8, 30.0, false);
        let mut device = backend.open("Mock-0").unwrap();
        let frame = device.read_frame().unwrap();
        assert!(frame.hardware_timestamp_us.is_none());
    }

    #[test]
    fn wire_format_is_centered_square_grayscale() {
        let frame = CapturedFrame {
            data: (0..6 * 4).map(|i| i as u8).collect(),
            width: 6,
            height: 4,
            channels: 1,
            hardware_timestamp_us: None,
            exposure_us: 0.0,
            gain: 1.0,
        };
        let (data, side) = to_wire_format(&frame);
        assert_eq!(side, 4);
        assert_eq!(data.len(), 16);
        // Row 0 of the crop is columns 1..5 of the source row 0.
        assert_eq!(&data[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn wire_format_averages_multichannel() {
        let frame = CapturedFrame {
            data: vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120],
            width: 2,
            height: 2,
            channels: 3,
            hardware_timestamp_us: None,
            exposure_us: 0.0,
            gain: 1.0,
        };
        let (data, side) = to_wire_format(&frame);
        assert_eq!(side, 2);
        assert_eq!(data, vec![20, 50, 80, 110]);
    }
}
