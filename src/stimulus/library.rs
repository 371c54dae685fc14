//! Pre-generated stimulus libraries.
//!
//! For each direction the library holds a dense sequence of monochrome
//! frames and the bar-center angle shown in each frame. LR and TB are
//! rendered; RL and BT are their reversed sequences, produced at generation
//! time and stored with identical structure, so readers never distinguish
//! derived from generated directions.
//!
//! The library is fingerprinted with a SHA-256 hash of the canonical
//! geometry + stimulus parameters. Any subscribed parameter change that
//! alters the fingerprint drops the library back to `Absent`.

use crate::error::{IsiError, IsiResult};
use crate::params::ParameterStore;
use crate::stimulus::geometry::{compute_field_maps, FieldMaps, MonitorGeometry, TransformMode};
use crate::stimulus::Direction;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Stimulus rendering parameters (the `stimulus` group, typed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusParams {
    /// Bar width in degrees of visual angle.
    pub bar_width_deg: f64,
    /// Bar drift speed in degrees per second.
    pub drift_speed_deg_per_sec: f64,
    /// Checkerboard spatial period in degrees.
    pub checker_size_deg: f64,
    /// Counter-phase flicker rate in Hz.
    pub flicker_rate_hz: f64,
    /// Background luminance in [0, 1].
    pub background_luminance: f64,
    /// Screen-to-field transform variant.
    pub transform_mode: TransformMode,
}

impl StimulusParams {
    /// Read the live stimulus parameters from the store.
    pub fn from_store(store: &ParameterStore) -> IsiResult<Self> {
        let mode_str = store.get_string("stimulus", "transform_mode")?;
        let transform_mode = TransformMode::parse(&mode_str).ok_or_else(|| {
            IsiError::ParametersMissing(format!("unknown transform_mode '{mode_str}'"))
        })?;
        Ok(Self {
            bar_width_deg: store.get_f64("stimulus", "bar_width_deg")?,
            drift_speed_deg_per_sec: store.get_f64("stimulus", "drift_speed_deg_per_sec")?,
            checker_size_deg: store.get_f64("stimulus", "checker_size_deg")?,
            flicker_rate_hz: store.get_f64("stimulus", "flicker_rate_hz")?,
            background_luminance: store.get_f64("stimulus", "background_luminance")?,
            transform_mode,
        })
    }
}

/// Canonical fingerprint of the parameters that determine library contents.
///
/// The hash covers the full monitor geometry (content depends on resolution,
/// physical layout and refresh rate) and every stimulus parameter. Field
/// order is fixed by the struct definitions, so the serialization is
/// canonical.
pub fn fingerprint(geometry: &MonitorGeometry, params: &StimulusParams) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        geometry: &'a MonitorGeometry,
        stimulus: &'a StimulusParams,
    }

    let json = serde_json::to_vec(&Canonical {
        geometry,
        stimulus: params,
    })
    .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&json);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Library state as observed by the player and the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStatus {
    /// No frames available.
    Absent,
    /// Generation in progress; not yet observable as ready.
    Pregenerating,
    /// All four directions present and fingerprinted.
    Ready,
}

/// Frames and angles for one direction.
///
/// Frames are shared `Arc`s so a derived direction reuses the rendered
/// pixels of its counterpart in reverse order.
pub struct DirectionLibrary {
    /// Monochrome frames at monitor resolution, row-major.
    pub frames: Vec<Arc<Array2<u8>>>,
    /// Bar-center angle per frame, degrees.
    pub angles: Vec<f64>,
}

impl DirectionLibrary {
    /// Number of frames in this sweep.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if the sweep has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

struct Inner {
    status: LibraryStatus,
    fingerprint: Option<String>,
    directions: BTreeMap<Direction, Arc<DirectionLibrary>>,
}

/// The in-memory stimulus library, shared across threads.
pub struct StimulusLibrary {
    inner: RwLock<Inner>,
}

impl Default for StimulusLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusLibrary {
    /// An empty (`Absent`) library.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                status: LibraryStatus::Absent,
                fingerprint: None,
                directions: BTreeMap::new(),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> LibraryStatus {
        self.read().status
    }

    /// Fingerprint of the ready library, if any.
    pub fn fingerprint(&self) -> Option<String> {
        self.read().fingerprint.clone()
    }

    /// Read-only view of one direction's sweep. `None` unless ready.
    pub fn direction(&self, direction: Direction) -> Option<Arc<DirectionLibrary>> {
        let inner = self.read();
        if inner.status != LibraryStatus::Ready {
            return None;
        }
        inner.directions.get(&direction).cloned()
    }

    /// Angle shown at `frame_index` of `direction`, if in range.
    pub fn angle_at(&self, direction: Direction, frame_index: usize) -> Option<f64> {
        self.direction(direction)?.angles.get(frame_index).copied()
    }

    /// Generate all four sweeps from the given parameters.
    ///
    /// Blocking; callers that need progress reporting run this on a worker.
    /// `cancel` is checked between frames. `memory_budget_bytes` bounds the
    /// estimated size of the rendered frames (derived directions share frame
    /// memory with their generated counterparts).
    pub fn pregenerate(
        &self,
        geometry: &MonitorGeometry,
        params: &StimulusParams,
        memory_budget_bytes: u64,
        cancel: &AtomicBool,
    ) -> IsiResult<()> {
        {
            let mut inner = self.write();
            if inner.status == LibraryStatus::Pregenerating {
                return Err(IsiError::GenerationFailed(
                    "pre-generation already in progress".into(),
                ));
            }
            inner.status = LibraryStatus::Pregenerating;
            inner.fingerprint = None;
            inner.directions.clear();
        }

        let result = self.generate_all(geometry, params, memory_budget_bytes, cancel);
        if let Err(err) = &result {
            debug!(error = %err, "stimulus pre-generation failed");
            let mut inner = self.write();
            inner.status = LibraryStatus::Absent;
            inner.directions.clear();
            inner.fingerprint = None;
        }
        result
    }

    fn generate_all(
        &self,
        geometry: &MonitorGeometry,
        params: &StimulusParams,
        memory_budget_bytes: u64,
        cancel: &AtomicBool,
    ) -> IsiResult<()> {
        validate_generation_params(params)?;

        let maps = compute_field_maps(geometry, params.transform_mode)?;
        let fps = geometry.refresh_rate_hz;

        let frame_bytes = geometry.width_px as u64 * geometry.height_px as u64;
        let total_frames =
            (sweep_frame_count(&maps.azimuth_deg, params, fps)
                + sweep_frame_count(&maps.elevation_deg, params, fps)) as u64;
        let estimate = total_frames * frame_bytes;
        if estimate > memory_budget_bytes {
            return Err(IsiError::GenerationFailed(format!(
                "estimated {estimate} bytes of frames exceeds budget of {memory_budget_bytes}"
            )));
        }

        info!(
            width = geometry.width_px,
            height = geometry.height_px,
            fps,
            "pre-generating stimulus library"
        );

        let lr = generate_sweep(&maps, SweepAxis::Azimuth, params, fps, cancel)?;
        let tb = generate_sweep(&maps, SweepAxis::Elevation, params, fps, cancel)?;
        let rl = reverse_of(&lr);
        let bt = reverse_of(&tb);

        let print = fingerprint(geometry, params);
        let mut inner = self.write();
        inner.directions.insert(Direction::LR, Arc::new(lr));
        inner.directions.insert(Direction::RL, Arc::new(rl));
        inner.directions.insert(Direction::TB, Arc::new(tb));
        inner.directions.insert(Direction::BT, Arc::new(bt));
        inner.fingerprint = Some(print);
        inner.status = LibraryStatus::Ready;
        info!("stimulus library ready");
        Ok(())
    }

    /// Install a library loaded from disk.
    pub fn install(
        &self,
        fingerprint: String,
        directions: BTreeMap<Direction, DirectionLibrary>,
    ) -> IsiResult<()> {
        if Direction::ALL
            .iter()
            .any(|d| !directions.contains_key(d))
        {
            return Err(IsiError::GenerationFailed(
                "loaded library is missing a direction".into(),
            ));
        }
        let mut inner = self.write();
        inner.directions = directions
            .into_iter()
            .map(|(d, lib)| (d, Arc::new(lib)))
            .collect();
        inner.fingerprint = Some(fingerprint);
        inner.status = LibraryStatus::Ready;
        Ok(())
    }

    /// Drop everything back to `Absent`. Returns true if frames were held.
    pub fn invalidate(&self) -> bool {
        let mut inner = self.write();
        let had_content = !inner.directions.is_empty();
        inner.directions.clear();
        inner.fingerprint = None;
        inner.status = LibraryStatus::Absent;
        had_content
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone, Copy)]
enum SweepAxis {
    Azimuth,
    Elevation,
}

fn validate_generation_params(params: &StimulusParams) -> IsiResult<()> {
    if params.drift_speed_deg_per_sec <= 0.0 {
        return Err(IsiError::ParametersMissing(
            "drift speed must be positive".into(),
        ));
    }
    if params.bar_width_deg <= 0.0 || params.checker_size_deg <= 0.0 {
        return Err(IsiError::ParametersMissing(
            "bar width and checker size must be positive".into(),
        ));
    }
    Ok(())
}

fn map_extent(map: &Array2<f32>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in map.iter() {
        let v = v as f64;
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

fn sweep_frame_count(map: &Array2<f32>, params: &StimulusParams, fps: f64) -> usize {
    let (min, max) = map_extent(map);
    let span = (max - min) + params.bar_width_deg;
    // One extra step of padding on each side so the bar is strictly outside
    // the field on the first and last frames.
    ((span / params.drift_speed_deg_per_sec) * fps).ceil() as usize + 3
}

/// Render one generated sweep along `axis`.
///
/// The bar center starts half a bar width before the field edge and ends
/// half a bar width past the other edge, so the bar fully enters and exits
/// the screen. The angle sequence is strictly increasing; derived directions
/// get the reverse.
fn generate_sweep(
    maps: &FieldMaps,
    axis: SweepAxis,
    params: &StimulusParams,
    fps: f64,
    cancel: &AtomicBool,
) -> IsiResult<DirectionLibrary> {
    let angle_map = match axis {
        SweepAxis::Azimuth => &maps.azimuth_deg,
        SweepAxis::Elevation => &maps.elevation_deg,
    };

    let (min, _) = map_extent(angle_map);
    let half_bar = params.bar_width_deg / 2.0;
    let step = params.drift_speed_deg_per_sec / fps;
    let start = min - half_bar - step;
    let n = sweep_frame_count(angle_map, params, fps);

    // Checker cell parity is a pure function of the field maps; compute once.
    let checker = params.checker_size_deg as f32;
    let mut parity = Array2::<u8>::zeros(angle_map.dim());
    Zip::from(&mut parity)
        .and(&maps.azimuth_deg)
        .and(&maps.elevation_deg)
        .for_each(|p, &az, &el| {
            let cell = (az / checker).floor() as i64 + (el / checker).floor() as i64;
            *p = (cell.rem_euclid(2)) as u8;
        });

    let background = (params.background_luminance.clamp(0.0, 1.0) * 255.0).round() as u8;

    let mut frames = Vec::with_capacity(n);
    let mut angles = Vec::with_capacity(n);

    for i in 0..n {
        if cancel.load(Ordering::Relaxed) {
            return Err(IsiError::GenerationFailed("pre-generation cancelled".into()));
        }

        let angle = start + i as f64 * step;
        // Counter-phase square wave at flicker_rate_hz.
        let phase = ((i as f64 / fps) * params.flicker_rate_hz * 2.0).floor() as i64 & 1;
        let phase = phase as u8;

        let mut frame = Array2::<u8>::zeros(angle_map.dim());
        let angle_f = angle as f32;
        let half_f = half_bar as f32;
        Zip::from(&mut frame)
            .and(angle_map)
            .and(&parity)
            .for_each(|px, &a, &p| {
                *px = if (a - angle_f).abs() < half_f {
                    if (p ^ phase) == 1 {
                        255
                    } else {
                        0
                    }
                } else {
                    background
                };
            });

        frames.push(Arc::new(frame));
        angles.push(angle);
    }

    Ok(DirectionLibrary { frames, angles })
}

fn reverse_of(lib: &DirectionLibrary) -> DirectionLibrary {
    DirectionLibrary {
        frames: lib.frames.iter().rev().cloned().collect(),
        angles: lib.angles.iter().rev().copied().collect(),
    }
}
