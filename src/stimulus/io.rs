//! Stimulus library persistence.
//!
//! Each direction is saved to its own HDF5 file (`<DIR>_frames.h5`) with a
//! gzip-compressed `/frames` dataset chunked one frame per chunk, an
//! `/angles` dataset, and a small `metadata` group. A sibling
//! `library_metadata.json` carries the parameter fingerprint and the full
//! parameter snapshot used for generation; loading validates the fingerprint
//! against the currently effective parameters and rejects mismatches.

use crate::error::{IsiError, IsiResult};
use crate::stimulus::geometry::MonitorGeometry;
use crate::stimulus::library::{DirectionLibrary, StimulusLibrary, StimulusParams};
use crate::stimulus::Direction;
use chrono::Utc;
use ndarray::{s, Array1, Array2, Array3, Ix3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Version tag written into `library_metadata.json`.
pub const LIBRARY_SCHEMA_VERSION: u32 = 1;

/// Sidecar metadata for an on-disk library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryMetadata {
    /// Schema version of the on-disk layout.
    pub schema_version: u32,
    /// Fingerprint of the parameters the library was generated under.
    pub fingerprint: String,
    /// UTC timestamp of the save.
    pub saved_at: String,
    /// Monitor geometry snapshot.
    pub geometry: MonitorGeometry,
    /// Stimulus parameter snapshot.
    pub stimulus: StimulusParams,
}

fn direction_file(dir: &Path, direction: Direction) -> std::path::PathBuf {
    dir.join(format!("{}_frames.h5", direction.as_str()))
}

fn metadata_file(dir: &Path) -> std::path::PathBuf {
    dir.join("library_metadata.json")
}

/// Save a ready library to `dir`, overwriting any previous save.
///
/// Returns an error on I/O failure; callers treat save failures as warnings
/// because the in-memory library stays usable either way.
pub fn save_library(
    dir: &Path,
    library: &StimulusLibrary,
    geometry: &MonitorGeometry,
    params: &StimulusParams,
) -> IsiResult<()> {
    let fingerprint = library
        .fingerprint()
        .ok_or(IsiError::EmptyLibrary)?;

    fs::create_dir_all(dir)?;

    for direction in Direction::ALL {
        let sweep = library.direction(direction).ok_or(IsiError::EmptyLibrary)?;
        write_direction(&direction_file(dir, direction), &sweep.frames, &sweep.angles)?;
    }

    let metadata = LibraryMetadata {
        schema_version: LIBRARY_SCHEMA_VERSION,
        fingerprint,
        saved_at: Utc::now().to_rfc3339(),
        geometry: geometry.clone(),
        stimulus: params.clone(),
    };
    let json = serde_json::to_string_pretty(&metadata)?;
    fs::write(metadata_file(dir), json)?;

    info!(path = %dir.display(), "stimulus library saved");
    Ok(())
}

fn write_direction(
    path: &Path,
    frames: &[Arc<Array2<u8>>],
    angles: &[f64],
) -> IsiResult<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let file = hdf5::File::create(path)?;

    let (height, width) = frames
        .first()
        .map(|f| f.dim())
        .ok_or(IsiError::EmptyLibrary)?;
    let n = frames.len();

    let ds = file
        .new_dataset::<u8>()
        .shape((n, height, width))
        .chunk((1, height, width))
        .deflate(4)
        .create("frames")?;
    for (i, frame) in frames.iter().enumerate() {
        ds.write_slice(frame.view(), s![i, .., ..])?;
    }

    file.new_dataset_builder()
        .with_data(&Array1::from_vec(angles.to_vec()))
        .create("angles")?;

    let meta = file.create_group("metadata")?;
    meta.new_attr::<u64>()
        .create("n_frames")?
        .write_scalar(&(n as u64))?;
    meta.new_attr::<u64>()
        .create("width")?
        .write_scalar(&(width as u64))?;
    meta.new_attr::<u64>()
        .create("height")?
        .write_scalar(&(height as u64))?;

    Ok(())
}

/// Load the library saved in `dir`, validating its fingerprint.
///
/// `expected_fingerprint` is the fingerprint of the currently effective
/// parameters; a mismatch rejects the load and leaves the in-memory library
/// untouched by the caller.
pub fn load_library(
    dir: &Path,
    expected_fingerprint: &str,
) -> IsiResult<(String, BTreeMap<Direction, DirectionLibrary>)> {
    let text = fs::read_to_string(metadata_file(dir))?;
    let metadata: LibraryMetadata = serde_json::from_str(&text)?;

    if metadata.schema_version != LIBRARY_SCHEMA_VERSION {
        warn!(
            found = metadata.schema_version,
            "stimulus library schema version mismatch"
        );
        return Err(IsiError::GenerationFailed(format!(
            "unsupported library schema version {}",
            metadata.schema_version
        )));
    }

    if metadata.fingerprint != expected_fingerprint {
        return Err(IsiError::LibraryFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            found: metadata.fingerprint,
        });
    }

    let mut directions = BTreeMap::new();
    for direction in Direction::ALL {
        directions.insert(direction, read_direction(&direction_file(dir, direction))?);
    }

    Ok((metadata.fingerprint, directions))
}

fn read_direction(path: &Path) -> IsiResult<DirectionLibrary> {
    let file = hdf5::File::open(path)?;

    let frames_ds = file.dataset("frames")?;
    let stacked: Array3<u8> = frames_ds
        .read_dyn::<u8>()?
        .into_dimensionality::<Ix3>()
        .map_err(|e| IsiError::GenerationFailed(format!("frames dataset shape: {e}")))?;

    let angles: Vec<f64> = file.dataset("angles")?.read_1d::<f64>()?.to_vec();

    let n = stacked.shape()[0];
    if n != angles.len() {
        return Err(IsiError::GenerationFailed(format!(
            "frame/angle length mismatch in {}: {n} vs {}",
            path.display(),
            angles.len()
        )));
    }

    let frames = (0..n)
        .map(|i| Arc::new(stacked.index_axis(ndarray::Axis(0), i).to_owned()))
        .collect();

    Ok(DirectionLibrary { frames, angles })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::geometry::TransformMode;
    use crate::stimulus::library::fingerprint;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn geometry() -> MonitorGeometry {
        MonitorGeometry {
            width_px: 16,
            height_px: 8,
            width_cm: 40.0,
            height_cm: 20.0,
            distance_cm: 10.0,
            lateral_angle_deg: 0.0,
            tilt_angle_deg: 0.0,
            refresh_rate_hz: 20.0,
        }
    }

    fn params() -> StimulusParams {
        StimulusParams {
            bar_width_deg: 20.0,
            drift_speed_deg_per_sec: 80.0,
            checker_size_deg: 25.0,
            flicker_rate_hz: 6.0,
            background_luminance: 0.2,
            transform_mode: TransformMode::Spherical,
        }
    }

    fn ready_library() -> StimulusLibrary {
        let lib = StimulusLibrary::new();
        lib.pregenerate(&geometry(), &params(), 1 << 30, &AtomicBool::new(false))
            .unwrap();
        lib
    }

    #[test]
    fn save_then_load_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let lib = ready_library();
        save_library(dir.path(), &lib, &geometry(), &params()).unwrap();

        let expected = fingerprint(&geometry(), &params());
        let (print, loaded) = load_library(dir.path(), &expected).unwrap();
        assert_eq!(print, expected);

        for d in Direction::ALL {
            let orig = lib.direction(d).unwrap();
            let back = &loaded[&d];
            assert_eq!(orig.angles, back.angles);
            assert_eq!(orig.frames.len(), back.frames.len());
            for (a, b) in orig.frames.iter().zip(&back.frames) {
                assert_eq!(a.as_ref(), b.as_ref());
            }
        }
    }

    #[test]
    fn fingerprint_mismatch_rejects_load() {
        let dir = tempdir().unwrap();
        let lib = ready_library();
        save_library(dir.path(), &lib, &geometry(), &params()).unwrap();

        let mut changed = geometry();
        changed.distance_cm = 11.0;
        let expected = fingerprint(&changed, &params());
        let err = load_library(dir.path(), &expected).unwrap_err();
        assert!(matches!(err, IsiError::LibraryFingerprintMismatch { .. }));
    }

    #[test]
    fn loaded_library_installs_as_ready() {
        let dir = tempdir().unwrap();
        let lib = ready_library();
        save_library(dir.path(), &lib, &geometry(), &params()).unwrap();

        let expected = fingerprint(&geometry(), &params());
        let (print, directions) = load_library(dir.path(), &expected).unwrap();

        let fresh = StimulusLibrary::new();
        fresh.install(print, directions).unwrap();
        assert_eq!(fresh.status(), crate::stimulus::LibraryStatus::Ready);
        assert!(fresh.direction(Direction::BT).is_some());
    }
}
