//! Monitor geometry and the screen-to-visual-field transform.
//!
//! The presentation monitor sits at an off-axis, tilted position relative to
//! the mouse eye. For each screen pixel we compute its direction in the
//! animal's visual field as (azimuth, elevation) in degrees. A drifting bar
//! of constant visual-angle width is then a moving iso-contour of one of
//! those two maps, so per-frame rendering is a pure comparison against the
//! precomputed maps, with no trigonometry in the playback-rate path.

use crate::error::{IsiError, IsiResult};
use crate::params::ParameterStore;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Screen-to-field transform variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    /// Full spherical model with monitor tilt and lateral rotation.
    Spherical,
    /// Flat small-angle mapping; no monitor rotation applied.
    Planar,
}

impl TransformMode {
    /// Parse the `stimulus.transform_mode` parameter value.
    pub fn parse(s: &str) -> Option<TransformMode> {
        match s {
            "spherical" => Some(TransformMode::Spherical),
            "planar" => Some(TransformMode::Planar),
            _ => None,
        }
    }
}

/// Keys of the `monitor` group that change stimulus content.
///
/// Selection-only keys (`available_monitors`) are deliberately absent: a
/// change to them must not invalidate a generated library.
pub const GEOMETRY_KEYS: [&str; 8] = [
    "width_px",
    "height_px",
    "width_cm",
    "height_cm",
    "distance_cm",
    "lateral_angle_deg",
    "tilt_angle_deg",
    "refresh_rate_hz",
];

/// Physical and pixel geometry of the presentation monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorGeometry {
    /// Horizontal resolution in pixels.
    pub width_px: u32,
    /// Vertical resolution in pixels.
    pub height_px: u32,
    /// Physical width in centimeters.
    pub width_cm: f64,
    /// Physical height in centimeters.
    pub height_cm: f64,
    /// Eye-to-screen-center distance in centimeters.
    pub distance_cm: f64,
    /// Rotation of the monitor around the vertical axis, degrees.
    pub lateral_angle_deg: f64,
    /// Rotation of the monitor around the horizontal axis, degrees.
    pub tilt_angle_deg: f64,
    /// Native refresh rate in frames per second.
    pub refresh_rate_hz: f64,
}

impl MonitorGeometry {
    /// Read the live geometry from the parameter store.
    ///
    /// Fails with [`IsiError::ParametersMissing`] while the monitor volatile
    /// fields are still at their sentinel values (no display detected yet).
    pub fn from_store(store: &ParameterStore) -> IsiResult<Self> {
        let width_px = store.get_i64("monitor", "width_px")?;
        let height_px = store.get_i64("monitor", "height_px")?;
        if width_px <= 0 || height_px <= 0 {
            return Err(IsiError::ParametersMissing(
                "monitor resolution not detected".into(),
            ));
        }
        let geom = Self {
            width_px: width_px as u32,
            height_px: height_px as u32,
            width_cm: store.get_f64("monitor", "width_cm")?,
            height_cm: store.get_f64("monitor", "height_cm")?,
            distance_cm: store.get_f64("monitor", "distance_cm")?,
            lateral_angle_deg: store.get_f64("monitor", "lateral_angle_deg")?,
            tilt_angle_deg: store.get_f64("monitor", "tilt_angle_deg")?,
            refresh_rate_hz: store.get_f64("monitor", "refresh_rate_hz")?,
        };
        geom.validate()?;
        Ok(geom)
    }

    /// Reject sentinel or degenerate values.
    pub fn validate(&self) -> IsiResult<()> {
        if self.width_px == 0 || self.height_px == 0 || self.refresh_rate_hz <= 0.0 {
            return Err(IsiError::ParametersMissing(
                "monitor resolution/refresh not detected".into(),
            ));
        }
        if self.width_cm <= 0.0 || self.height_cm <= 0.0 || self.distance_cm <= 0.0 {
            return Err(IsiError::ParametersMissing(
                "monitor physical dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-pixel visual-field coordinate maps, degrees.
pub struct FieldMaps {
    /// Azimuth of each pixel, degrees, positive rightward.
    pub azimuth_deg: Array2<f32>,
    /// Elevation of each pixel, degrees, positive upward.
    pub elevation_deg: Array2<f32>,
}

/// Compute per-pixel (azimuth, elevation) for the given geometry.
///
/// Coordinate frame: the eye sits at the origin, `+z` points at the screen
/// center before rotation, `+x` right, `+y` up. Each pixel's position on the
/// untilted screen plane is `(x_cm, y_cm, distance_cm)`; the monitor's tilt
/// (pitch about x) and lateral angle (yaw about y) rotate that vector, and
/// azimuth/elevation are read off the result.
pub fn compute_field_maps(geom: &MonitorGeometry, mode: TransformMode) -> IsiResult<FieldMaps> {
    geom.validate()?;

    let (w, h) = (geom.width_px as usize, geom.height_px as usize);
    let mut azimuth = Array2::<f32>::zeros((h, w));
    let mut elevation = Array2::<f32>::zeros((h, w));

    let tilt = geom.tilt_angle_deg.to_radians();
    let yaw = geom.lateral_angle_deg.to_radians();
    let (sin_t, cos_t) = tilt.sin_cos();
    let (sin_y, cos_y) = yaw.sin_cos();
    let d = geom.distance_cm;

    for r in 0..h {
        // Pixel centers; +y up means row 0 is the top of the screen.
        let y = (0.5 - (r as f64 + 0.5) / h as f64) * geom.height_cm;
        for c in 0..w {
            let x = ((c as f64 + 0.5) / w as f64 - 0.5) * geom.width_cm;

            let (az, el) = match mode {
                TransformMode::Planar => {
                    (x.atan2(d).to_degrees(), y.atan2(d).to_degrees())
                }
                TransformMode::Spherical => {
                    // Pitch about x.
                    let y1 = y * cos_t - d * sin_t;
                    let z1 = y * sin_t + d * cos_t;
                    // Yaw about y.
                    let x2 = x * cos_y + z1 * sin_y;
                    let z2 = -x * sin_y + z1 * cos_y;

                    let az = x2.atan2(z2).to_degrees();
                    let el = y1.atan2((x2 * x2 + z2 * z2).sqrt()).to_degrees();
                    (az, el)
                }
            };

            azimuth[(r, c)] = az as f32;
            elevation[(r, c)] = el as f32;
        }
    }

    Ok(FieldMaps {
        azimuth_deg: azimuth,
        elevation_deg: elevation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_on_geometry() -> MonitorGeometry {
        MonitorGeometry {
            width_px: 32,
            height_px: 16,
            width_cm: 40.0,
            height_cm: 20.0,
            distance_cm: 10.0,
            lateral_angle_deg: 0.0,
            tilt_angle_deg: 0.0,
            refresh_rate_hz: 60.0,
        }
    }

    #[test]
    fn azimuth_increases_left_to_right() {
        let maps = compute_field_maps(&head_on_geometry(), TransformMode::Spherical).unwrap();
        let mid = 8;
        for c in 1..32 {
            assert!(maps.azimuth_deg[(mid, c)] > maps.azimuth_deg[(mid, c - 1)]);
        }
    }

    #[test]
    fn elevation_decreases_top_to_bottom() {
        let maps = compute_field_maps(&head_on_geometry(), TransformMode::Spherical).unwrap();
        let mid = 16;
        for r in 1..16 {
            assert!(maps.elevation_deg[(r, mid)] < maps.elevation_deg[(r - 1, mid)]);
        }
    }

    #[test]
    fn head_on_center_is_near_origin() {
        let maps = compute_field_maps(&head_on_geometry(), TransformMode::Spherical).unwrap();
        // Pixel nearest the screen center.
        let az = maps.azimuth_deg[(7, 15)] + maps.azimuth_deg[(8, 16)];
        let el = maps.elevation_deg[(7, 15)] + maps.elevation_deg[(8, 16)];
        assert!(az.abs() < 5.0);
        assert!(el.abs() < 5.0);
    }

    #[test]
    fn lateral_rotation_shifts_azimuth() {
        let mut geom = head_on_geometry();
        geom.lateral_angle_deg = 30.0;
        let maps = compute_field_maps(&geom, TransformMode::Spherical).unwrap();
        // The screen center moves to ~+30 deg azimuth.
        let center = maps.azimuth_deg[(8, 16)];
        assert!((center - 30.0).abs() < 3.0);
    }

    #[test]
    fn sentinel_geometry_is_rejected() {
        let mut geom = head_on_geometry();
        geom.refresh_rate_hz = -1.0;
        assert!(matches!(
            geom.validate(),
            Err(IsiError::ParametersMissing(_))
        ));
    }

    #[test]
    fn planar_matches_spherical_when_head_on_small_angles() {
        let geom = MonitorGeometry {
            distance_cm: 100.0,
            ..head_on_geometry()
        };
        let sph = compute_field_maps(&geom, TransformMode::Spherical).unwrap();
        let pla = compute_field_maps(&geom, TransformMode::Planar).unwrap();
        for r in 0..16 {
            for c in 0..32 {
                assert!((sph.azimuth_deg[(r, c)] - pla.azimuth_deg[(r, c)]).abs() < 0.5);
            }
        }
    }
}
