//! Parameter group descriptors.
//!
//! A [`GroupDescriptor`] is the validation schema for one parameter group:
//! field kinds, numeric ranges, choice lists, user-editability, and the
//! default (sentinel) value written to disk for volatile groups.
//!
//! The descriptors defined in [`standard_descriptors`] are the single place
//! where group and field names live; the rest of the backend reads them from
//! the store at runtime.

use crate::error::{IsiError, IsiResult};
use crate::params::value::ParamValue;
use std::collections::BTreeMap;

/// Value kind of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Boolean flag.
    Bool,
    /// Integer scalar.
    Int,
    /// Floating-point scalar.
    Float,
    /// String scalar.
    Str,
    /// Array of floats.
    FloatArray,
    /// Array of strings.
    StrArray,
}

/// Schema for one field in a group.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Value kind.
    pub kind: FieldKind,
    /// Inclusive lower bound for numeric fields.
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric fields.
    pub max: Option<f64>,
    /// Allowed values for string fields.
    pub choices: Option<Vec<&'static str>>,
    /// Whether the frontend may change this field.
    pub user_editable: bool,
    /// Default value; for volatile groups this is the on-disk sentinel.
    pub default: ParamValue,
}

impl FieldSpec {
    fn new(kind: FieldKind, default: ParamValue) -> Self {
        Self {
            kind,
            min: None,
            max: None,
            choices: None,
            user_editable: true,
            default,
        }
    }

    fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    fn choices(mut self, choices: &[&'static str]) -> Self {
        self.choices = Some(choices.to_vec());
        self
    }

    /// Mark a field as a hardware-detection output.
    fn detected(mut self) -> Self {
        self.user_editable = false;
        self
    }

    /// Validate one candidate value against this spec.
    pub fn validate(&self, key: &str, value: &ParamValue) -> IsiResult<()> {
        let kind_ok = match (self.kind, value) {
            (_, ParamValue::Null) => true,
            (FieldKind::Bool, ParamValue::Bool(_)) => true,
            (FieldKind::Int, ParamValue::Int(_)) => true,
            // JSON has one number type; accept integral floats for int fields
            // and widen ints for float fields.
            (FieldKind::Int, ParamValue::Float(f)) => f.fract() == 0.0,
            (FieldKind::Float, ParamValue::Float(_) | ParamValue::Int(_)) => true,
            (FieldKind::Str, ParamValue::Str(_)) => true,
            (FieldKind::FloatArray, ParamValue::FloatArray(_)) => true,
            (FieldKind::StrArray, ParamValue::StrArray(_)) => true,
            _ => false,
        };
        if !kind_ok {
            return Err(IsiError::ValidationFailed(format!(
                "{key}: expected {:?}, got {value}",
                self.kind
            )));
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(IsiError::ValidationFailed(format!(
                        "{key}: {n} is below minimum {min}"
                    )));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(IsiError::ValidationFailed(format!(
                        "{key}: {n} is above maximum {max}"
                    )));
                }
            }
        }

        if let (Some(choices), Some(s)) = (&self.choices, value.as_str()) {
            if !choices.contains(&s) {
                return Err(IsiError::ValidationFailed(format!(
                    "{key}: '{s}' is not one of {choices:?}"
                )));
            }
        }

        Ok(())
    }
}

/// Validation schema and persistence policy for one parameter group.
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    /// Group name.
    pub name: &'static str,
    /// Volatile groups are persisted as sentinel defaults, never live values.
    pub volatile: bool,
    /// Field schemas by key.
    pub fields: BTreeMap<&'static str, FieldSpec>,
}

impl GroupDescriptor {
    /// The sentinel/default mapping for this group.
    pub fn defaults(&self) -> BTreeMap<String, ParamValue> {
        self.fields
            .iter()
            .map(|(k, spec)| (k.to_string(), spec.default.clone()))
            .collect()
    }

    /// Validate a partial update against this descriptor.
    ///
    /// Unknown keys and kind/range violations fail the whole update before
    /// any mutation happens.
    pub fn validate_partial(&self, partial: &BTreeMap<String, ParamValue>) -> IsiResult<()> {
        for (key, value) in partial {
            let spec = self.fields.get(key.as_str()).ok_or_else(|| {
                IsiError::ValidationFailed(format!("unknown key '{key}' in group '{}'", self.name))
            })?;
            spec.validate(key, value)?;
        }
        Ok(())
    }

    /// Reject any key the frontend may not edit.
    pub fn check_user_editable(&self, partial: &BTreeMap<String, ParamValue>) -> IsiResult<()> {
        for key in partial.keys() {
            if let Some(spec) = self.fields.get(key.as_str()) {
                if !spec.user_editable {
                    return Err(IsiError::FieldNotUserEditable {
                        group: self.name.to_string(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The standard five groups of the acquisition backend.
pub fn standard_descriptors() -> Vec<GroupDescriptor> {
    use FieldKind::*;
    use ParamValue as V;

    let monitor = GroupDescriptor {
        name: "monitor",
        volatile: true,
        fields: BTreeMap::from([
            // Detection outputs, sentinel -1 / [] until a display is probed.
            ("width_px", FieldSpec::new(Int, V::Int(-1)).detected()),
            ("height_px", FieldSpec::new(Int, V::Int(-1)).detected()),
            (
                "refresh_rate_hz",
                FieldSpec::new(Float, V::Float(-1.0)).detected(),
            ),
            (
                "available_monitors",
                FieldSpec::new(StrArray, V::StrArray(vec![])).detected(),
            ),
            // Geometry, user-editable.
            (
                "width_cm",
                FieldSpec::new(Float, V::Float(52.0)).range(1.0, 500.0),
            ),
            (
                "height_cm",
                FieldSpec::new(Float, V::Float(29.0)).range(1.0, 500.0),
            ),
            (
                "distance_cm",
                FieldSpec::new(Float, V::Float(10.0)).range(1.0, 200.0),
            ),
            (
                "lateral_angle_deg",
                FieldSpec::new(Float, V::Float(30.0)).range(-90.0, 90.0),
            ),
            (
                "tilt_angle_deg",
                FieldSpec::new(Float, V::Float(20.0)).range(-90.0, 90.0),
            ),
        ]),
    };

    let camera = GroupDescriptor {
        name: "camera",
        volatile: true,
        fields: BTreeMap::from([
            // Selection is the only user-editable camera field.
            ("selected_camera", FieldSpec::new(Str, V::Str(String::new()))),
            (
                "available_cameras",
                FieldSpec::new(StrArray, V::StrArray(vec![])).detected(),
            ),
            ("width_px", FieldSpec::new(Int, V::Int(-1)).detected()),
            ("height_px", FieldSpec::new(Int, V::Int(-1)).detected()),
            ("fps", FieldSpec::new(Float, V::Float(-1.0)).detected()),
        ]),
    };

    let stimulus = GroupDescriptor {
        name: "stimulus",
        volatile: false,
        fields: BTreeMap::from([
            (
                "bar_width_deg",
                FieldSpec::new(Float, V::Float(20.0)).range(1.0, 60.0),
            ),
            (
                "drift_speed_deg_per_sec",
                FieldSpec::new(Float, V::Float(9.0)).range(0.1, 100.0),
            ),
            (
                "checker_size_deg",
                FieldSpec::new(Float, V::Float(25.0)).range(1.0, 90.0),
            ),
            (
                "flicker_rate_hz",
                FieldSpec::new(Float, V::Float(6.0)).range(0.1, 30.0),
            ),
            (
                "background_luminance",
                FieldSpec::new(Float, V::Float(0.5)).range(0.0, 1.0),
            ),
            (
                "transform_mode",
                FieldSpec::new(Str, V::Str("spherical".into()))
                    .choices(&["spherical", "planar"]),
            ),
        ]),
    };

    let acquisition = GroupDescriptor {
        name: "acquisition",
        volatile: false,
        fields: BTreeMap::from([
            (
                "repetitions",
                FieldSpec::new(Int, V::Int(1)).range(1.0, 100.0),
            ),
            (
                "baseline_duration_sec",
                FieldSpec::new(Float, V::Float(5.0)).range(0.0, 600.0),
            ),
            (
                "inter_trial_interval_sec",
                FieldSpec::new(Float, V::Float(2.0)).range(0.0, 600.0),
            ),
            (
                "directions",
                FieldSpec::new(
                    StrArray,
                    V::StrArray(vec![
                        "LR".into(),
                        "RL".into(),
                        "TB".into(),
                        "BT".into(),
                    ]),
                ),
            ),
        ]),
    };

    let system = GroupDescriptor {
        name: "system",
        volatile: false,
        fields: BTreeMap::from([(
            "development_mode",
            FieldSpec::new(Bool, V::Bool(false)),
        )]),
    };

    vec![monitor, camera, stimulus, acquisition, system]
}
