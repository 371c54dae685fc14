//! Acquisition sessions.
//!
//! One session owns a directory tree under `data/sessions/` holding the
//! per-trial recordings, parameter snapshots, and a `state.json` that tracks
//! completion and any interruption point. The snapshot is taken when the
//! session starts; parameter changes made mid-session apply to subsequent
//! sessions only.

use crate::error::{IsiError, IsiResult};
use crate::params::{ParamMap, ParameterStore};
use crate::stimulus::Direction;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Schema version of `state.json` and `session_config.json`.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// A recording plan as submitted by `start_record`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPlan {
    /// Directions to record, in order.
    pub directions: Vec<Direction>,
    /// Repetitions per direction.
    pub repetitions: u32,
    /// Baseline duration before the first and after the last direction.
    pub baseline_sec: f64,
    /// Pause between trials.
    pub inter_trial_sec: f64,
    /// Optional human-readable session name.
    #[serde(default)]
    pub name: Option<String>,
}

impl SessionPlan {
    /// Build the default plan from the `acquisition` parameter group.
    pub fn from_params(store: &ParameterStore) -> IsiResult<Self> {
        let directions_raw = store.get("acquisition", "directions")?;
        let directions = directions_raw
            .as_str_array()
            .ok_or_else(|| IsiError::ValidationFailed("acquisition.directions".into()))?
            .iter()
            .map(|s| {
                Direction::parse(s).ok_or_else(|| IsiError::UnknownDirection(s.clone()))
            })
            .collect::<IsiResult<Vec<_>>>()?;

        Ok(Self {
            directions,
            repetitions: store.get_i64("acquisition", "repetitions")? as u32,
            baseline_sec: store.get_f64("acquisition", "baseline_duration_sec")?,
            inter_trial_sec: store.get_f64("acquisition", "inter_trial_interval_sec")?,
            name: None,
        })
    }

    /// Overlay fields present in a `start_record` command payload.
    pub fn merge_json(mut self, payload: &serde_json::Value) -> IsiResult<Self> {
        if let Some(directions) = payload.get("directions").and_then(|v| v.as_array()) {
            self.directions = directions
                .iter()
                .map(|v| {
                    let s = v.as_str().unwrap_or_default();
                    Direction::parse(s).ok_or_else(|| IsiError::UnknownDirection(s.to_string()))
                })
                .collect::<IsiResult<Vec<_>>>()?;
        }
        if let Some(reps) = payload.get("repetitions").and_then(|v| v.as_u64()) {
            self.repetitions = reps as u32;
        }
        if let Some(v) = payload.get("baseline_sec").and_then(|v| v.as_f64()) {
            self.baseline_sec = v;
        }
        if let Some(v) = payload.get("inter_trial_sec").and_then(|v| v.as_f64()) {
            self.inter_trial_sec = v;
        }
        if let Some(name) = payload.get("name").and_then(|v| v.as_str()) {
            self.name = Some(name.to_string());
        }

        if self.directions.is_empty() {
            return Err(IsiError::ValidationFailed(
                "recording plan has no directions".into(),
            ));
        }
        if self.repetitions == 0 {
            return Err(IsiError::ValidationFailed(
                "repetitions must be at least 1".into(),
            ));
        }
        Ok(self)
    }
}

/// Where an interrupted session stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionPoint {
    /// Direction being recorded at interruption.
    pub direction: String,
    /// Zero-based repetition of that direction.
    pub repetition: u32,
    /// Camera frames captured for the interrupted trial.
    pub frames_captured: u64,
    /// Last camera timestamp written, if any.
    pub last_camera_timestamp_ns: Option<u64>,
}

/// Session completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Recording in progress.
    Recording,
    /// All planned directions completed.
    Complete,
    /// Ended early; `interruption_point` says where.
    Interrupted,
    /// Ended by a fatal error; data preserved.
    Error,
}

/// Contents of `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Schema version.
    pub schema_version: u32,
    /// Unique session id.
    pub session_id: String,
    /// UTC creation time.
    pub created_at: String,
    /// Current status.
    pub status: SessionStatus,
    /// Directions the plan calls for.
    pub directions_planned: Vec<String>,
    /// Directions fully recorded (all repetitions).
    pub directions_completed: Vec<String>,
    /// Present when the session did not complete.
    #[serde(default)]
    pub interruption_point: Option<InterruptionPoint>,
}

/// Serialized form of `metadata/session_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Schema version.
    pub schema_version: u32,
    /// Unique session id.
    pub session_id: String,
    /// UTC creation time.
    pub created_at: String,
    /// The recording plan.
    pub plan: SessionPlan,
    /// Full parameter snapshot at session start.
    pub parameters: BTreeMap<String, ParamMap>,
}

/// One acquisition session directory.
pub struct Session {
    root: PathBuf,
    state: SessionState,
    parameters: BTreeMap<String, ParamMap>,
    plan: SessionPlan,
}

impl Session {
    /// Create the session directory tree and its metadata files.
    pub fn create(
        sessions_dir: &Path,
        plan: SessionPlan,
        parameters: BTreeMap<String, ParamMap>,
        timestamp_source: &str,
    ) -> IsiResult<Self> {
        let session_id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let name = plan
            .name
            .clone()
            .unwrap_or_else(|| "session".to_string());
        let mut root = sessions_dir.join(format!("{stamp}_{name}"));
        if root.exists() {
            // Two sessions inside one second; disambiguate.
            root = sessions_dir.join(format!("{stamp}_{name}_{}", &session_id[..8]));
        }

        fs::create_dir_all(root.join("metadata"))?;
        fs::create_dir_all(root.join("acquisition"))?;

        let config = SessionConfig {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: session_id.clone(),
            created_at: created_at.clone(),
            plan: plan.clone(),
            parameters: parameters.clone(),
        };
        fs::write(
            root.join("metadata").join("session_config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;

        let hardware = serde_json::json!({
            "camera": parameters.get("camera"),
            "monitor": parameters.get("monitor"),
            "timestamp_source": timestamp_source,
            "os": std::env::consts::OS,
        });
        fs::write(
            root.join("metadata").join("hardware_info.json"),
            serde_json::to_string_pretty(&hardware)?,
        )?;

        let state = SessionState {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id,
            created_at,
            status: SessionStatus::Recording,
            directions_planned: plan.directions.iter().map(|d| d.to_string()).collect(),
            directions_completed: Vec::new(),
            interruption_point: None,
        };

        let session = Self {
            root,
            state,
            parameters,
            plan,
        };
        session.save_state()?;
        info!(path = %session.root.display(), id = %session.state.session_id, "session created");
        Ok(session)
    }

    /// Session root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.state.session_id
    }

    /// The recording plan.
    pub fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    /// Parameter snapshot taken at session start.
    pub fn parameters(&self) -> &BTreeMap<String, ParamMap> {
        &self.parameters
    }

    /// Current state (read-only).
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// HDF5 path for one trial.
    pub fn trial_h5_path(&self, direction: Direction, trial: u32) -> PathBuf {
        self.root
            .join("acquisition")
            .join(format!("{direction}_trial_{trial:03}.h5"))
    }

    /// Events JSON path for one trial.
    pub fn trial_events_path(&self, direction: Direction, trial: u32) -> PathBuf {
        self.root
            .join("acquisition")
            .join(format!("{direction}_trial_{trial:03}_events.json"))
    }

    /// Record a fully completed direction and persist the state.
    pub fn mark_direction_completed(&mut self, direction: Direction) -> IsiResult<()> {
        let name = direction.to_string();
        if !self.state.directions_completed.contains(&name) {
            self.state.directions_completed.push(name);
        }
        self.save_state()
    }

    /// Record where an interrupted session stopped and persist the state.
    pub fn set_interruption(
        &mut self,
        status: SessionStatus,
        point: InterruptionPoint,
    ) -> IsiResult<()> {
        self.state.status = status;
        self.state.interruption_point = Some(point);
        self.save_state()
    }

    /// Update the status and persist the state.
    pub fn set_status(&mut self, status: SessionStatus) -> IsiResult<()> {
        self.state.status = status;
        self.save_state()
    }

    /// Write `state.json`.
    pub fn save_state(&self) -> IsiResult<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        let path = self.root.join("state.json");
        let tmp = self.root.join("state.json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the state of a session directory.
    pub fn load_state(session_root: &Path) -> IsiResult<SessionState> {
        let text = fs::read_to_string(session_root.join("state.json"))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The most recently created session directory, if any.
    ///
    /// Directory names sort chronologically by construction, so the lexical
    /// maximum is the latest session. Used to offer resume after an
    /// interruption.
    pub fn latest(sessions_dir: &Path) -> Option<PathBuf> {
        let entries = fs::read_dir(sessions_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir() && e.path().join("state.json").exists())
            .map(|e| e.path())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plan() -> SessionPlan {
        SessionPlan {
            directions: vec![Direction::LR, Direction::RL],
            repetitions: 1,
            baseline_sec: 1.0,
            inter_trial_sec: 0.5,
            name: Some("mouse42".into()),
        }
    }

    #[test]
    fn create_lays_out_directory_tree() {
        let dir = tempdir().unwrap();
        let session = Session::create(dir.path(), plan(), BTreeMap::new(), "hardware").unwrap();

        assert!(session.root().join("metadata/session_config.json").exists());
        assert!(session.root().join("metadata/hardware_info.json").exists());
        assert!(session.root().join("state.json").exists());
        assert!(session
            .root()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_mouse42"));

        let h5 = session.trial_h5_path(Direction::LR, 0);
        assert!(h5.to_string_lossy().ends_with("acquisition/LR_trial_000.h5"));
    }

    #[test]
    fn completion_and_interruption_round_trip() {
        let dir = tempdir().unwrap();
        let mut session = Session::create(dir.path(), plan(), BTreeMap::new(), "hardware").unwrap();

        session.mark_direction_completed(Direction::LR).unwrap();
        session
            .set_interruption(
                SessionStatus::Interrupted,
                InterruptionPoint {
                    direction: "RL".into(),
                    repetition: 0,
                    frames_captured: 42,
                    last_camera_timestamp_ns: Some(123),
                },
            )
            .unwrap();

        let state = Session::load_state(session.root()).unwrap();
        assert_eq!(state.status, SessionStatus::Interrupted);
        assert_eq!(state.directions_completed, vec!["LR".to_string()]);
        let point = state.interruption_point.unwrap();
        assert_eq!(point.direction, "RL");
        assert_eq!(point.frames_captured, 42);
    }

    #[test]
    fn plan_merges_command_payload() {
        let base = plan();
        let merged = base
            .merge_json(&serde_json::json!({
                "directions": ["TB", "BT"],
                "repetitions": 3,
                "baseline_sec": 2.5,
            }))
            .unwrap();
        assert_eq!(merged.directions, vec![Direction::TB, Direction::BT]);
        assert_eq!(merged.repetitions, 3);
        assert_eq!(merged.baseline_sec, 2.5);
        assert_eq!(merged.inter_trial_sec, 0.5);

        let err = plan()
            .merge_json(&serde_json::json!({"directions": ["XX"]}))
            .unwrap_err();
        assert!(matches!(err, IsiError::UnknownDirection(_)));
    }

    #[test]
    fn latest_finds_newest_session() {
        let dir = tempdir().unwrap();
        let _a = Session::create(dir.path(), plan(), BTreeMap::new(), "hardware").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = Session::create(dir.path(), plan(), BTreeMap::new(), "hardware").unwrap();

        let latest = Session::latest(dir.path()).unwrap();
        assert_eq!(latest, b.root());
    }
}
