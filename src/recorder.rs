//! Per-trial acquisition recorder.
//!
//! One recorder instance covers one trial of one direction: an HDF5 file
//! with growable datasets for camera frames, capture timestamps, the
//! camera-to-stimulus frame cross-reference and the acquisition phase of
//! every frame, plus a JSON sibling holding the stimulus display-event log,
//! metadata snapshots, and (after close) an integrity manifest.
//!
//! Camera capture throughput matters, so the frame dataset is chunked one
//! frame per chunk and uncompressed; compression lives in the stimulus
//! library files where write speed is irrelevant.

use crate::camera::CameraFrameRecord;
use crate::error::{IsiError, IsiResult};
use crate::params::ParamMap;
use crate::sync_log::DisplayEvent;
use chrono::Utc;
use ndarray::{arr1, s, Array2};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Schema version written into every trial JSON.
pub const TRIAL_SCHEMA_VERSION: u32 = 1;

/// Acquisition phase a camera frame was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPhase {
    /// Initial baseline before the first direction.
    BaselineInitial,
    /// Drifting-bar stimulus on screen.
    Stimulus,
    /// Baseline between trials.
    InterTrial,
    /// Final baseline after the last direction.
    BaselineFinal,
}

impl RecordPhase {
    /// Stable numeric code stored in the `/phase` dataset.
    pub fn code(&self) -> u8 {
        match self {
            RecordPhase::BaselineInitial => 0,
            RecordPhase::Stimulus => 1,
            RecordPhase::InterTrial => 2,
            RecordPhase::BaselineFinal => 3,
        }
    }

    /// Legend entry for the JSON metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordPhase::BaselineInitial => "baseline_initial",
            RecordPhase::Stimulus => "stimulus",
            RecordPhase::InterTrial => "inter_trial",
            RecordPhase::BaselineFinal => "baseline_final",
        }
    }
}

/// Completion status recorded in the trial JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Recorder open, data flowing.
    Recording,
    /// Closed after a full trial.
    Complete,
    /// Closed early; everything written so far is preserved.
    Incomplete,
}

/// Integrity manifest computed at close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialManifest {
    /// Camera frames in the HDF5 file.
    pub camera_frames: u64,
    /// Stimulus display events in the JSON log.
    pub stimulus_events: u64,
    /// First capture timestamp, if any frame was written.
    pub first_timestamp_ns: Option<u64>,
    /// Last capture timestamp, if any frame was written.
    pub last_timestamp_ns: Option<u64>,
    /// SHA-256 of the finalized HDF5 file.
    pub hdf5_sha256: String,
}

/// Serialized form of the trial JSON sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialDocument {
    /// Schema version of this document.
    pub schema_version: u32,
    /// Owning session id.
    pub session_id: String,
    /// Direction of this trial.
    pub direction: String,
    /// Zero-based trial number within the direction.
    pub trial: u32,
    /// UTC start time.
    pub started_at: String,
    /// Completion status.
    pub status: TrialStatus,
    /// Timestamp provenance of the camera frames.
    pub timestamp_source: String,
    /// Parameter snapshot the session was recorded under.
    pub parameters: BTreeMap<String, ParamMap>,
    /// Phase-code legend for the `/phase` dataset.
    pub phase_legend: BTreeMap<u8, String>,
    /// Stimulus display events, in publish order.
    pub events: Vec<DisplayEvent>,
    /// Present after close.
    pub manifest: Option<TrialManifest>,
}

struct Datasets {
    frames: hdf5::Dataset,
    timestamps: hdf5::Dataset,
    stimulus_index: hdf5::Dataset,
    phase: hdf5::Dataset,
    height: usize,
    width: usize,
}

/// Recorder for one trial of one direction.
pub struct TrialRecorder {
    file: hdf5::File,
    datasets: Option<Datasets>,
    document: TrialDocument,
    h5_path: PathBuf,
    json_path: PathBuf,
    frames_written: u64,
    first_timestamp_ns: Option<u64>,
    last_timestamp_ns: Option<u64>,
}

impl TrialRecorder {
    /// Create the HDF5 file and JSON sibling for one trial.
    pub fn create(
        h5_path: &Path,
        json_path: &Path,
        session_id: &str,
        direction: &str,
        trial: u32,
        parameters: BTreeMap<String, ParamMap>,
        timestamp_source: &str,
    ) -> IsiResult<Self> {
        if let Some(parent) = h5_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = hdf5::File::create(h5_path)
            .map_err(|e| IsiError::RecorderIoFailed(e.to_string()))?;

        let phase_legend = [
            RecordPhase::BaselineInitial,
            RecordPhase::Stimulus,
            RecordPhase::InterTrial,
            RecordPhase::BaselineFinal,
        ]
        .iter()
        .map(|p| (p.code(), p.as_str().to_string()))
        .collect();

        let document = TrialDocument {
            schema_version: TRIAL_SCHEMA_VERSION,
            session_id: session_id.to_string(),
            direction: direction.to_string(),
            trial,
            started_at: Utc::now().to_rfc3339(),
            status: TrialStatus::Recording,
            timestamp_source: timestamp_source.to_string(),
            parameters,
            phase_legend,
            events: Vec::new(),
            manifest: None,
        };

        let recorder = Self {
            file,
            datasets: None,
            document,
            h5_path: h5_path.to_path_buf(),
            json_path: json_path.to_path_buf(),
            frames_written: 0,
            first_timestamp_ns: None,
            last_timestamp_ns: None,
        };
        recorder.write_json()?;
        debug!(path = %h5_path.display(), "trial recorder opened");
        Ok(recorder)
    }

    /// Append one camera frame with its cross-references.
    ///
    /// `stimulus_frame_index` is the index of the stimulus frame on screen
    /// at capture time, or `None` outside stimulus phases (stored as -1).
    pub fn write_camera_frame(
        &mut self,
        record: &CameraFrameRecord<'_>,
        stimulus_frame_index: Option<u64>,
        phase: RecordPhase,
    ) -> IsiResult<()> {
        let (h, w) = (record.height as usize, record.width as usize);
        if self.datasets.is_none() {
            self.datasets = Some(self.create_datasets(h, w)?);
        }
        let datasets = match self.datasets.as_ref() {
            Some(d) => d,
            None => return Err(IsiError::RecorderIoFailed("datasets unavailable".into())),
        };
        if (h, w) != (datasets.height, datasets.width) {
            return Err(IsiError::RecorderIoFailed(format!(
                "frame shape changed mid-trial: {h}x{w} vs {}x{}",
                datasets.height, datasets.width
            )));
        }

        let n = self.frames_written as usize;
        let frame = Array2::from_shape_vec((h, w), record.data.to_vec())
            .map_err(|e| IsiError::RecorderIoFailed(e.to_string()))?;

        let io = |e: hdf5::Error| IsiError::RecorderIoFailed(e.to_string());
        datasets.frames.resize((n + 1, h, w)).map_err(io)?;
        datasets
            .frames
            .write_slice(frame.view(), s![n, .., ..])
            .map_err(io)?;

        datasets.timestamps.resize(n + 1).map_err(io)?;
        datasets
            .timestamps
            .write_slice(&arr1(&[record.capture_timestamp_ns]), s![n..n + 1])
            .map_err(io)?;

        let stim = stimulus_frame_index.map(|v| v as i64).unwrap_or(-1);
        datasets.stimulus_index.resize(n + 1).map_err(io)?;
        datasets
            .stimulus_index
            .write_slice(&arr1(&[stim]), s![n..n + 1])
            .map_err(io)?;

        datasets.phase.resize(n + 1).map_err(io)?;
        datasets
            .phase
            .write_slice(&arr1(&[phase.code()]), s![n..n + 1])
            .map_err(io)?;

        self.frames_written += 1;
        self.first_timestamp_ns
            .get_or_insert(record.capture_timestamp_ns);
        self.last_timestamp_ns = Some(record.capture_timestamp_ns);
        Ok(())
    }

    /// Append one stimulus display event to the JSON log.
    pub fn write_stimulus_event(&mut self, event: DisplayEvent) {
        self.document.events.push(event);
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Timestamp of the most recent frame.
    pub fn last_timestamp_ns(&self) -> Option<u64> {
        self.last_timestamp_ns
    }

    /// Sync the HDF5 file and rewrite the JSON sibling.
    pub fn flush(&mut self) -> IsiResult<()> {
        self.file
            .flush()
            .map_err(|e| IsiError::RecorderIoFailed(e.to_string()))?;
        self.write_json()
    }

    /// Finalize: flush, close the HDF5 handle, and write the integrity
    /// manifest. `complete` selects the recorded status; incomplete trials
    /// keep all data and are marked as such.
    pub fn close(mut self, complete: bool) -> IsiResult<TrialManifest> {
        self.file
            .flush()
            .map_err(|e| IsiError::RecorderIoFailed(e.to_string()))?;
        self.datasets = None;

        // Release the handle before hashing the file.
        let Self {
            file,
            mut document,
            h5_path,
            json_path,
            frames_written,
            first_timestamp_ns,
            last_timestamp_ns,
            ..
        } = self;
        drop(file);

        let manifest = TrialManifest {
            camera_frames: frames_written,
            stimulus_events: document.events.len() as u64,
            first_timestamp_ns,
            last_timestamp_ns,
            hdf5_sha256: sha256_of_file(&h5_path)?,
        };

        document.status = if complete {
            TrialStatus::Complete
        } else {
            TrialStatus::Incomplete
        };
        document.manifest = Some(manifest.clone());
        write_trial_json(&json_path, &document)?;

        info!(
            path = %h5_path.display(),
            frames = manifest.camera_frames,
            complete,
            "trial recorder closed"
        );
        Ok(manifest)
    }

    fn create_datasets(&self, height: usize, width: usize) -> IsiResult<Datasets> {
        let io = |e: hdf5::Error| IsiError::RecorderIoFailed(e.to_string());

        let frames = self
            .file
            .new_dataset::<u8>()
            .shape((0.., height, width))
            .chunk((1, height, width))
            .create("frames")
            .map_err(io)?;
        let timestamps = self
            .file
            .new_dataset::<u64>()
            .shape(0..)
            .chunk(1024)
            .create("timestamps_ns")
            .map_err(io)?;
        let stimulus_index = self
            .file
            .new_dataset::<i64>()
            .shape(0..)
            .chunk(1024)
            .create("stimulus_frame_index")
            .map_err(io)?;
        let phase = self
            .file
            .new_dataset::<u8>()
            .shape(0..)
            .chunk(1024)
            .create("phase")
            .map_err(io)?;

        Ok(Datasets {
            frames,
            timestamps,
            stimulus_index,
            phase,
            height,
            width,
        })
    }

    fn write_json(&self) -> IsiResult<()> {
        write_trial_json(&self.json_path, &self.document)
    }
}

fn write_trial_json(path: &Path, document: &TrialDocument) -> IsiResult<()> {
    let json = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn sha256_of_file(path: &Path) -> IsiResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Ix3;
    use tempfile::tempdir;

    fn record(data: &[u8], side: u32, ts: u64) -> CameraFrameRecord<'_> {
        CameraFrameRecord {
            data,
            width: side,
            height: side,
            capture_timestamp_ns: ts,
            timestamp_source: "hardware",
        }
    }

    fn open(dir: &Path) -> TrialRecorder {
        TrialRecorder::create(
            &dir.join("LR_trial_000.h5"),
            &dir.join("LR_trial_000_events.json"),
            "session-1",
            "LR",
            0,
            BTreeMap::new(),
            "hardware",
        )
        .unwrap()
    }

    #[test]
    fn frames_and_crossrefs_append_in_order() {
        let dir = tempdir().unwrap();
        let mut recorder = open(dir.path());

        let frame = vec![5u8; 16];
        recorder
            .write_camera_frame(&record(&frame, 4, 1_000), None, RecordPhase::BaselineInitial)
            .unwrap();
        recorder
            .write_camera_frame(&record(&frame, 4, 2_000), Some(7), RecordPhase::Stimulus)
            .unwrap();
        let manifest = recorder.close(true).unwrap();
        assert_eq!(manifest.camera_frames, 2);
        assert_eq!(manifest.first_timestamp_ns, Some(1_000));
        assert_eq!(manifest.last_timestamp_ns, Some(2_000));

        let file = hdf5::File::open(dir.path().join("LR_trial_000.h5")).unwrap();
        let frames = file
            .dataset("frames")
            .unwrap()
            .read_dyn::<u8>()
            .unwrap()
            .into_dimensionality::<Ix3>()
            .unwrap();
        assert_eq!(frames.shape(), &[2, 4, 4]);

        let ts = file
            .dataset("timestamps_ns")
            .unwrap()
            .read_1d::<u64>()
            .unwrap();
        assert_eq!(ts.to_vec(), vec![1_000, 2_000]);

        let stim = file
            .dataset("stimulus_frame_index")
            .unwrap()
            .read_1d::<i64>()
            .unwrap();
        assert_eq!(stim.to_vec(), vec![-1, 7]);

        let phase = file.dataset("phase").unwrap().read_1d::<u8>().unwrap();
        assert_eq!(phase.to_vec(), vec![0, 1]);
    }

    #[test]
    fn events_and_manifest_land_in_json() {
        let dir = tempdir().unwrap();
        let mut recorder = open(dir.path());

        recorder.write_stimulus_event(DisplayEvent {
            frame_index: 0,
            direction: "LR".into(),
            angle_degrees: -40.0,
            publish_timestamp_ns: 10,
        });
        let frame = vec![1u8; 4];
        recorder
            .write_camera_frame(&record(&frame, 2, 5), Some(0), RecordPhase::Stimulus)
            .unwrap();
        recorder.close(true).unwrap();

        let text = fs::read_to_string(dir.path().join("LR_trial_000_events.json")).unwrap();
        let doc: TrialDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(doc.status, TrialStatus::Complete);
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].angle_degrees, -40.0);

        let manifest = doc.manifest.unwrap();
        assert_eq!(manifest.camera_frames, 1);
        assert_eq!(manifest.stimulus_events, 1);
        assert_eq!(manifest.hdf5_sha256.len(), 64);
    }

    #[test]
    fn incomplete_close_preserves_data() {
        let dir = tempdir().unwrap();
        let mut recorder = open(dir.path());
        let frame = vec![9u8; 4];
        recorder
            .write_camera_frame(&record(&frame, 2, 77), None, RecordPhase::InterTrial)
            .unwrap();
        recorder.close(false).unwrap();

        let text = fs::read_to_string(dir.path().join("LR_trial_000_events.json")).unwrap();
        let doc: TrialDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(doc.status, TrialStatus::Incomplete);
        assert_eq!(doc.manifest.unwrap().camera_frames, 1);

        let file = hdf5::File::open(dir.path().join("LR_trial_000.h5")).unwrap();
        assert_eq!(file.dataset("timestamps_ns").unwrap().size(), 1);
    }

    #[test]
    fn frame_shape_change_is_an_error() {
        let dir = tempdir().unwrap();
        let mut recorder = open(dir.path());
        let a = vec![0u8; 16];
        let b = vec![0u8; 4];
        recorder
            .write_camera_frame(&record(&a, 4, 1), None, RecordPhase::Stimulus)
            .unwrap();
        let err = recorder
            .write_camera_frame(&record(&b, 2, 2), None, RecordPhase::Stimulus)
            .unwrap_err();
        assert!(matches!(err, IsiError::RecorderIoFailed(_)));
    }
}
