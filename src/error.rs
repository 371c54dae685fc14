//! Custom error types for the acquisition backend.
//!
//! This module defines the primary error type, `IsiError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure kinds that can occur, from
//! parameter validation to camera capture and recording I/O.
//!
//! Every error carries a [`Severity`]: `Fatal` errors end the current
//! acquisition session (with data preserved), `Recoverable` errors are
//! surfaced to the caller and leave the session running. The orchestrator
//! uses this classification to choose between its error-recovery path and a
//! plain command failure.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type IsiResult<T> = std::result::Result<T, IsiError>;

/// Session-level impact of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Ends the current session; recorded data is flushed and preserved.
    Fatal,
    /// Reported to the caller; the system keeps running.
    Recoverable,
}

/// Application error type covering every component of the backend.
#[derive(Error, Debug)]
pub enum IsiError {
    // --- Parameter store ---
    /// A required key has no value in the live store.
    #[error("Required parameter is not set: {group}.{key}")]
    ConfigMissing {
        /// Parameter group name.
        group: String,
        /// Key within the group.
        key: String,
    },

    /// An update was rejected by the group descriptor before mutation.
    #[error("Parameter validation failed: {0}")]
    ValidationFailed(String),

    /// A frontend update touched a hardware-capability field.
    #[error("Field is not user-editable: {group}.{key}")]
    FieldNotUserEditable {
        /// Parameter group name.
        group: String,
        /// Key within the group.
        key: String,
    },

    /// The named parameter group does not exist.
    #[error("Unknown parameter group: {0}")]
    UnknownGroup(String),

    // --- Stimulus library ---
    /// Generation inputs are unset or out of range.
    #[error("Stimulus generation parameters missing or invalid: {0}")]
    ParametersMissing(String),

    /// Sweep generation failed.
    #[error("Stimulus pre-generation failed: {0}")]
    GenerationFailed(String),

    /// An on-disk library was generated under different parameters.
    #[error("Stimulus library fingerprint mismatch: expected {expected}, found {found}")]
    LibraryFingerprintMismatch {
        /// Fingerprint of the currently effective parameters.
        expected: String,
        /// Fingerprint recorded in the on-disk library.
        found: String,
    },

    // --- Presentation player ---
    /// Only one direction may play at a time.
    #[error("A stimulus direction is already playing")]
    AlreadyPlaying,

    /// Stop or query issued while idle.
    #[error("No stimulus direction is playing")]
    NotPlaying,

    /// Direction string is not one of LR/RL/TB/BT.
    #[error("Unknown stimulus direction: {0}")]
    UnknownDirection(String),

    /// The library has no frames for the requested direction.
    #[error("Stimulus library is not ready")]
    EmptyLibrary,

    /// Monitor FPS must be positive to schedule frames.
    #[error("Monitor FPS must be positive, got {0}")]
    InvalidFps(f64),

    // --- Camera ---
    /// No device has been selected in the `camera` group.
    #[error("No camera selected")]
    NoCameraSelected,

    /// Device open failed.
    #[error("Failed to open camera: {0}")]
    OpenFailed(String),

    /// A device read failed mid-stream.
    #[error("Camera capture failed: {0}")]
    CaptureFailed(String),

    /// The device reports no hardware timestamp and development mode is off.
    #[error("Camera provides no hardware timestamp and development mode is off")]
    HardwareTimestampUnavailable,

    // --- Recorder ---
    /// Disk write failure during a recording phase.
    #[error("Recorder I/O failed: {0}")]
    RecorderIoFailed(String),

    // --- Frame bus ---
    /// Shared-memory publish failure.
    #[error("Frame publish failed: {0}")]
    PublishFailed(String),

    // --- Startup handshake ---
    /// A required subscriber has not confirmed; `ready` is blocked.
    #[error("Subscriber not ready: {0}")]
    SubscriberNotReady(String),

    // --- Wrapped lower layers ---
    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 library error.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IsiError {
    /// Classify the session-level impact of this error.
    pub fn severity(&self) -> Severity {
        match self {
            IsiError::CaptureFailed(_)
            | IsiError::HardwareTimestampUnavailable
            | IsiError::RecorderIoFailed(_)
            | IsiError::Io(_)
            | IsiError::Hdf5(_) => Severity::Fatal,

            IsiError::ConfigMissing { .. }
            | IsiError::ValidationFailed(_)
            | IsiError::FieldNotUserEditable { .. }
            | IsiError::UnknownGroup(_)
            | IsiError::ParametersMissing(_)
            | IsiError::GenerationFailed(_)
            | IsiError::LibraryFingerprintMismatch { .. }
            | IsiError::AlreadyPlaying
            | IsiError::NotPlaying
            | IsiError::UnknownDirection(_)
            | IsiError::EmptyLibrary
            | IsiError::InvalidFps(_)
            | IsiError::NoCameraSelected
            | IsiError::OpenFailed(_)
            | IsiError::PublishFailed(_)
            | IsiError::SubscriberNotReady(_)
            | IsiError::Json(_) => Severity::Recoverable,
        }
    }

    /// True if this error must end the current acquisition session.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_failure_is_fatal() {
        let err = IsiError::CaptureFailed("device unplugged".into());
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(err.is_fatal());
    }

    #[test]
    fn precondition_errors_are_recoverable() {
        assert_eq!(IsiError::AlreadyPlaying.severity(), Severity::Recoverable);
        assert_eq!(IsiError::InvalidFps(0.0).severity(), Severity::Recoverable);
        assert_eq!(
            IsiError::ConfigMissing {
                group: "monitor".into(),
                key: "distance_cm".into()
            }
            .severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn messages_name_the_offending_field() {
        let err = IsiError::FieldNotUserEditable {
            group: "camera".into(),
            key: "fps".into(),
        };
        assert!(err.to_string().contains("camera.fps"));
    }
}
