//! Error taxonomy shared by devices, loops, pipelines and registries.
//!
//! Every control operation returns a `VisionResult`. The control surface
//! reports failures to external clients through `VisionError::code()`, which
//! is stable across releases.

use crate::device::DeviceState;

/// Result type for vision provider operations.
pub type VisionResult<T> = Result<T, VisionError>;

/// Errors that can occur while acquiring or processing frames.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    // Device boundary. Recoverable by re-opening the device.
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("acquisition failed on device {device}: {reason}")]
    AcquisitionFailed { device: String, reason: String },

    #[error("hardware fault on device {device}: {reason}")]
    HardwareFault { device: String, reason: String },

    #[error("device {device} does not support feature '{feature}'")]
    UnsupportedFeature { device: String, feature: String },

    #[error("device {device} cannot {operation} while {state:?}")]
    InvalidTransition {
        device: String,
        operation: &'static str,
        state: DeviceState,
    },

    // Pipeline mutation. Caller error, state is left unchanged.
    #[error("parameter '{parameter}' of stage {stage} rejects value {value}")]
    ParameterOutOfRange {
        stage: String,
        parameter: String,
        value: String,
    },

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unknown stage type '{0}'")]
    UnknownStageType(String),

    // Registries.
    #[error("task '{0}' is already running")]
    DuplicateTask(String),

    #[error("unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },

    #[error("{kind} '{name}' is in use by {holder}")]
    ResourceBusy {
        kind: &'static str,
        name: String,
        holder: String,
    },

    // Absorbed by the pipeline; surfaced only through logs and stats.
    #[error("stage {index} ({stage}) failed: {reason}")]
    StageExecutionFailed {
        index: usize,
        stage: String,
        reason: String,
    },

    #[error("failed to start {what}: {reason}")]
    StartFailed { what: String, reason: String },

    #[error("{0} thread panicked")]
    WorkerPanicked(String),

    #[error("pipeline store error: {0}")]
    Storage(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl VisionError {
    /// Stable taxonomy code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            VisionError::DeviceUnavailable { .. } => "DeviceUnavailable",
            VisionError::AcquisitionFailed { .. } => "AcquisitionFailed",
            VisionError::HardwareFault { .. } => "HardwareFault",
            VisionError::UnsupportedFeature { .. } => "UnsupportedFeature",
            VisionError::InvalidTransition { .. } => "InvalidTransition",
            VisionError::ParameterOutOfRange { .. } => "ParameterOutOfRange",
            VisionError::IndexOutOfRange { .. } => "IndexOutOfRange",
            VisionError::UnknownStageType(_) => "UnknownStageType",
            VisionError::DuplicateTask(_) => "DuplicateTask",
            VisionError::UnknownName { .. } => "UnknownName",
            VisionError::ResourceBusy { .. } => "ResourceBusy",
            VisionError::StageExecutionFailed { .. } => "StageExecutionFailed",
            VisionError::StartFailed { .. } => "StartFailed",
            VisionError::WorkerPanicked(_) => "WorkerPanicked",
            VisionError::Storage(_) => "Storage",
            VisionError::LockPoisoned(_) => "LockPoisoned",
        }
    }

    /// True for device-boundary failures that a re-open can clear.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            VisionError::DeviceUnavailable { .. }
                | VisionError::AcquisitionFailed { .. }
                | VisionError::HardwareFault { .. }
                | VisionError::UnsupportedFeature { .. }
        )
    }

    pub(crate) fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        VisionError::UnknownName {
            kind,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy_names() {
        let err = VisionError::IndexOutOfRange { index: 5, len: 3 };
        assert_eq!(err.code(), "IndexOutOfRange");
        assert_eq!(err.to_string(), "index 5 out of range (len 3)");

        let err = VisionError::unknown("pipeline", "P9");
        assert_eq!(err.code(), "UnknownName");
        assert!(!err.is_device_error());

        let err = VisionError::AcquisitionFailed {
            device: "front".into(),
            reason: "timeout".into(),
        };
        assert!(err.is_device_error());

        let err = VisionError::WorkerPanicked("task t".into());
        assert_eq!(err.code(), "WorkerPanicked");
        assert_eq!(err.to_string(), "task t thread panicked");
    }
}
