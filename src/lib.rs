//! Vision Provider
//!
//! Perception front-end for an autonomous vehicle: cameras are turned into
//! frames, frames into processed images and detection results.
//!
//! # Architecture
//!
//! Data flows one way through four layers:
//!
//! 1. **Device**: a `DeviceHandle` serializes access to one camera or file
//!    source and owns its Closed/Open/Streaming/Error state.
//! 2. **Acquisition**: one `AcquisitionLoop` thread per device keeps only the
//!    latest frame and signals subscribers without ever blocking on them.
//! 3. **Pipeline**: an ordered, runtime-editable list of stages producing an
//!    output frame, an optional observed (debug) frame and detections.
//! 4. **Task**: one `ProcessingTask` thread per (device, pipeline) binding,
//!    processing the newest frame and skipping the ones it could not keep up
//!    with.
//!
//! Registries name every instance; `VisionContext` is the control surface on
//! top of them.
//!
//! # Module Structure
//!
//! - `frame`: copy-on-publish frame buffers
//! - `device`: driver contract, handle state machine, built-in devices
//! - `acquisition`: acquisition loops, notifications, recording
//! - `pipeline`: stages, parameters, definitions and their store
//! - `task`: processing tasks and result sinks
//! - `registry`: device, pipeline and task registries
//! - `context`: in-process control surface
//! - `config`: daemon configuration

pub mod acquisition;
pub mod config;
pub mod context;
pub mod detect;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod task;

pub use acquisition::{AcquisitionLoop, LoopState, LoopStats, NetpbmDirectorySink, RecordingSink};
pub use context::VisionContext;
pub use detect::DetectionResult;
pub use device::{
    DeviceConfig, DeviceDriver, DeviceHandle, DeviceKind, DeviceState, Feature, SyntheticDevice,
};
pub use error::{VisionError, VisionResult};
pub use frame::{Frame, PixelFormat};
pub use pipeline::{
    MoveDirection, ParamSpec, ParamValue, Pipeline, PipelineDefinition, PipelineOutput,
    PipelineStore, Stage, StageConfig, StageContext, StageFactory, StageParams,
};
pub use registry::{DeviceRegistry, PipelineRegistry, TaskRegistry};
pub use task::{
    ChannelResultSink, ImageOutput, LogResultSink, NullResultSink, OutputSelection,
    ProcessingTask, ResultSink, TaskDescriptor, TaskOutput, TaskState, TaskStats,
};
