use anyhow::Result;

use super::params::{ParamSpec, StageParams};
use crate::detect::DetectionResult;
use crate::frame::Frame;

/// One image-processing step.
///
/// A stage mutates the frame it is handed (or swaps its buffer) and may report
/// detections. The pipeline calls `execute` on a private copy, so an error
/// leaves the chain's frame exactly as the previous stage produced it.
pub trait Stage: Send {
    /// Capability name, also the key used by `StageFactory`.
    fn type_name(&self) -> &'static str;

    /// Declared parameters. Values are kept by the pipeline, not the stage.
    fn schema(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        params: &StageParams,
        ctx: &mut StageContext<'_>,
    ) -> Result<()>;
}

/// Per-run state visible to every stage.
pub struct StageContext<'a> {
    original: &'a Frame,
    detections: Vec<DetectionResult>,
}

impl<'a> StageContext<'a> {
    pub fn new(original: &'a Frame) -> Self {
        Self {
            original,
            detections: Vec::new(),
        }
    }

    /// Frame the pipeline was run on, before any stage.
    pub fn original(&self) -> &Frame {
        self.original
    }

    pub fn report(&mut self, detection: DetectionResult) {
        self.detections.push(detection);
    }

    pub(crate) fn take_detections(&mut self) -> Vec<DetectionResult> {
        std::mem::take(&mut self.detections)
    }
}
