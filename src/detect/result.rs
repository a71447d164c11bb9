use serde::{Deserialize, Serialize};
use std::fmt;

/// One object found by a pipeline run.
///
/// Coordinates are in pixels of the frame the pipeline produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Target identifier (e.g. "buoy", "pipe").
    pub target: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Orientation in degrees.
    pub angle: f32,
    /// Free-form annotation supplied by the stage.
    pub annotation: String,
}

impl DetectionResult {
    pub fn new(target: impl Into<String>, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            target: target.into(),
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }

    pub fn with_angle(mut self, angle: f32) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    /// Publish format: `target:x,y,width,height,angle,annotation;` per result.
    pub fn encode_list(results: &[DetectionResult]) -> String {
        results.iter().map(|r| r.to_string()).collect()
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{},{},{},{},{};",
            self.target, self.x, self.y, self.width, self.height, self.angle, self.annotation
        )
    }
}
