//! Runtime-editable processing pipelines.
//!
//! A `Pipeline` is an ordered list of stage slots behind one mutex. `run`
//! holds the mutex for the whole pass, and every edit takes it too, so a run
//! sees the stage list either entirely before or entirely after an edit.
//!
//! This module is responsible for:
//! - Executing enabled stages in order, each on a private copy of the frame
//! - Absorbing stage errors (the stage becomes a no-op for that frame)
//! - Capturing the observed frame after the observer stage
//! - Validating parameter edits against each stage's declared schema
//! - Converting to and from `PipelineDefinition`
//!
//! Stage construction happens before the lock is taken.

mod definition;
mod factory;
mod params;
mod stage;
pub mod stages;
mod store;

use anyhow::anyhow;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::detect::DetectionResult;
use crate::error::{VisionError, VisionResult};
use crate::frame::Frame;

pub use definition::{ParamEntry, PipelineDefinition, StageConfig};
pub use factory::StageFactory;
pub use params::{ParamSpec, ParamValue, StageParams};
pub use stage::{Stage, StageContext};
pub use store::PipelineStore;

/// Direction for `move_stage`. `Up` moves toward index 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

impl MoveDirection {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "up" => Some(MoveDirection::Up),
            "down" => Some(MoveDirection::Down),
            _ => None,
        }
    }
}

/// Result of one pipeline pass.
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    pub output: Frame,
    /// Frame right after the observer stage, or `output` when none is set.
    pub observed: Frame,
    pub detections: Vec<DetectionResult>,
    /// Indices of stages that failed and were skipped.
    pub failed_stages: Vec<usize>,
}

struct StageSlot {
    stage: Box<dyn Stage>,
    schema: Vec<ParamSpec>,
    params: StageParams,
    enabled: bool,
}

impl StageSlot {
    fn new(stage: Box<dyn Stage>) -> Self {
        let schema = stage.schema();
        let params = StageParams::from_schema(&schema);
        Self {
            stage,
            schema,
            params,
            enabled: true,
        }
    }

    fn type_name(&self) -> &'static str {
        self.stage.type_name()
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> VisionResult<()> {
        let spec = self
            .schema
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| VisionError::unknown("parameter", name))?;
        let accepted = spec
            .accept(value.clone())
            .ok_or_else(|| VisionError::ParameterOutOfRange {
                stage: self.type_name().to_string(),
                parameter: name.to_string(),
                value: value.to_string(),
            })?;
        self.params.replace(name, accepted);
        Ok(())
    }

    fn to_config(&self) -> StageConfig {
        StageConfig {
            type_name: self.type_name().to_string(),
            enabled: self.enabled,
            params: self
                .params
                .iter()
                .map(|(name, value)| ParamEntry {
                    name: name.to_string(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

struct PipelineInner {
    stages: Vec<StageSlot>,
    observer: Option<usize>,
}

impl PipelineInner {
    fn check_index(&self, index: usize) -> VisionResult<()> {
        if index >= self.stages.len() {
            return Err(VisionError::IndexOutOfRange {
                index,
                len: self.stages.len(),
            });
        }
        Ok(())
    }
}

pub struct Pipeline {
    name: String,
    factory: Arc<StageFactory>,
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    pub fn new(name: &str, factory: Arc<StageFactory>) -> Self {
        Self {
            name: name.to_string(),
            factory,
            inner: Mutex::new(PipelineInner {
                stages: Vec::new(),
                observer: None,
            }),
        }
    }

    /// Build a pipeline from its durable form.
    ///
    /// Parameters missing from the definition keep their declared defaults.
    pub fn from_definition(def: &PipelineDefinition, factory: Arc<StageFactory>) -> VisionResult<Self> {
        let mut stages = Vec::with_capacity(def.stages.len());
        for config in &def.stages {
            let mut slot = StageSlot::new(factory.create(&config.type_name)?);
            for entry in &config.params {
                slot.set_param(&entry.name, entry.value.clone())?;
            }
            slot.enabled = config.enabled;
            stages.push(slot);
        }
        Ok(Self {
            name: def.name.clone(),
            factory,
            inner: Mutex::new(PipelineInner {
                stages,
                observer: None,
            }),
        })
    }

    pub fn to_definition(&self) -> VisionResult<PipelineDefinition> {
        let inner = self.lock()?;
        Ok(PipelineDefinition {
            name: self.name.clone(),
            stages: inner.stages.iter().map(StageSlot::to_config).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &Arc<StageFactory> {
        &self.factory
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.stages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stage_types(&self) -> VisionResult<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .stages
            .iter()
            .map(|slot| slot.type_name().to_string())
            .collect())
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Insert a new stage at `position` (None appends). Returns its index.
    pub fn add_stage(&self, type_name: &str, position: Option<usize>) -> VisionResult<usize> {
        let slot = StageSlot::new(self.factory.create(type_name)?);
        let mut inner = self.lock()?;
        let len = inner.stages.len();
        let index = position.unwrap_or(len);
        if index > len {
            return Err(VisionError::IndexOutOfRange { index, len });
        }
        inner.stages.insert(index, slot);
        if let Some(observer) = inner.observer {
            if index <= observer {
                inner.observer = Some(observer + 1);
            }
        }
        log::info!("pipeline {}: added {} at {}", self.name, type_name, index);
        Ok(index)
    }

    pub fn remove_stage(&self, index: usize) -> VisionResult<()> {
        let mut inner = self.lock()?;
        inner.check_index(index)?;
        let removed = inner.stages.remove(index);
        inner.observer = match inner.observer {
            Some(observer) if observer == index => None,
            Some(observer) if observer > index => Some(observer - 1),
            other => other,
        };
        log::info!(
            "pipeline {}: removed {} at {}",
            self.name,
            removed.type_name(),
            index
        );
        Ok(())
    }

    /// Swap a stage with its neighbour. Returns the stage's new index.
    pub fn move_stage(&self, index: usize, direction: MoveDirection) -> VisionResult<usize> {
        let mut inner = self.lock()?;
        inner.check_index(index)?;
        let len = inner.stages.len();
        let target = match direction {
            MoveDirection::Up => index.checked_sub(1),
            MoveDirection::Down => Some(index + 1).filter(|t| *t < len),
        }
        .ok_or(VisionError::IndexOutOfRange {
            index: if direction == MoveDirection::Up { 0 } else { len },
            len,
        })?;
        inner.stages.swap(index, target);
        inner.observer = match inner.observer {
            Some(observer) if observer == index => Some(target),
            Some(observer) if observer == target => Some(index),
            other => other,
        };
        Ok(target)
    }

    pub fn set_parameter(&self, index: usize, name: &str, value: ParamValue) -> VisionResult<()> {
        let mut inner = self.lock()?;
        inner.check_index(index)?;
        inner.stages[index].set_param(name, value)
    }

    /// Parameter values of one stage, in declaration order.
    pub fn parameters(&self, index: usize) -> VisionResult<Vec<(String, ParamValue)>> {
        let inner = self.lock()?;
        inner.check_index(index)?;
        Ok(inner.stages[index]
            .params
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect())
    }

    pub fn schema(&self, index: usize) -> VisionResult<Vec<ParamSpec>> {
        let inner = self.lock()?;
        inner.check_index(index)?;
        Ok(inner.stages[index].schema.clone())
    }

    pub fn set_stage_enabled(&self, index: usize, enabled: bool) -> VisionResult<()> {
        let mut inner = self.lock()?;
        inner.check_index(index)?;
        inner.stages[index].enabled = enabled;
        Ok(())
    }

    /// Expose the frame produced by stage `index`. None clears it.
    pub fn set_observer(&self, index: Option<usize>) -> VisionResult<()> {
        let mut inner = self.lock()?;
        if let Some(index) = index {
            inner.check_index(index)?;
        }
        inner.observer = index;
        Ok(())
    }

    pub fn observer(&self) -> Option<usize> {
        self.lock().ok().and_then(|inner| inner.observer)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    pub fn run(&self, input: &Frame) -> VisionResult<PipelineOutput> {
        let mut inner = self.lock()?;
        let observer = inner.observer;
        let mut frame = input.clone();
        let mut observed = None;
        let mut detections = Vec::new();
        let mut failed_stages = Vec::new();

        for (index, slot) in inner.stages.iter_mut().enumerate() {
            if slot.enabled {
                let mut working = frame.clone();
                let mut ctx = StageContext::new(input);
                // Panics count as stage failures and leave the lock unpoisoned.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    slot.stage.execute(&mut working, &slot.params, &mut ctx)
                }))
                .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(&*payload))));
                match outcome {
                    Ok(()) => {
                        frame = working;
                        detections.append(&mut ctx.take_detections());
                    }
                    Err(err) => {
                        let failure = VisionError::StageExecutionFailed {
                            index,
                            stage: slot.type_name().to_string(),
                            reason: err.to_string(),
                        };
                        log::warn!("pipeline {}: {}", self.name, failure);
                        failed_stages.push(index);
                    }
                }
            }
            if observer == Some(index) {
                observed = Some(frame.clone());
            }
        }
        drop(inner);

        let observed = observed.unwrap_or_else(|| frame.clone());
        Ok(PipelineOutput {
            output: frame,
            observed,
            detections,
            failed_stages,
        })
    }

    fn lock(&self) -> VisionResult<MutexGuard<'_, PipelineInner>> {
        self.inner
            .lock()
            .map_err(|_| VisionError::LockPoisoned("pipeline"))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_types().unwrap_or_default())
            .field("observer", &self.observer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn factory() -> Arc<StageFactory> {
        let mut factory = StageFactory::with_builtin_stages();
        factory.register::<FailingStage>();
        factory.register::<PanickingStage>();
        Arc::new(factory)
    }

    #[derive(Default)]
    struct PanickingStage;

    impl Stage for PanickingStage {
        fn type_name(&self) -> &'static str {
            "Panicking"
        }

        fn execute(
            &mut self,
            frame: &mut Frame,
            _: &StageParams,
            _: &mut StageContext<'_>,
        ) -> anyhow::Result<()> {
            frame.pixels_mut().fill(9);
            panic!("stage bug");
        }
    }

    #[derive(Default)]
    struct FailingStage;

    impl Stage for FailingStage {
        fn type_name(&self) -> &'static str {
            "Failing"
        }

        fn execute(
            &mut self,
            frame: &mut Frame,
            _: &StageParams,
            _: &mut StageContext<'_>,
        ) -> anyhow::Result<()> {
            // Scribble first so a leaked partial write would be visible.
            frame.pixels_mut().fill(7);
            Err(anyhow!("boom"))
        }
    }

    #[test]
    fn edits_apply_in_order() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        p.add_stage("Gray", None)?;
        p.add_stage("Blur", None)?;
        p.add_stage("Invert", Some(0))?;
        assert_eq!(p.stage_types()?, vec!["Invert", "Gray", "Blur"]);
        assert_eq!(p.move_stage(2, MoveDirection::Up)?, 1);
        assert_eq!(p.stage_types()?, vec!["Invert", "Blur", "Gray"]);
        p.remove_stage(0)?;
        assert_eq!(p.stage_types()?, vec!["Blur", "Gray"]);
        Ok(())
    }

    #[test]
    fn out_of_range_edits_leave_state_unchanged() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        for _ in 0..3 {
            p.add_stage("Invert", None)?;
        }
        let before = p.to_definition()?;
        assert_eq!(p.remove_stage(5).unwrap_err().code(), "IndexOutOfRange");
        assert_eq!(p.set_observer(Some(3)).unwrap_err().code(), "IndexOutOfRange");
        assert_eq!(
            p.move_stage(0, MoveDirection::Up).unwrap_err().code(),
            "IndexOutOfRange"
        );
        assert_eq!(p.add_stage("Gray", Some(9)).unwrap_err().code(), "IndexOutOfRange");
        assert_eq!(p.add_stage("Sobel", None).unwrap_err().code(), "UnknownStageType");
        assert_eq!(p.to_definition()?, before);
        Ok(())
    }

    #[test]
    fn parameter_validation() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        p.add_stage("Threshold", None)?;
        p.set_parameter(0, "min", ParamValue::Int(10))?;

        let err = p.set_parameter(0, "min", ParamValue::Int(300)).unwrap_err();
        assert_eq!(err.code(), "ParameterOutOfRange");
        let err = p.set_parameter(0, "min", ParamValue::Str("ten".into())).unwrap_err();
        assert_eq!(err.code(), "ParameterOutOfRange");
        let err = p.set_parameter(0, "gain", ParamValue::Int(1)).unwrap_err();
        assert_eq!(err.code(), "UnknownName");

        assert_eq!(
            p.parameters(0)?,
            vec![
                ("min".to_string(), ParamValue::Int(10)),
                ("max".to_string(), ParamValue::Int(255)),
            ]
        );
        Ok(())
    }

    #[test]
    fn observer_captures_intermediate_frame() -> VisionResult<()> {
        let p = Pipeline::new("P1", factory());
        p.add_stage("Gray", None)?;
        p.add_stage("Threshold", None)?;
        p.set_parameter(1, "min", ParamValue::Int(10))?;
        p.set_observer(Some(0))?;

        let input = Frame::new(2, 1, PixelFormat::Rgb8, vec![0, 0, 0, 200, 200, 200]).unwrap();
        let out = p.run(&input)?;
        assert_eq!(out.observed.format(), PixelFormat::Gray8);
        assert_eq!(out.observed.pixels(), &[0, 200]);
        assert_eq!(out.output.pixels(), &[0, 255]);

        p.set_observer(None)?;
        let out = p.run(&input)?;
        assert!(out.observed.same_image(&out.output));
        Ok(())
    }

    #[test]
    fn failing_stage_is_skipped() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        p.add_stage("Invert", None)?;
        p.add_stage("Failing", None)?;
        p.add_stage("Invert", None)?;

        let input = Frame::filled(2, 2, PixelFormat::Gray8, 30);
        let out = p.run(&input)?;
        assert_eq!(out.failed_stages, vec![1]);
        assert!(out.output.same_image(&input));
        assert_eq!(input.pixels(), &[30; 4]);
        Ok(())
    }

    #[test]
    fn panicking_stage_is_skipped_and_lock_survives() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        p.add_stage("Invert", None)?;
        p.add_stage("Panicking", None)?;

        let input = Frame::filled(2, 2, PixelFormat::Gray8, 30);
        for _ in 0..2 {
            let out = p.run(&input)?;
            assert_eq!(out.failed_stages, vec![1]);
            assert_eq!(out.output.pixels(), &[225; 4]);
        }
        assert_eq!(p.add_stage("Gray", None)?, 2);
        assert_eq!(p.to_definition()?.stages.len(), 3);
        Ok(())
    }

    #[test]
    fn disabled_stage_is_skipped() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        p.add_stage("Invert", None)?;
        p.set_stage_enabled(0, false)?;
        let input = Frame::filled(1, 1, PixelFormat::Gray8, 1);
        assert!(p.run(&input)?.output.same_image(&input));
        Ok(())
    }

    #[test]
    fn observer_follows_its_stage() -> VisionResult<()> {
        let p = Pipeline::new("p", factory());
        for name in ["Gray", "Blur", "Invert"] {
            p.add_stage(name, None)?;
        }
        p.set_observer(Some(1))?;
        p.move_stage(1, MoveDirection::Down)?;
        assert_eq!(p.observer(), Some(2));
        p.add_stage("Invert", Some(0))?;
        assert_eq!(p.observer(), Some(3));
        p.remove_stage(0)?;
        assert_eq!(p.observer(), Some(2));
        p.remove_stage(2)?;
        assert_eq!(p.observer(), None);
        Ok(())
    }

    #[test]
    fn definition_round_trip_is_exact() -> VisionResult<()> {
        let def = PipelineDefinition::new("p")
            .with_stage(StageConfig::new("Gray").disabled())
            .with_stage(
                StageConfig::new("Threshold")
                    .with_param("min", 10i64)
                    .with_param("max", 90i64),
            )
            .with_stage(
                StageConfig::new("Centroid")
                    .with_param("min_intensity", 200i64)
                    .with_param("min_pixels", 4i64)
                    .with_param("target", "buoy"),
            );
        let p = Pipeline::from_definition(&def, factory())?;
        assert_eq!(p.to_definition()?, def);

        let rebuilt = Pipeline::from_definition(&p.to_definition()?, factory())?;
        assert_eq!(rebuilt.to_definition()?, def);
        Ok(())
    }

    #[test]
    fn definition_with_bad_value_is_rejected() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageConfig::new("Threshold").with_param("min", 999i64));
        let err = Pipeline::from_definition(&def, factory()).unwrap_err();
        assert_eq!(err.code(), "ParameterOutOfRange");
    }
}
