//! In-process control surface.
//!
//! `VisionContext` owns the three registries and exposes every operation an
//! external CLI or RPC layer needs. Starting a task acquires its resources in
//! the order name -> pipeline -> loop -> task and unwinds them in reverse on
//! failure. Stopping tears down task, then loop reference, then pipeline.

use std::sync::Arc;

use crate::device::{DeviceConfig, DeviceDriver, DeviceHandle, Feature, MAX_FRAME_RATE};
use crate::error::{VisionError, VisionResult};
use crate::pipeline::{
    MoveDirection, ParamValue, PipelineDefinition, PipelineStore, StageFactory,
};
use crate::registry::{DeviceRegistry, PipelineRegistry, TaskRegistry};
use crate::task::{
    LogResultSink, OutputSelection, ProcessingTask, ResultSink, TaskDescriptor,
};

pub struct VisionContext {
    devices: DeviceRegistry,
    pipelines: PipelineRegistry,
    tasks: TaskRegistry,
    default_sink: Arc<dyn ResultSink>,
}

impl VisionContext {
    pub fn new(store: PipelineStore, factory: StageFactory) -> Self {
        Self {
            devices: DeviceRegistry::new(),
            pipelines: PipelineRegistry::new(store, factory),
            tasks: TaskRegistry::new(),
            default_sink: Arc::new(LogResultSink),
        }
    }

    /// Sink used by `start_task`.
    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.default_sink = sink;
        self
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    // ------------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------------

    pub fn list_devices(&self) -> Vec<String> {
        self.devices.names()
    }

    pub fn list_pipelines(&self) -> VisionResult<Vec<String>> {
        self.pipelines.names()
    }

    pub fn list_tasks(&self) -> Vec<String> {
        self.tasks.names()
    }

    pub fn list_stage_types(&self) -> Vec<String> {
        self.pipelines.stage_types()
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub fn register_device(&self, config: DeviceConfig) -> VisionResult<Arc<DeviceHandle>> {
        self.devices.register_config(config)
    }

    pub fn register_device_with(
        &self,
        config: DeviceConfig,
        driver: Box<dyn DeviceDriver>,
    ) -> VisionResult<Arc<DeviceHandle>> {
        self.devices.register(config, driver)
    }

    pub fn get_feature(&self, device: &str, feature: &str) -> VisionResult<f32> {
        self.devices.get(device)?.get_feature_by_name(feature)
    }

    pub fn set_feature(&self, device: &str, feature: &str, value: f32) -> VisionResult<()> {
        let handle = self.devices.get(device)?;
        let is_rate = Feature::from_name(feature) == Some(Feature::Framerate);
        if is_rate && !(value.is_finite() && value >= 1.0 && value <= MAX_FRAME_RATE as f32) {
            return Err(VisionError::ParameterOutOfRange {
                stage: format!("device {}", device),
                parameter: Feature::Framerate.name().to_string(),
                value: value.to_string(),
            });
        }
        handle.set_feature_by_name(feature, value)?;
        // The loop owns pacing; keep it in step with the device's rate.
        if is_rate {
            if let Some(acquisition) = self.devices.loop_for(device) {
                acquisition.set_frame_rate(value.max(1.0).round() as u32);
            }
        }
        Ok(())
    }

    pub fn reopen_device(&self, device: &str) -> VisionResult<()> {
        self.devices.reopen(device)
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    pub fn start_task(&self, descriptor: TaskDescriptor) -> VisionResult<Arc<ProcessingTask>> {
        let sink = self.default_sink.clone();
        self.start_task_with_sink(descriptor, sink)
    }

    pub fn start_task_with_sink(
        &self,
        descriptor: TaskDescriptor,
        sink: Arc<dyn ResultSink>,
    ) -> VisionResult<Arc<ProcessingTask>> {
        let name = descriptor.name.clone();
        self.tasks.reserve(&name)?;
        match self.build_task(descriptor, sink) {
            Ok(task) => {
                let task = Arc::new(task);
                self.tasks.commit(task.clone())?;
                Ok(task)
            }
            Err(err) => {
                self.tasks.abandon(&name);
                log::error!("task {} failed to start: {}", name, err);
                Err(err)
            }
        }
    }

    fn build_task(
        &self,
        descriptor: TaskDescriptor,
        sink: Arc<dyn ResultSink>,
    ) -> VisionResult<ProcessingTask> {
        // Fail fast on an unknown device before claiming the pipeline.
        self.devices.get(&descriptor.device)?;
        let pipeline = self.pipelines.bind(&descriptor.pipeline, &descriptor.name)?;
        let acquisition = match self.devices.acquire_loop(&descriptor.device) {
            Ok(acquisition) => acquisition,
            Err(err) => {
                self.release_pipeline(&descriptor.pipeline, &descriptor.name);
                return Err(err);
            }
        };
        let device = descriptor.device.clone();
        let pipeline_name = descriptor.pipeline.clone();
        let task_name = descriptor.name.clone();
        ProcessingTask::start(descriptor, acquisition, pipeline, sink).map_err(|err| {
            self.release_loop(&device);
            self.release_pipeline(&pipeline_name, &task_name);
            err
        })
    }

    /// Stop a task, release its loop reference, then drop its pipeline.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub fn stop_task(&self, name: &str) -> VisionResult<()> {
        let task = self.tasks.take(name)?;
        let mut first_error: Option<VisionError> = None;
        if let Err(err) = task.stop() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.devices.release_loop(task.device_name()) {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.pipelines.release(task.pipeline_name(), name) {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn task_pipeline(&self, task: &str) -> VisionResult<String> {
        Ok(self.tasks.get(task)?.pipeline_name().to_string())
    }

    pub fn task_device(&self, task: &str) -> VisionResult<String> {
        Ok(self.tasks.get(task)?.device_name().to_string())
    }

    pub fn set_task_observer(&self, task: &str, index: usize) -> VisionResult<()> {
        self.tasks.get(task)?.set_output(OutputSelection::Observer(index))
    }

    pub fn clear_task_observer(&self, task: &str) -> VisionResult<()> {
        self.tasks.get(task)?.set_output(OutputSelection::Final)
    }

    /// Publish acquired frames unprocessed.
    pub fn set_task_pass_through(&self, task: &str) -> VisionResult<()> {
        self.tasks.get(task)?.set_output(OutputSelection::PassThrough)
    }

    // ------------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------------

    pub fn create_pipeline(&self, name: &str) -> VisionResult<bool> {
        self.pipelines.create(name)
    }

    pub fn erase_pipeline(&self, name: &str) -> VisionResult<()> {
        self.pipelines.erase(name)
    }

    pub fn copy_pipeline(&self, from: &str, to: &str) -> VisionResult<()> {
        self.pipelines.copy(from, to)
    }

    pub fn save_pipeline(&self, name: &str) -> VisionResult<()> {
        self.pipelines.save(name)
    }

    pub fn pipeline_definition(&self, name: &str) -> VisionResult<PipelineDefinition> {
        self.pipelines.definition(name)
    }

    pub fn add_stage(&self, pipeline: &str, type_name: &str, position: Option<usize>) -> VisionResult<usize> {
        self.pipelines.instance(pipeline)?.add_stage(type_name, position)
    }

    pub fn remove_stage(&self, pipeline: &str, index: usize) -> VisionResult<()> {
        self.pipelines.instance(pipeline)?.remove_stage(index)
    }

    pub fn move_stage(&self, pipeline: &str, index: usize, direction: MoveDirection) -> VisionResult<usize> {
        self.pipelines.instance(pipeline)?.move_stage(index, direction)
    }

    pub fn set_parameter(
        &self,
        pipeline: &str,
        index: usize,
        name: &str,
        value: ParamValue,
    ) -> VisionResult<()> {
        self.pipelines
            .instance(pipeline)?
            .set_parameter(index, name, value)
    }

    pub fn get_parameters(&self, pipeline: &str, index: usize) -> VisionResult<Vec<(String, ParamValue)>> {
        self.pipelines.instance(pipeline)?.parameters(index)
    }

    pub fn set_stage_enabled(&self, pipeline: &str, index: usize, enabled: bool) -> VisionResult<()> {
        self.pipelines
            .instance(pipeline)?
            .set_stage_enabled(index, enabled)
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop every task. Devices are closed as their last loop stops.
    pub fn shutdown(&self) {
        for task in self.tasks.take_all() {
            let name = task.name().to_string();
            if let Err(err) = task.stop() {
                log::warn!("shutdown: task {}: {}", name, err);
            }
            self.release_loop(task.device_name());
            self.release_pipeline(task.pipeline_name(), &name);
        }
    }

    fn release_loop(&self, device: &str) {
        if let Err(err) = self.devices.release_loop(device) {
            log::warn!("device {}: release loop: {}", device, err);
        }
    }

    fn release_pipeline(&self, pipeline: &str, task: &str) {
        if let Err(err) = self.pipelines.release(pipeline, task) {
            log::warn!("pipeline {}: release by {}: {}", pipeline, task, err);
        }
    }
}

impl Drop for VisionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
