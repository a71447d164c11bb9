//! Processing tasks.
//!
//! A `ProcessingTask` binds one acquisition loop to one pipeline and runs on
//! its own thread. It waits for the loop's coalescing notification, copies the
//! latest frame, runs the pipeline and hands the result to a `ResultSink`.
//! Frames that arrive while a run is in progress are skipped, not queued.
//!
//! The task never holds one of its own locks while calling into the loop or
//! the pipeline.

mod sink;

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::acquisition::{AcquisitionLoop, Subscription};
use crate::detect::DetectionResult;
use crate::error::{VisionError, VisionResult};
use crate::frame::Frame;
use crate::pipeline::Pipeline;

pub use sink::{ChannelResultSink, LogResultSink, NullResultSink, ResultSink};

/// How long the worker waits for a notification before re-checking the stop
/// flag.
const NOTIFY_POLL: Duration = Duration::from_millis(100);

/// Which frame a task initially publishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSelection {
    /// Final pipeline output.
    #[default]
    Final,
    /// Frame after the given stage.
    Observer(usize),
    /// Acquired frame, pipeline skipped.
    PassThrough,
}

/// Image a running task publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageOutput {
    /// Pipeline output, or the observed frame when an observer is set.
    Pipeline,
    /// Acquired frame; the pipeline is not run.
    Original,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub device: String,
    pub pipeline: String,
    #[serde(default)]
    pub output: OutputSelection,
}

impl TaskDescriptor {
    pub fn new(name: &str, device: &str, pipeline: &str) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            pipeline: pipeline.to_string(),
            output: OutputSelection::Final,
        }
    }

    pub fn with_output(mut self, output: OutputSelection) -> Self {
        self.output = output;
        self
    }
}

/// What a task publishes for one processed frame.
#[derive(Clone, Debug)]
pub struct TaskOutput {
    pub task: String,
    /// Loop generation the frame was read at.
    pub generation: u64,
    pub frame: Frame,
    pub detections: Vec<DetectionResult>,
    /// The loop handed over an empty frame because the device failed.
    pub device_fault: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TaskStats {
    pub notifications_received: u64,
    pub frames_processed: u64,
    pub frames_skipped_sentinel: u64,
    pub pipeline_failures: u64,
    pub stage_failures: u64,
    pub last_run: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Stopped,
}

struct TaskShared {
    name: String,
    stop: AtomicBool,
    image_output: Mutex<ImageOutput>,
    stats: Mutex<TaskStats>,
    last_output: Mutex<Option<TaskOutput>>,
}

pub struct ProcessingTask {
    descriptor: TaskDescriptor,
    acquisition: Arc<AcquisitionLoop>,
    pipeline: Arc<Pipeline>,
    shared: Arc<TaskShared>,
    subscription_id: u64,
    control: Mutex<TaskControl>,
}

struct TaskControl {
    state: TaskState,
    worker: Option<JoinHandle<()>>,
}

impl ProcessingTask {
    /// Subscribe to `acquisition`, apply the descriptor's output selection and
    /// spawn the worker thread.
    pub fn start(
        descriptor: TaskDescriptor,
        acquisition: Arc<AcquisitionLoop>,
        pipeline: Arc<Pipeline>,
        sink: Arc<dyn ResultSink>,
    ) -> VisionResult<Self> {
        let image_output = apply_selection(&pipeline, descriptor.output)?;
        let shared = Arc::new(TaskShared {
            name: descriptor.name.clone(),
            stop: AtomicBool::new(false),
            image_output: Mutex::new(image_output),
            stats: Mutex::new(TaskStats::default()),
            last_output: Mutex::new(None),
        });

        let subscription = acquisition.subscribe();
        let subscription_id = subscription.id();
        let worker = {
            let shared = shared.clone();
            let acquisition = acquisition.clone();
            let pipeline = pipeline.clone();
            std::thread::Builder::new()
                .name(format!("task-{}", descriptor.name))
                .spawn(move || run_task(shared, subscription, acquisition, pipeline, sink))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                acquisition.unsubscribe(subscription_id);
                return Err(VisionError::StartFailed {
                    what: format!("task {}", descriptor.name),
                    reason: err.to_string(),
                });
            }
        };

        log::info!(
            "task {} started: device {} -> pipeline {} ({:?})",
            descriptor.name,
            descriptor.device,
            descriptor.pipeline,
            descriptor.output
        );
        Ok(Self {
            descriptor,
            acquisition,
            pipeline,
            shared,
            subscription_id,
            control: Mutex::new(TaskControl {
                state: TaskState::Running,
                worker: Some(worker),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn device_name(&self) -> &str {
        &self.descriptor.device
    }

    pub fn pipeline_name(&self) -> &str {
        &self.descriptor.pipeline
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn acquisition(&self) -> &Arc<AcquisitionLoop> {
        &self.acquisition
    }

    pub fn state(&self) -> TaskState {
        self.control
            .lock()
            .map(|c| c.state)
            .unwrap_or(TaskState::Stopped)
    }

    pub fn image_output(&self) -> ImageOutput {
        self.shared
            .image_output
            .lock()
            .map(|o| *o)
            .unwrap_or(ImageOutput::Pipeline)
    }

    /// Change what the task publishes. Takes effect on the next frame.
    pub fn set_output(&self, selection: OutputSelection) -> VisionResult<()> {
        let image_output = apply_selection(&self.pipeline, selection)?;
        *self
            .shared
            .image_output
            .lock()
            .map_err(|_| VisionError::LockPoisoned("task output"))? = image_output;
        log::info!("task {}: output set to {:?}", self.name(), selection);
        Ok(())
    }

    pub fn stats(&self) -> TaskStats {
        self.shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Most recent published output.
    pub fn last_output(&self) -> Option<TaskOutput> {
        self.shared
            .last_output
            .lock()
            .ok()
            .and_then(|o| o.clone())
    }

    /// Unsubscribe and wait for an in-flight run to finish. Idempotent.
    pub fn stop(&self) -> VisionResult<()> {
        let mut control = self.control_lock()?;
        let Some(worker) = control.worker.take() else {
            return Ok(());
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        self.acquisition.unsubscribe(self.subscription_id);
        let joined = worker.join();
        control.state = TaskState::Stopped;
        drop(control);

        log::info!("task {} stopped", self.name());
        joined.map_err(|_| VisionError::WorkerPanicked(format!("task {}", self.name())))
    }

    fn control_lock(&self) -> VisionResult<MutexGuard<'_, TaskControl>> {
        self.control
            .lock()
            .map_err(|_| VisionError::LockPoisoned("task"))
    }
}

impl Drop for ProcessingTask {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("task {}: stop on drop failed: {}", self.name(), err);
        }
    }
}

/// Push the selection into the pipeline (observer) and return the image mode.
fn apply_selection(pipeline: &Pipeline, selection: OutputSelection) -> VisionResult<ImageOutput> {
    match selection {
        OutputSelection::Final => {
            pipeline.set_observer(None)?;
            Ok(ImageOutput::Pipeline)
        }
        OutputSelection::Observer(index) => {
            pipeline.set_observer(Some(index))?;
            Ok(ImageOutput::Pipeline)
        }
        OutputSelection::PassThrough => Ok(ImageOutput::Original),
    }
}

impl TaskShared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn update_stats<F: FnOnce(&mut TaskStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

fn run_task(
    shared: Arc<TaskShared>,
    subscription: Subscription,
    acquisition: Arc<AcquisitionLoop>,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn ResultSink>,
) {
    loop {
        if shared.stopping() {
            break;
        }
        let generation = match subscription.recv_timeout(NOTIFY_POLL) {
            Ok(generation) => generation,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if shared.stopping() {
            break;
        }
        shared.update_stats(|s| s.notifications_received += 1);

        let Some(frame) = acquisition.latest_frame() else {
            continue;
        };
        let output = process_frame(&shared, &pipeline, generation, frame);
        if let Ok(mut last) = shared.last_output.lock() {
            *last = Some(output.clone());
        }
        sink.publish(&output);
    }
    log::debug!("task {}: worker exiting", shared.name);
}

fn process_frame(
    shared: &TaskShared,
    pipeline: &Pipeline,
    generation: u64,
    frame: Frame,
) -> TaskOutput {
    let mut output = TaskOutput {
        task: shared.name.clone(),
        generation,
        frame,
        detections: Vec::new(),
        device_fault: false,
    };
    if output.frame.is_sentinel() {
        output.device_fault = true;
        shared.update_stats(|s| s.frames_skipped_sentinel += 1);
        return output;
    }

    let image_output = shared
        .image_output
        .lock()
        .map(|o| *o)
        .unwrap_or(ImageOutput::Pipeline);
    if image_output == ImageOutput::Original {
        shared.update_stats(|s| s.frames_processed += 1);
        return output;
    }

    let started = Instant::now();
    match pipeline.run(&output.frame) {
        Ok(result) => {
            let elapsed = started.elapsed();
            shared.update_stats(|s| {
                s.frames_processed += 1;
                s.stage_failures += result.failed_stages.len() as u64;
                s.last_run = Some(elapsed);
            });
            output.frame = result.observed;
            output.detections = result.detections;
        }
        Err(err) => {
            // No detections this frame; publish what was acquired.
            log::error!("task {}: pipeline {} failed: {}", shared.name, pipeline.name(), err);
            shared.update_stats(|s| s.pipeline_failures += 1);
        }
    }
    output
}
