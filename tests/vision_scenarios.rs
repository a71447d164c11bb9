use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::Receiver;

use provider_vision::{
    ChannelResultSink, DeviceConfig, DeviceDriver, DeviceKind, DeviceState, Feature, Frame,
    MoveDirection, NullResultSink, OutputSelection, ParamValue, PipelineDefinition, PipelineStore,
    PixelFormat, Stage, StageConfig, StageContext, StageFactory, StageParams, TaskDescriptor,
    TaskOutput, VisionContext, VisionResult,
};

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

/// Sleeps for a fixed time, leaving the frame alone.
struct SlowStage(Duration);

impl Stage for SlowStage {
    fn type_name(&self) -> &'static str {
        "Slow"
    }

    fn execute(
        &mut self,
        _frame: &mut Frame,
        _params: &StageParams,
        _ctx: &mut StageContext<'_>,
    ) -> anyhow::Result<()> {
        std::thread::sleep(self.0);
        Ok(())
    }
}

/// Scribbles over the frame, then fails.
struct BrokenStage;

impl Stage for BrokenStage {
    fn type_name(&self) -> &'static str {
        "Broken"
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        _params: &StageParams,
        _ctx: &mut StageContext<'_>,
    ) -> anyhow::Result<()> {
        frame.pixels_mut().fill(7);
        Err(anyhow!("broken on purpose"))
    }
}

/// Panics on every frame.
struct PanickingStage;

impl Stage for PanickingStage {
    fn type_name(&self) -> &'static str {
        "Panicking"
    }

    fn execute(
        &mut self,
        _frame: &mut Frame,
        _params: &StageParams,
        _ctx: &mut StageContext<'_>,
    ) -> anyhow::Result<()> {
        panic!("stage bug");
    }
}

/// Opens fine, never delivers a frame.
struct DeadDriver;

impl DeviceDriver for DeadDriver {
    fn open(&mut self, _config: &DeviceConfig) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_streaming(&mut self, _on: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> anyhow::Result<Frame> {
        Err(anyhow!("sensor unplugged"))
    }

    fn supports(&self, _feature: Feature) -> bool {
        false
    }

    fn get_feature(&mut self, feature: Feature) -> anyhow::Result<f32> {
        Err(anyhow!("{} not supported", feature))
    }

    fn set_feature(&mut self, feature: Feature, _value: f32) -> anyhow::Result<()> {
        Err(anyhow!("{} not supported", feature))
    }
}

fn factory() -> StageFactory {
    let mut factory = StageFactory::with_builtin_stages();
    factory.register_with("Slow", || Box::new(SlowStage(Duration::from_millis(100))));
    factory.register_with("Broken", || Box::new(BrokenStage));
    factory.register_with("Panicking", || Box::new(PanickingStage));
    factory
}

fn context(store: PipelineStore) -> VisionContext {
    VisionContext::new(store, factory()).with_result_sink(Arc::new(NullResultSink))
}

fn video_device(name: &str) -> DeviceConfig {
    DeviceConfig::new(name, DeviceKind::Video)
        .with_size(8, 8)
        .with_fps(100)
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// First output matching `pred`, skipping the ones already queued.
fn next_matching<F: Fn(&TaskOutput) -> bool>(rx: &Receiver<TaskOutput>, pred: F) -> Option<TaskOutput> {
    let deadline = Instant::now() + Duration::from_secs(3);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(output) if pred(&output) => return Some(output),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn two_tasks_share_one_loop() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(&PipelineDefinition::new("a").with_stage(StageConfig::new("Gray")))?;
    store.save(&PipelineDefinition::new("b").with_stage(StageConfig::new("Invert")))?;
    let ctx = context(store);
    let device = ctx.register_device(video_device("front"))?;

    let first = ctx.start_task(TaskDescriptor::new("first", "front", "a"))?;
    let second = ctx.start_task(TaskDescriptor::new("second", "front", "b"))?;
    assert!(Arc::ptr_eq(first.acquisition(), second.acquisition()));
    assert_eq!(ctx.devices().loop_refs("front"), 2);
    assert_eq!(device.state()?, DeviceState::Streaming);
    assert!(wait_for(|| first.stats().frames_processed > 2 && second.stats().frames_processed > 2));

    ctx.stop_task("first")?;
    assert_eq!(ctx.devices().loop_refs("front"), 1);
    let processed = second.stats().frames_processed;
    assert!(wait_for(|| second.stats().frames_processed > processed + 2));

    ctx.stop_task("second")?;
    assert!(ctx.devices().loop_for("front").is_none());
    assert_eq!(device.state()?, DeviceState::Closed);
    Ok(())
}

#[test]
fn slow_pipeline_skips_frames_instead_of_queueing() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(&PipelineDefinition::new("slow").with_stage(StageConfig::new("Slow")))?;
    let ctx = context(store);
    ctx.register_device(
        DeviceConfig::new("front", DeviceKind::Live)
            .with_size(8, 8)
            .with_fps(30),
    )?;

    let task = ctx.start_task(TaskDescriptor::new("t", "front", "slow"))?;
    std::thread::sleep(Duration::from_secs(1));
    let processed = task.stats().frames_processed;
    let loop_stats = task.acquisition().stats();
    ctx.stop_task("t")?;

    assert!(processed >= 5, "processed {}", processed);
    assert!(processed <= 10, "processed {}", processed);
    assert!(loop_stats.frames_captured > processed + 5);
    assert!(loop_stats.notifications_coalesced > 0);
    Ok(())
}

#[test]
fn observer_shows_intermediate_stage() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(
        &PipelineDefinition::new("buoy")
            .with_stage(StageConfig::new("Gray"))
            .with_stage(StageConfig::new("Threshold").with_param("min", ParamValue::Int(10))),
    )?;
    let ctx = context(store);
    ctx.register_device(video_device("front"))?;
    let (sink, rx) = ChannelResultSink::new();
    ctx.start_task_with_sink(
        TaskDescriptor::new("t", "front", "buoy").with_output(OutputSelection::Observer(0)),
        Arc::new(sink),
    )?;

    let binary = |frame: &Frame| frame.pixels().iter().all(|&p| p == 0 || p == 255);

    let observed = next_matching(&rx, |o| !o.device_fault).expect("observer output");
    assert_eq!(observed.frame.format(), PixelFormat::Gray8);
    assert!(!binary(&observed.frame));

    ctx.clear_task_observer("t")?;
    let output = next_matching(&rx, |o| !o.device_fault && binary(&o.frame));
    assert!(output.is_some());

    assert_eq!(
        ctx.set_task_observer("t", 2).unwrap_err().code(),
        "IndexOutOfRange"
    );
    Ok(())
}

#[test]
fn pass_through_publishes_acquired_frames() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(&PipelineDefinition::new("p").with_stage(StageConfig::new("Gray")))?;
    let ctx = context(store);
    ctx.register_device(video_device("front"))?;
    let (sink, rx) = ChannelResultSink::new();
    ctx.start_task_with_sink(TaskDescriptor::new("t", "front", "p"), Arc::new(sink))?;

    ctx.set_task_pass_through("t")?;
    let output = next_matching(&rx, |o| o.frame.format() == PixelFormat::Rgb8);
    assert!(output.is_some());
    Ok(())
}

#[test]
fn edits_out_of_range_leave_pipeline_unchanged() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(
        &PipelineDefinition::new("p")
            .with_stage(StageConfig::new("Gray"))
            .with_stage(StageConfig::new("Blur"))
            .with_stage(StageConfig::new("Invert")),
    )?;
    let ctx = context(store);
    let before = ctx.pipeline_definition("p")?;

    assert_eq!(ctx.remove_stage("p", 5).unwrap_err().code(), "IndexOutOfRange");
    assert_eq!(
        ctx.move_stage("p", 2, MoveDirection::Down).unwrap_err().code(),
        "IndexOutOfRange"
    );
    assert_eq!(
        ctx.add_stage("p", "Gray", Some(4)).unwrap_err().code(),
        "IndexOutOfRange"
    );
    assert_eq!(
        ctx.add_stage("p", "Sharpen", None).unwrap_err().code(),
        "UnknownStageType"
    );
    assert_eq!(
        ctx.set_parameter("p", 1, "radius", ParamValue::Int(99))
            .unwrap_err()
            .code(),
        "ParameterOutOfRange"
    );
    assert_eq!(ctx.pipeline_definition("p")?, before);
    Ok(())
}

#[test]
fn failing_stage_does_not_stop_the_task() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(
        &PipelineDefinition::new("p")
            .with_stage(StageConfig::new("Gray"))
            .with_stage(StageConfig::new("Broken"))
            .with_stage(StageConfig::new("Invert")),
    )?;
    let ctx = context(store);
    ctx.register_device(video_device("front"))?;
    let (sink, rx) = ChannelResultSink::new();
    let task = ctx.start_task_with_sink(TaskDescriptor::new("t", "front", "p"), Arc::new(sink))?;

    let output = next_matching(&rx, |o| !o.device_fault).expect("output");
    assert_eq!(output.frame.format(), PixelFormat::Gray8);
    // The failed stage's scribbles never reach the output.
    assert!(output.frame.pixels().iter().any(|&p| p != 255 - 7));
    assert!(wait_for(|| task.stats().frames_processed > 3));
    assert!(task.stats().stage_failures >= 3);
    ctx.stop_task("t")?;
    Ok(())
}

#[test]
fn panicking_stage_does_not_stop_the_task() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(
        &PipelineDefinition::new("p")
            .with_stage(StageConfig::new("Gray"))
            .with_stage(StageConfig::new("Panicking")),
    )?;
    let ctx = context(store);
    ctx.register_device(video_device("front"))?;
    let (sink, rx) = ChannelResultSink::new();
    let task = ctx.start_task_with_sink(TaskDescriptor::new("t", "front", "p"), Arc::new(sink))?;

    assert!(wait_for(|| task.stats().frames_processed > 3));
    assert!(task.stats().stage_failures >= 3);
    let output = next_matching(&rx, |o| !o.device_fault).expect("output");
    assert_eq!(output.frame.format(), PixelFormat::Gray8);

    assert_eq!(ctx.add_stage("p", "Invert", None)?, 2);
    let processed = task.stats().frames_processed;
    assert!(wait_for(|| task.stats().frames_processed > processed + 2));
    ctx.stop_task("t")?;
    Ok(())
}

#[test]
fn dead_device_publishes_faults_and_stops_cleanly() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(&PipelineDefinition::new("p").with_stage(StageConfig::new("Gray")))?;
    let ctx = context(store);
    let device = ctx.register_device_with(video_device("dead"), Box::new(DeadDriver))?;
    let (sink, rx) = ChannelResultSink::new();
    let task = ctx.start_task_with_sink(TaskDescriptor::new("t", "dead", "p"), Arc::new(sink))?;

    let output = next_matching(&rx, |o| o.device_fault).expect("fault output");
    assert!(output.frame.is_sentinel());
    assert!(output.detections.is_empty());
    assert!(!task.acquisition().stats().device_healthy);
    assert_eq!(device.state()?, DeviceState::Error);

    let started = Instant::now();
    ctx.stop_task("t")?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(device.state()?, DeviceState::Closed);
    Ok(())
}

#[test]
fn edits_while_running_are_atomic() -> VisionResult<()> {
    let store = PipelineStore::in_memory();
    store.save(&PipelineDefinition::new("p").with_stage(StageConfig::new("Gray")))?;
    let ctx = Arc::new(context(store));
    ctx.register_device(video_device("front"))?;
    let task = ctx.start_task(TaskDescriptor::new("t", "front", "p"))?;

    let editor = {
        let ctx = ctx.clone();
        std::thread::spawn(move || -> VisionResult<()> {
            for i in 0..50 {
                let index = ctx.add_stage("p", "Blur", None)?;
                ctx.set_parameter("p", index, "radius", ParamValue::Int(i % 4))?;
                ctx.move_stage("p", index, MoveDirection::Up)?;
                ctx.remove_stage("p", index - 1)?;
            }
            Ok(())
        })
    };
    editor.join().expect("editor thread")?;

    let processed = task.stats().frames_processed;
    assert!(wait_for(|| task.stats().frames_processed > processed + 2));
    assert_eq!(task.stats().pipeline_failures, 0);
    assert_eq!(task.pipeline().stage_types()?, vec!["Gray".to_string()]);
    ctx.stop_task("t")?;
    Ok(())
}

#[test]
fn definitions_survive_a_restart() -> VisionResult<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let ctx = context(PipelineStore::open(dir.path())?);
        assert!(ctx.create_pipeline("buoy")?);
        ctx.add_stage("buoy", "Gray", None)?;
        ctx.add_stage("buoy", "Threshold", None)?;
        ctx.add_stage("buoy", "Centroid", None)?;
        ctx.set_parameter("buoy", 1, "min", ParamValue::Int(40))?;
        ctx.set_parameter("buoy", 2, "target", ParamValue::from("buoy"))?;
        ctx.set_stage_enabled("buoy", 0, false)?;
        ctx.save_pipeline("buoy")?;
        ctx.copy_pipeline("buoy", "buoy_backup")?;
    }

    let ctx = context(PipelineStore::open(dir.path())?);
    assert_eq!(
        ctx.list_pipelines()?,
        vec!["buoy".to_string(), "buoy_backup".to_string()]
    );
    let def = ctx.pipeline_definition("buoy")?;
    let types: Vec<&str> = def.stages.iter().map(|s| s.type_name.as_str()).collect();
    assert_eq!(types, vec!["Gray", "Threshold", "Centroid"]);
    assert!(!def.stages[0].enabled);
    let params = ctx.get_parameters("buoy", 1)?;
    assert!(params.contains(&("min".to_string(), ParamValue::Int(40))));
    assert_eq!(ctx.pipeline_definition("buoy_backup")?.stages, def.stages);

    ctx.erase_pipeline("buoy_backup")?;
    assert_eq!(ctx.list_pipelines()?, vec!["buoy".to_string()]);
    Ok(())
}
