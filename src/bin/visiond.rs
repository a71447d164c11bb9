//! visiond - vision provider daemon
//!
//! This daemon:
//! 1. Loads configuration (`VISION_CONFIG`, environment overrides)
//! 2. Registers the configured devices
//! 3. Starts the configured tasks, publishing results to the log
//! 4. Optionally records every streaming device to `recording_dir`
//! 5. Logs loop and task health periodically until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use provider_vision::{
    config::VisiondConfig, LogResultSink, NetpbmDirectorySink, PipelineStore, StageFactory,
    VisionContext,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = VisiondConfig::load()?;
    let store = PipelineStore::open(&cfg.pipeline_dir)?;
    let ctx = VisionContext::new(store, StageFactory::with_builtin_stages())
        .with_result_sink(Arc::new(LogResultSink));

    log::info!(
        "visiond {} starting. pipelines in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.pipeline_dir.display()
    );
    log::info!("stage types: {}", ctx.list_stage_types().join(", "));

    for device in &cfg.devices {
        match ctx.register_device(device.clone()) {
            Ok(handle) => log::info!(
                "device {} ({:?}, {}x{} @ {} fps) from {}",
                handle.name(),
                handle.kind(),
                device.width,
                device.height,
                device.fps,
                device.source
            ),
            Err(err) => log::error!("device {} not registered: {}", device.name, err),
        }
    }

    for task in &cfg.tasks {
        if ctx.create_pipeline(&task.pipeline)? {
            log::warn!(
                "task {}: pipeline {} did not exist, created it empty",
                task.name,
                task.pipeline
            );
        }
        if let Err(err) = ctx.start_task(task.clone()) {
            log::error!("task {} not started: {} ({})", task.name, err, err.code());
        }
    }
    if ctx.list_tasks().is_empty() {
        log::warn!("no tasks running; devices stay closed until a task starts");
    }

    if let Some(dir) = &cfg.recording_dir {
        for device in ctx.list_devices() {
            let Some(acquisition) = ctx.devices().loop_for(&device) else {
                continue;
            };
            let sink = NetpbmDirectorySink::new(dir.join(&device), &device)?;
            acquisition
                .start_recording(Box::new(sink))
                .map_err(|e| anyhow!("recording {}: {}", device, e))?;
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("visiond running with {} task(s)", ctx.list_tasks().len());
    loop {
        match rx.recv_timeout(cfg.health_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => log_health(&ctx),
        }
    }

    log::info!("shutdown signal received, stopping tasks...");
    ctx.shutdown();
    log::info!("visiond stopped");
    Ok(())
}

fn log_health(ctx: &VisionContext) {
    for device in ctx.list_devices() {
        let Some(acquisition) = ctx.devices().loop_for(&device) else {
            continue;
        };
        let stats = acquisition.stats();
        log::info!(
            "health device={} healthy={} captured={} failed={} coalesced={} recording_failures={}",
            device,
            stats.device_healthy,
            stats.frames_captured,
            stats.acquisition_failures,
            stats.notifications_coalesced,
            stats.recording_failures
        );
    }
    for name in ctx.list_tasks() {
        let Ok(task) = ctx.tasks().get(&name) else {
            continue;
        };
        let stats = task.stats();
        log::info!(
            "health task={} processed={} sentinel={} stage_failures={} last_run_ms={}",
            name,
            stats.frames_processed,
            stats.frames_skipped_sentinel,
            stats.stage_failures,
            stats
                .last_run
                .map(|d| d.as_millis().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
