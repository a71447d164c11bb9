//! Acquisition loops.
//!
//! An `AcquisitionLoop` owns one `DeviceHandle` and a dedicated thread that
//! pulls frames at the device's target period. The most recent frame is kept
//! behind a lock (latest-frame-wins, nothing is queued) and subscribers are
//! signalled through coalescing notifications.
//!
//! The loop is responsible for:
//! - Holding the frame lock only for the store/copy, never across device I/O
//! - Replacing a failed acquisition with a sentinel frame and carrying on
//! - Pacing file-backed sources; live cameras pace themselves
//! - Feeding an optional recorder without waiting on it
//!
//! Only `stop()` ends the thread. It joins before returning, so no
//! notification fires after it.

mod notify;
mod recording;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::device::{DeviceHandle, MAX_FRAME_RATE};
use crate::error::{VisionError, VisionResult};
use crate::frame::Frame;

pub use notify::{FrameNotifier, NotifyOutcome, Subscription};
use recording::Recorder;
pub use recording::{NetpbmDirectorySink, RecordingSink, RECORDING_QUEUE_FRAMES};

/// Log every Nth consecutive acquisition failure after the first.
const FAILURE_LOG_INTERVAL: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

/// Counters for one loop.
#[derive(Clone, Debug, Default)]
pub struct LoopStats {
    pub frames_captured: u64,
    pub acquisition_failures: u64,
    pub recording_failures: u64,
    pub notifications_sent: u64,
    pub notifications_coalesced: u64,
    pub last_frame_at: Option<SystemTime>,
    /// False while the device keeps failing.
    pub device_healthy: bool,
}

struct LoopShared {
    device: Arc<DeviceHandle>,
    period_us: AtomicU64,
    latest: Mutex<Option<Frame>>,
    stop: AtomicBool,
    generation: AtomicU64,
    notifier: FrameNotifier,
    recorder: Mutex<Option<Recorder>>,
    recording_failures: Arc<AtomicU64>,
    stats: Mutex<LoopStats>,
}

struct LoopControl {
    state: LoopState,
    worker: Option<JoinHandle<()>>,
}

pub struct AcquisitionLoop {
    shared: Arc<LoopShared>,
    control: Mutex<LoopControl>,
}

impl std::fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionLoop").finish_non_exhaustive()
    }
}

impl AcquisitionLoop {
    /// Build an idle loop. The period comes from the device's configured fps.
    pub fn new(device: Arc<DeviceHandle>) -> Self {
        let period = device.config().frame_period();
        Self {
            shared: Arc::new(LoopShared {
                device,
                period_us: AtomicU64::new(period.as_micros() as u64),
                latest: Mutex::new(None),
                stop: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                notifier: FrameNotifier::new(),
                recorder: Mutex::new(None),
                recording_failures: Arc::new(AtomicU64::new(0)),
                stats: Mutex::new(LoopStats {
                    device_healthy: true,
                    ..LoopStats::default()
                }),
            }),
            control: Mutex::new(LoopControl {
                state: LoopState::Idle,
                worker: None,
            }),
        }
    }

    pub fn device(&self) -> &Arc<DeviceHandle> {
        &self.shared.device
    }

    pub fn device_name(&self) -> &str {
        self.shared.device.name()
    }

    pub fn state(&self) -> LoopState {
        self.control
            .lock()
            .map(|c| c.state)
            .unwrap_or(LoopState::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// Change the target rate, clamped to `1..=MAX_FRAME_RATE`. Takes effect
    /// on the next iteration.
    pub fn set_frame_rate(&self, fps: u32) {
        let fps = fps.clamp(1, MAX_FRAME_RATE) as u64;
        self.shared
            .period_us
            .store(1_000_000 / fps, Ordering::SeqCst);
    }

    /// Idle -> Running. Starting a running loop is a no-op.
    pub fn start(&self) -> VisionResult<()> {
        let mut control = self.control_lock()?;
        if control.state == LoopState::Running {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("acq-{}", self.device_name()))
            .spawn(move || run_loop(shared))
            .map_err(|e| VisionError::StartFailed {
                what: format!("acquisition loop for {}", self.device_name()),
                reason: e.to_string(),
            })?;
        control.worker = Some(worker);
        control.state = LoopState::Running;
        log::info!("acquisition loop started on {}", self.device_name());
        Ok(())
    }

    /// Running -> Stopping -> Idle. Blocks until the thread has exited.
    pub fn stop(&self) -> VisionResult<()> {
        let mut control = self.control_lock()?;
        let Some(worker) = control.worker.take() else {
            control.state = LoopState::Idle;
            return Ok(());
        };
        control.state = LoopState::Stopping;
        self.shared.stop.store(true, Ordering::SeqCst);
        worker.thread().unpark();
        let joined = worker.join();
        control.state = LoopState::Idle;
        drop(control);

        self.stop_recording()?;
        log::info!("acquisition loop stopped on {}", self.device_name());
        joined.map_err(|_| {
            VisionError::WorkerPanicked(format!("acquisition loop for {}", self.device_name()))
        })
    }

    /// Copy of the most recent frame, or None when nothing was ever stored.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared
            .latest
            .lock()
            .ok()
            .and_then(|latest| latest.clone())
    }

    /// Generation of the most recently stored frame (0 = none yet).
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.notifier.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.notifier.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.notifier.subscriber_count()
    }

    /// Attach a sink. Every successfully acquired frame is offered to it.
    pub fn start_recording(&self, sink: Box<dyn RecordingSink>) -> VisionResult<()> {
        let mut recorder = self
            .shared
            .recorder
            .lock()
            .map_err(|_| VisionError::LockPoisoned("recorder"))?;
        if let Some(active) = recorder.as_ref() {
            return Err(VisionError::ResourceBusy {
                kind: "recording",
                name: self.device_name().to_string(),
                holder: active.description().to_string(),
            });
        }
        let spawned = Recorder::spawn(
            self.device_name(),
            sink,
            self.shared.recording_failures.clone(),
        )
        .map_err(|e| VisionError::StartFailed {
            what: format!("recording on {}", self.device_name()),
            reason: e.to_string(),
        })?;
        log::info!("recording {} to {}", self.device_name(), spawned.description());
        *recorder = Some(spawned);
        Ok(())
    }

    /// Detach the sink and flush it. Returns false when nothing was recording.
    pub fn stop_recording(&self) -> VisionResult<bool> {
        let taken = self
            .shared
            .recorder
            .lock()
            .map_err(|_| VisionError::LockPoisoned("recorder"))?
            .take();
        match taken {
            Some(recorder) => {
                recorder.finish();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared
            .recorder
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LoopStats {
        let mut stats = self
            .shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.recording_failures = self.shared.recording_failures.load(Ordering::Relaxed);
        stats
    }

    fn control_lock(&self) -> VisionResult<MutexGuard<'_, LoopControl>> {
        self.control
            .lock()
            .map_err(|_| VisionError::LockPoisoned("acquisition loop"))
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("acquisition loop {}: stop on drop failed: {}", self.device_name(), err);
        }
    }
}

impl LoopShared {
    fn period(&self) -> Duration {
        Duration::from_micros(self.period_us.load(Ordering::SeqCst))
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Replace the stored frame and signal subscribers.
    fn publish(&self, frame: Frame) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(frame);
        }
        let outcome = self.notifier.notify(generation);
        if outcome.coalesced > 0 {
            log::debug!(
                "device {}: generation {} coalesced for {} subscriber(s)",
                self.device.name(),
                generation,
                outcome.coalesced
            );
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.notifications_sent += outcome.delivered as u64;
            stats.notifications_coalesced += outcome.coalesced as u64;
        }
    }

    fn record(&self, frame: &Frame) {
        if let Ok(recorder) = self.recorder.lock() {
            if let Some(recorder) = recorder.as_ref() {
                recorder.offer(frame.clone());
            }
        }
    }

    /// Sleep until `deadline` unless asked to stop.
    fn wait_until(&self, deadline: Instant) {
        loop {
            if self.stopping() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::park_timeout(deadline - now);
        }
    }
}

fn run_loop(shared: Arc<LoopShared>) {
    let name = shared.device.name().to_string();
    let mut consecutive_failures = 0u64;

    while !shared.stopping() {
        let deadline = Instant::now() + shared.period();

        let paced = match shared.device.next_frame() {
            Ok(frame) => {
                if consecutive_failures > 0 {
                    log::info!(
                        "device {} recovered after {} failed acquisitions",
                        name,
                        consecutive_failures
                    );
                    consecutive_failures = 0;
                }
                if let Ok(mut stats) = shared.stats.lock() {
                    stats.frames_captured += 1;
                    stats.last_frame_at = Some(frame.timestamp());
                    stats.device_healthy = true;
                }
                shared.record(&frame);
                shared.publish(frame);
                shared.device.requires_pacing()
            }
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures == 1 || consecutive_failures % FAILURE_LOG_INTERVAL == 0 {
                    log::error!(
                        "device {}: {} (failure #{}), providing empty frame",
                        name,
                        err,
                        consecutive_failures
                    );
                }
                if let Ok(mut stats) = shared.stats.lock() {
                    stats.acquisition_failures += 1;
                    stats.device_healthy = false;
                }
                shared.publish(Frame::sentinel());
                // A failing device returns immediately; always wait out the period.
                true
            }
        };

        if paced {
            shared.wait_until(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceKind, SyntheticDevice};

    fn streaming_device(kind: DeviceKind, fps: u32) -> Arc<DeviceHandle> {
        let config = DeviceConfig::new("cam", kind).with_size(4, 4).with_fps(fps);
        let device = Arc::new(DeviceHandle::new(config, Box::new(SyntheticDevice::new())));
        device.open().unwrap();
        device.set_streaming(true).unwrap();
        device
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn latest_frame_is_none_before_start() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 100));
        assert!(acq.latest_frame().is_none());
        assert_eq!(acq.state(), LoopState::Idle);
    }

    #[test]
    fn stores_frames_and_notifies() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 100));
        let sub = acq.subscribe();
        acq.start().unwrap();
        assert!(acq.is_running());

        let generation = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(generation >= 1);
        let frame = acq.latest_frame().unwrap();
        assert_eq!(frame.width(), 4);
        assert!(frame.sequence() >= 1);

        acq.stop().unwrap();
        assert_eq!(acq.state(), LoopState::Idle);
        assert!(acq.stats().frames_captured >= 1);
    }

    #[test]
    fn no_notifications_after_stop() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 200));
        let sub = acq.subscribe();
        acq.start().unwrap();
        assert!(wait_for(|| acq.generation() >= 3));
        acq.stop().unwrap();

        let frozen = acq.generation();
        while sub.try_recv().is_some() {}
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acq.generation(), frozen);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn frame_rate_is_clamped() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 100));
        acq.set_frame_rate(u32::MAX);
        assert_eq!(acq.period(), Duration::from_millis(1));
        acq.set_frame_rate(0);
        assert_eq!(acq.period(), Duration::from_secs(1));

        let config = DeviceConfig::new("cam", DeviceKind::Video).with_fps(5_000_000);
        assert_eq!(config.frame_period(), Duration::from_millis(1));
    }

    #[test]
    fn loop_can_restart() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 200));
        acq.start().unwrap();
        acq.start().unwrap();
        acq.stop().unwrap();
        acq.stop().unwrap();
        acq.start().unwrap();
        assert!(wait_for(|| acq.latest_frame().is_some()));
        acq.stop().unwrap();
    }

    #[test]
    fn published_frame_is_not_mutated_by_consumer() {
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 100));
        acq.start().unwrap();
        assert!(wait_for(|| acq.latest_frame().is_some()));
        acq.stop().unwrap();

        let stored = acq.latest_frame().unwrap();
        let mut copy = acq.latest_frame().unwrap();
        copy.pixels_mut().fill(0);
        assert!(acq.latest_frame().unwrap().same_image(&stored));
    }

    #[test]
    fn closed_device_yields_sentinel_frames() {
        let config = DeviceConfig::new("cam", DeviceKind::Live).with_fps(100);
        let device = Arc::new(DeviceHandle::new(config, Box::new(SyntheticDevice::new())));
        let acq = AcquisitionLoop::new(device);
        acq.start().unwrap();
        assert!(wait_for(|| acq.stats().acquisition_failures >= 2));
        acq.stop().unwrap();

        assert!(acq.latest_frame().unwrap().is_sentinel());
        assert!(!acq.stats().device_healthy);
    }

    #[test]
    fn recording_writes_frames_and_rejects_second_sink() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let acq = AcquisitionLoop::new(streaming_device(DeviceKind::Video, 100));
        acq.start_recording(Box::new(NetpbmDirectorySink::new(dir.path(), "cam")?))?;
        assert!(acq.is_recording());
        let second = NetpbmDirectorySink::new(dir.path(), "other")?;
        assert_eq!(
            acq.start_recording(Box::new(second)).unwrap_err().code(),
            "ResourceBusy"
        );

        acq.start()?;
        assert!(wait_for(|| acq.stats().frames_captured >= 3));
        acq.stop()?;

        assert!(!acq.is_recording());
        let written = std::fs::read_dir(dir.path())?.count();
        assert!(written >= 1);
        Ok(())
    }
}
