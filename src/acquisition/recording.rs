//! Frame recording.
//!
//! The acquisition thread hands frames to a `Recorder`, which owns a writer
//! thread and a small bounded queue. A full queue drops the frame instead of
//! stalling acquisition; write failures are logged and counted.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::frame::{Frame, PixelFormat};

/// Frames buffered between acquisition and the writer thread.
pub const RECORDING_QUEUE_FRAMES: usize = 8;

/// Destination for recorded frames.
pub trait RecordingSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Called once when recording stops.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Writes one binary PGM (gray) or PPM (color) file per frame.
pub struct NetpbmDirectorySink {
    dir: PathBuf,
    prefix: String,
    written: u64,
}

impl NetpbmDirectorySink {
    pub fn new(dir: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create recording directory {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn path_for(&self, frame: &Frame) -> PathBuf {
        let ext = match frame.format() {
            PixelFormat::Gray8 => "pgm",
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => "ppm",
        };
        self.dir
            .join(format!("{}_{:08}.{}", self.prefix, frame.sequence(), ext))
    }
}

impl RecordingSink for NetpbmDirectorySink {
    fn append(&mut self, frame: &Frame) -> Result<()> {
        if frame.is_sentinel() {
            return Err(anyhow!("refusing to record an empty frame"));
        }
        let path = self.path_for(frame);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let magic = match frame.format() {
            PixelFormat::Gray8 => "P5",
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => "P6",
        };
        write!(out, "{}\n{} {}\n255\n", magic, frame.width(), frame.height())?;
        match frame.format() {
            PixelFormat::Bgr8 => {
                for px in frame.pixels().chunks_exact(3) {
                    out.write_all(&[px[2], px[1], px[0]])?;
                }
            }
            PixelFormat::Gray8 | PixelFormat::Rgb8 => out.write_all(frame.pixels())?,
        }
        out.flush()?;
        self.written += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("netpbm:{}", self.dir.display())
    }
}

/// Running recording: queue plus writer thread.
pub(crate) struct Recorder {
    tx: Option<Sender<Frame>>,
    worker: Option<JoinHandle<()>>,
    description: String,
    failures: Arc<AtomicU64>,
}

impl Recorder {
    pub(crate) fn spawn(
        device_name: &str,
        mut sink: Box<dyn RecordingSink>,
        failures: Arc<AtomicU64>,
    ) -> Result<Self> {
        let description = sink.describe();
        let (tx, rx) = crossbeam_channel::bounded::<Frame>(RECORDING_QUEUE_FRAMES);
        let thread_failures = failures.clone();
        let label = format!("{} -> {}", device_name, description);
        let worker = std::thread::Builder::new()
            .name(format!("rec-{}", device_name))
            .spawn(move || {
                for frame in rx.iter() {
                    if let Err(err) = sink.append(&frame) {
                        thread_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("recording {}: frame {} lost: {}", label, frame.sequence(), err);
                    }
                }
                if let Err(err) = sink.finish() {
                    thread_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("recording {}: finish failed: {}", label, err);
                }
            })
            .context("spawn recording thread")?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            description,
            failures,
        })
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    /// Queue a frame. Never blocks.
    pub(crate) fn offer(&self, frame: Frame) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "recording {}: writer behind, dropped frame {}",
                    self.description,
                    frame.sequence()
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Close the queue and wait for queued frames to be written.
    pub(crate) fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("recording {}: writer thread panicked", self.description);
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
