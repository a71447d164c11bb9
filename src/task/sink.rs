use crossbeam_channel::{Receiver, Sender};

use super::TaskOutput;
use crate::detect::DetectionResult;

/// Destination for task results. Called on the task's worker thread.
pub trait ResultSink: Send + Sync {
    fn publish(&self, output: &TaskOutput);
}

/// Logs every result in the wire encoding.
#[derive(Default)]
pub struct LogResultSink;

impl ResultSink for LogResultSink {
    fn publish(&self, output: &TaskOutput) {
        if output.device_fault {
            log::warn!(
                "task {}: generation {} has no image (device fault)",
                output.task,
                output.generation
            );
            return;
        }
        log::info!(
            "task {}: generation {} frame {} {}x{} results [{}]",
            output.task,
            output.generation,
            output.frame.sequence(),
            output.frame.width(),
            output.frame.height(),
            DetectionResult::encode_list(&output.detections)
        );
    }
}

/// Forwards results over an unbounded channel.
pub struct ChannelResultSink {
    tx: Sender<TaskOutput>,
}

impl ChannelResultSink {
    pub fn new() -> (Self, Receiver<TaskOutput>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelResultSink {
    fn publish(&self, output: &TaskOutput) {
        // A gone receiver just means nobody is listening any more.
        let _ = self.tx.send(output.clone());
    }
}

/// Discards results.
#[derive(Default)]
pub struct NullResultSink;

impl ResultSink for NullResultSink {
    fn publish(&self, _output: &TaskOutput) {}
}
