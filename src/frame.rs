//! Frame snapshots handed between acquisition and processing threads.
//!
//! - `Frame`: an image buffer plus acquisition metadata.
//! - `PixelFormat`: channel layout of the buffer.
//!
//! A `Frame` is copy-on-publish. Cloning shares the pixel buffer, and the only
//! mutable access (`pixels_mut`, `replace_image`) detaches the buffer first.
//! A frame stored in an acquisition loop is therefore never written to after
//! a consumer has received it, no matter what the consumer does to its copy.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Channel layout of a frame buffer. All formats are 8 bits per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Bgr8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Arc<Vec<u8>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp: SystemTime,
    sequence: u64,
}

impl Frame {
    /// Build a frame from a tightly packed buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        check_len(width, height, format, data.len())?;
        Ok(Self {
            data: Arc::new(data),
            width,
            height,
            format,
            timestamp: SystemTime::now(),
            sequence: 0,
        })
    }

    /// Frame with every channel set to `value`.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let len = width as usize * height as usize * format.channels();
        Self {
            data: Arc::new(vec![value; len]),
            width,
            height,
            format,
            timestamp: SystemTime::now(),
            sequence: 0,
        }
    }

    /// Empty placeholder stored by an acquisition loop when the device fails.
    pub fn sentinel() -> Self {
        Self::filled(0, 0, PixelFormat::Gray8, 0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.data.is_empty()
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// Acquisition time.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Position in the producing loop's acquisition order (0 = not from a loop).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixels. Detaches from every other holder of the buffer first.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Swap in a new image, possibly of a different size or format.
    pub fn replace_image(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<()> {
        check_len(width, height, format, data.len())?;
        self.data = Arc::new(data);
        self.width = width;
        self.height = height;
        self.format = format;
        Ok(())
    }

    /// Channel value at (x, y), or None outside the image.
    pub fn pixel(&self, x: u32, y: u32, channel: usize) -> Option<u8> {
        if x >= self.width || y >= self.height || channel >= self.channels() {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * self.channels() + channel;
        self.data.get(idx).copied()
    }

    /// Same dimensions, format and pixels. Metadata is ignored.
    pub fn same_image(&self, other: &Frame) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && self.data == other.data
    }

    /// True when both frames still point at one buffer.
    pub fn shares_buffer_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

fn check_len(width: u32, height: u32, format: PixelFormat, len: usize) -> Result<()> {
    let expected = width as usize * height as usize * format.channels();
    if expected != len {
        return Err(anyhow!(
            "frame buffer holds {} bytes, {}x{} {:?} needs {}",
            len,
            width,
            height,
            format,
            expected
        ));
    }
    Ok(())
}
