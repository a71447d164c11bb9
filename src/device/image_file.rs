//! Still image device.
//!
//! Decodes a local image once on open and serves it on every `next_frame`.
//! The acquisition loop paces it (stills have no frame clock).

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, SystemTime};

use super::{DeviceConfig, DeviceDriver, Feature};
use crate::frame::{Frame, PixelFormat};

pub struct ImageFileDevice {
    path: String,
    image: Option<Frame>,
    streaming: bool,
    framerate: f32,
}

impl ImageFileDevice {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            image: None,
            streaming: false,
            framerate: 30.0,
        }
    }
}

impl DeviceDriver for ImageFileDevice {
    fn open(&mut self, config: &DeviceConfig) -> Result<()> {
        let decoded = image::open(&self.path)
            .with_context(|| format!("decode image {}", self.path))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        self.image = Some(Frame::new(
            width,
            height,
            PixelFormat::Rgb8,
            decoded.into_raw(),
        )?);
        self.framerate = config.fps.max(1) as f32;
        log::info!("ImageFileDevice: loaded {} ({}x{})", self.path, width, height);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.image = None;
        self.streaming = false;
        Ok(())
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        if self.image.is_none() {
            return Err(anyhow!("image {} is not loaded", self.path));
        }
        self.streaming = on;
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame> {
        if !self.streaming {
            return Err(anyhow!("image {} is not streaming", self.path));
        }
        self.image
            .as_ref()
            .map(|frame| frame.clone().with_timestamp(SystemTime::now()))
            .ok_or_else(|| anyhow!("image {} is not loaded", self.path))
    }

    fn supports(&self, feature: Feature) -> bool {
        feature == Feature::Framerate
    }

    fn get_feature(&mut self, _feature: Feature) -> Result<f32> {
        Ok(self.framerate)
    }

    fn set_feature(&mut self, _feature: Feature, value: f32) -> Result<()> {
        self.framerate = value;
        Ok(())
    }
}
