//! Synthetic device for `stub://` sources and tests.
//!
//! Produces an RGB test pattern that shifts every frame and changes "scene"
//! every 50 frames. Exposure and gain scale the pattern so feature changes are
//! visible downstream. Live kinds expose every camera feature and deliver at
//! their `Framerate` like a real sensor; file-like kinds only expose
//! `Framerate` and leave pacing to the acquisition loop.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{DeviceConfig, DeviceDriver, DeviceKind, Feature};
use crate::frame::{Frame, PixelFormat};

pub struct SyntheticDevice {
    width: u32,
    height: u32,
    kind: DeviceKind,
    opened: bool,
    streaming: bool,
    frame_count: u64,
    scene_state: u8,
    /// Amplitude of random per-pixel noise (0 = deterministic).
    noise: u8,
    features: HashMap<Feature, f32>,
    next_due: Option<Instant>,
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            kind: DeviceKind::Live,
            opened: false,
            streaming: false,
            frame_count: 0,
            scene_state: 0,
            noise: 0,
            features: default_features(),
            next_due: None,
        }
    }

    pub fn with_noise(mut self, amplitude: u8) -> Self {
        self.noise = amplitude;
        self
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let scale = self.brightness_scale();
        let pixel_count = self.width as usize * self.height as usize * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let base = (i as u64 + self.frame_count + self.scene_state as u64) % 256;
            let mut value = (base as f32 * scale).min(255.0) as u8;
            if self.noise > 0 {
                value = value.saturating_add(rand::random::<u8>() % self.noise);
            }
            *pixel = value;
        }
        pixels
    }

    /// Live cameras deliver on their own clock; emulate it from `Framerate`.
    fn wait_for_frame_clock(&mut self, timeout: Duration) {
        let fps = self
            .features
            .get(&Feature::Framerate)
            .copied()
            .unwrap_or(30.0)
            .max(1.0);
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep((due - now).min(timeout));
            }
        }
        self.next_due = Some(Instant::now() + Duration::from_secs_f32(1.0 / fps));
    }

    fn brightness_scale(&self) -> f32 {
        let manual = |mode: Feature| self.features.get(&mode).copied().unwrap_or(1.0) < 0.5;
        let mut scale = 1.0;
        if manual(Feature::GainMode) {
            scale *= self.features.get(&Feature::GainValue).copied().unwrap_or(1.0);
        }
        if manual(Feature::ExposureMode) {
            let exposure = self
                .features
                .get(&Feature::ExposureValue)
                .copied()
                .unwrap_or(100.0);
            scale *= exposure / 100.0;
        }
        scale.max(0.0)
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn default_features() -> HashMap<Feature, f32> {
    Feature::ALL
        .into_iter()
        .map(|feature| {
            let value = match feature {
                Feature::ExposureMode
                | Feature::GainMode
                | Feature::ShutterMode
                | Feature::WhiteBalanceMode => 1.0,
                Feature::ExposureValue => 100.0,
                Feature::GainValue => 1.0,
                Feature::ShutterValue => 500.0,
                Feature::WhiteBalanceBlue => 511.0,
                Feature::WhiteBalanceRed => 412.0,
                Feature::Gamma => 1.0,
                Feature::Framerate => 30.0,
            };
            (feature, value)
        })
        .collect()
}

impl DeviceDriver for SyntheticDevice {
    fn open(&mut self, config: &DeviceConfig) -> Result<()> {
        self.width = config.width;
        self.height = config.height;
        self.kind = config.kind;
        self.features
            .insert(Feature::Framerate, config.fps.max(1) as f32);
        self.opened = true;
        log::info!("SyntheticDevice: opened {} (synthetic)", config.source);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        self.streaming = false;
        Ok(())
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        if !self.opened {
            return Err(anyhow!("synthetic device is not open"));
        }
        self.streaming = on;
        self.next_due = None;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        if !self.streaming {
            return Err(anyhow!("synthetic device is not streaming"));
        }
        if self.kind == DeviceKind::Live {
            self.wait_for_frame_clock(timeout);
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(self.width, self.height, PixelFormat::Rgb8, pixels)
    }

    fn supports(&self, feature: Feature) -> bool {
        match self.kind {
            DeviceKind::Live => true,
            DeviceKind::Video | DeviceKind::Still => feature == Feature::Framerate,
        }
    }

    fn get_feature(&mut self, feature: Feature) -> Result<f32> {
        self.features
            .get(&feature)
            .copied()
            .ok_or_else(|| anyhow!("feature {} has no value", feature))
    }

    fn set_feature(&mut self, feature: Feature, value: f32) -> Result<()> {
        if feature.is_mode() && value != 0.0 && value != 1.0 {
            return Err(anyhow!("{} takes 0 (manual) or 1 (auto), got {}", feature, value));
        }
        if value.is_nan() || value < 0.0 {
            return Err(anyhow!("{} rejects negative value {}", feature, value));
        }
        self.features.insert(feature, value);
        Ok(())
    }
}
