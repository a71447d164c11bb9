//! Imaging devices.
//!
//! This module provides the uniform handle the acquisition layer drives:
//! - `DeviceDriver`: the contract a concrete source (camera SDK, video file,
//!   still image) implements
//! - `DeviceHandle`: serializes every call to one driver behind a single
//!   mutex and owns the Closed/Open/Streaming/Error state machine
//! - `SyntheticDevice`: test-pattern source for `stub://` URLs
//! - `ImageFileDevice`: still image from disk (feature: media-image)
//!
//! A failed `next_frame` moves the handle to `Error`. The handle stays there
//! until somebody calls `open` (or `reopen`) again.

#[cfg(feature = "media-image")]
pub mod image_file;
pub mod synthetic;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{VisionError, VisionResult};
use crate::frame::Frame;

#[cfg(feature = "media-image")]
pub use image_file::ImageFileDevice;
pub use synthetic::SyntheticDevice;

/// Default bound on a single `next_frame` call.
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Highest target rate an acquisition loop will pace at.
pub const MAX_FRAME_RATE: u32 = 1000;

/// What kind of source sits behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Live,
    Video,
    Still,
}

impl DeviceKind {
    /// Files and stills have no frame clock of their own.
    pub fn requires_pacing(self) -> bool {
        !matches!(self, DeviceKind::Live)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Closed,
    Open,
    Streaming,
    Error,
}

/// Camera controls. Mode features take 1.0 for auto and 0.0 for manual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ExposureMode,
    ExposureValue,
    GainMode,
    GainValue,
    ShutterMode,
    ShutterValue,
    WhiteBalanceMode,
    WhiteBalanceBlue,
    WhiteBalanceRed,
    Gamma,
    Framerate,
}

impl Feature {
    pub const ALL: [Feature; 11] = [
        Feature::ExposureMode,
        Feature::ExposureValue,
        Feature::GainMode,
        Feature::GainValue,
        Feature::ShutterMode,
        Feature::ShutterValue,
        Feature::WhiteBalanceMode,
        Feature::WhiteBalanceBlue,
        Feature::WhiteBalanceRed,
        Feature::Gamma,
        Feature::Framerate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::ExposureMode => "exposure_mode",
            Feature::ExposureValue => "exposure_value",
            Feature::GainMode => "gain_mode",
            Feature::GainValue => "gain_value",
            Feature::ShutterMode => "shutter_mode",
            Feature::ShutterValue => "shutter_value",
            Feature::WhiteBalanceMode => "white_balance_mode",
            Feature::WhiteBalanceBlue => "white_balance_blue",
            Feature::WhiteBalanceRed => "white_balance_red",
            Feature::Gamma => "gamma",
            Feature::Framerate => "framerate",
        }
    }

    /// Parse a feature name (case-insensitive, `-` accepted for `_`).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|f| f.name() == normalized)
    }

    pub fn is_mode(self) -> bool {
        matches!(
            self,
            Feature::ExposureMode
                | Feature::GainMode
                | Feature::ShutterMode
                | Feature::WhiteBalanceMode
        )
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity and initial feature set of a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    /// Source locator: `stub://...` or a local path.
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Target frames per second for the acquisition loop.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Initial feature values applied on open, keyed by feature name.
    #[serde(default)]
    pub features: BTreeMap<String, f32>,
    #[serde(default = "default_timeout_ms")]
    pub acquisition_timeout_ms: u64,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    30
}

fn default_timeout_ms() -> u64 {
    DEFAULT_ACQUISITION_TIMEOUT.as_millis() as u64
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        let name = name.into();
        Self {
            source: format!("stub://{}", name),
            name,
            kind,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            features: BTreeMap::new(),
            acquisition_timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_feature(mut self, feature: Feature, value: f32) -> Self {
        self.features.insert(feature.name().to_string(), value);
        self
    }

    /// Target acquisition period derived from `fps` (30 fps when unset,
    /// capped at `MAX_FRAME_RATE`).
    pub fn frame_period(&self) -> Duration {
        let fps = if self.fps == 0 { 30 } else { self.fps.min(MAX_FRAME_RATE) };
        Duration::from_micros(1_000_000 / fps as u64)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms.max(1))
    }
}

/// Contract implemented by concrete device drivers.
///
/// The handle guarantees calls are serialized and arrive in a legal state;
/// drivers only talk to their hardware. Errors are plain `anyhow` errors;
/// the handle maps them onto the device taxonomy.
pub trait DeviceDriver: Send {
    /// Acquire the underlying device.
    fn open(&mut self, config: &DeviceConfig) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()>;

    fn set_streaming(&mut self, on: bool) -> anyhow::Result<()>;

    /// Produce the next frame, waiting at most `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> anyhow::Result<Frame>;

    fn supports(&self, feature: Feature) -> bool;

    fn get_feature(&mut self, feature: Feature) -> anyhow::Result<f32>;

    fn set_feature(&mut self, feature: Feature, value: f32) -> anyhow::Result<()>;
}

/// Pick a driver for a configured source.
pub fn driver_for(config: &DeviceConfig) -> anyhow::Result<Box<dyn DeviceDriver>> {
    if config.source.starts_with("stub://") || config.source.is_empty() {
        return Ok(Box::new(SyntheticDevice::new()));
    }
    if config.source.contains("://") {
        return Err(anyhow!(
            "device {}: only stub:// and local paths are supported (got {})",
            config.name,
            config.source
        ));
    }
    #[cfg(feature = "media-image")]
    {
        Ok(Box::new(ImageFileDevice::new(&config.source)))
    }
    #[cfg(not(feature = "media-image"))]
    {
        Err(anyhow!(
            "device {}: file sources require the media-image feature",
            config.name
        ))
    }
}

struct DeviceInner {
    driver: Box<dyn DeviceDriver>,
    state: DeviceState,
    sequence: u64,
}

/// One imaging source behind a single lock.
pub struct DeviceHandle {
    config: DeviceConfig,
    inner: Mutex<DeviceInner>,
}

impl DeviceHandle {
    pub fn new(config: DeviceConfig, driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            config,
            inner: Mutex::new(DeviceInner {
                driver,
                state: DeviceState::Closed,
                sequence: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn kind(&self) -> DeviceKind {
        self.config.kind
    }

    pub fn requires_pacing(&self) -> bool {
        self.config.kind.requires_pacing()
    }

    pub fn state(&self) -> VisionResult<DeviceState> {
        Ok(self.lock()?.state)
    }

    /// Closed (or Error) -> Open. Applies the configured initial features.
    pub fn open(&self) -> VisionResult<()> {
        let mut inner = self.lock()?;
        match inner.state {
            DeviceState::Closed | DeviceState::Error => {}
            state => return Err(self.invalid("open", state)),
        }
        if let Err(err) = inner.driver.open(&self.config) {
            inner.state = DeviceState::Error;
            return Err(VisionError::DeviceUnavailable {
                device: self.config.name.clone(),
                reason: err.to_string(),
            });
        }
        inner.state = DeviceState::Open;
        for (name, value) in &self.config.features {
            let Some(feature) = Feature::from_name(name) else {
                log::warn!("device {}: ignoring unknown feature '{}'", self.config.name, name);
                continue;
            };
            if !inner.driver.supports(feature) {
                log::warn!(
                    "device {}: feature {} not supported, initial value ignored",
                    self.config.name,
                    feature
                );
                continue;
            }
            if let Err(err) = inner.driver.set_feature(feature, *value) {
                log::warn!(
                    "device {}: failed to apply {}={}: {}",
                    self.config.name,
                    feature,
                    value,
                    err
                );
            }
        }
        log::info!("device {} opened", self.config.name);
        Ok(())
    }

    /// Any state -> Closed. Stops streaming first. Closing a closed handle is a no-op.
    pub fn close(&self) -> VisionResult<()> {
        let mut inner = self.lock()?;
        if inner.state == DeviceState::Closed {
            return Ok(());
        }
        if inner.state == DeviceState::Streaming {
            if let Err(err) = inner.driver.set_streaming(false) {
                log::warn!("device {}: stop streaming on close failed: {}", self.config.name, err);
            }
        }
        match inner.driver.close() {
            Ok(()) => {
                inner.state = DeviceState::Closed;
                log::info!("device {} closed", self.config.name);
                Ok(())
            }
            Err(err) => {
                inner.state = DeviceState::Error;
                Err(self.fault(err))
            }
        }
    }

    /// Close (ignoring errors) and open again. Clears the Error state.
    pub fn reopen(&self) -> VisionResult<()> {
        if let Err(err) = self.close() {
            log::warn!("device {}: close before reopen failed: {}", self.config.name, err);
        }
        self.open()
    }

    /// Open <-> Streaming.
    pub fn set_streaming(&self, on: bool) -> VisionResult<()> {
        let mut inner = self.lock()?;
        let target = if on {
            DeviceState::Streaming
        } else {
            DeviceState::Open
        };
        if inner.state == target {
            return Ok(());
        }
        match (inner.state, on) {
            (DeviceState::Open, true) | (DeviceState::Streaming, false) => {}
            (state, _) => return Err(self.invalid("toggle streaming", state)),
        }
        match inner.driver.set_streaming(on) {
            Ok(()) => {
                inner.state = target;
                Ok(())
            }
            Err(err) => {
                inner.state = DeviceState::Error;
                Err(self.fault(err))
            }
        }
    }

    /// Next frame from a streaming device, bounded by the acquisition timeout.
    ///
    /// Any failure, including a driver that overruns the timeout, moves the
    /// handle to `Error`.
    pub fn next_frame(&self) -> VisionResult<Frame> {
        let mut inner = self.lock()?;
        if inner.state != DeviceState::Streaming {
            return Err(self.invalid("acquire", inner.state));
        }
        let timeout = self.config.acquisition_timeout();
        let started = Instant::now();
        let result = inner.driver.next_frame(timeout);
        let elapsed = started.elapsed();
        let failure = match result {
            Ok(_) if elapsed > timeout => format!(
                "acquisition took {} ms, bound is {} ms",
                elapsed.as_millis(),
                timeout.as_millis()
            ),
            Ok(frame) => {
                inner.sequence += 1;
                return Ok(frame.with_sequence(inner.sequence));
            }
            Err(err) => err.to_string(),
        };
        inner.state = DeviceState::Error;
        Err(VisionError::AcquisitionFailed {
            device: self.config.name.clone(),
            reason: failure,
        })
    }

    pub fn get_feature(&self, feature: Feature) -> VisionResult<f32> {
        let mut inner = self.feature_access()?;
        if !inner.driver.supports(feature) {
            return Err(self.unsupported(feature));
        }
        inner.driver.get_feature(feature).map_err(|e| self.fault(e))
    }

    pub fn set_feature(&self, feature: Feature, value: f32) -> VisionResult<()> {
        let mut inner = self.feature_access()?;
        if !inner.driver.supports(feature) {
            return Err(self.unsupported(feature));
        }
        inner
            .driver
            .set_feature(feature, value)
            .map_err(|e| self.fault(e))
    }

    /// Same as `get_feature`, addressed by name.
    pub fn get_feature_by_name(&self, name: &str) -> VisionResult<f32> {
        let feature = self.parse_feature(name)?;
        self.get_feature(feature)
    }

    pub fn set_feature_by_name(&self, name: &str, value: f32) -> VisionResult<()> {
        let feature = self.parse_feature(name)?;
        self.set_feature(feature, value)
    }

    fn parse_feature(&self, name: &str) -> VisionResult<Feature> {
        Feature::from_name(name).ok_or_else(|| VisionError::UnsupportedFeature {
            device: self.config.name.clone(),
            feature: name.to_string(),
        })
    }

    fn feature_access(&self) -> VisionResult<MutexGuard<'_, DeviceInner>> {
        let inner = self.lock()?;
        match inner.state {
            DeviceState::Open | DeviceState::Streaming => Ok(inner),
            state => Err(VisionError::HardwareFault {
                device: self.config.name.clone(),
                reason: format!("features unavailable while {:?}", state),
            }),
        }
    }

    fn lock(&self) -> VisionResult<MutexGuard<'_, DeviceInner>> {
        self.inner
            .lock()
            .map_err(|_| VisionError::LockPoisoned("device"))
    }

    fn invalid(&self, operation: &'static str, state: DeviceState) -> VisionError {
        VisionError::InvalidTransition {
            device: self.config.name.clone(),
            operation,
            state,
        }
    }

    fn unsupported(&self, feature: Feature) -> VisionError {
        VisionError::UnsupportedFeature {
            device: self.config.name.clone(),
            feature: feature.name().to_string(),
        }
    }

    fn fault(&self, err: anyhow::Error) -> VisionError {
        VisionError::HardwareFault {
            device: self.config.name.clone(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(kind: DeviceKind) -> DeviceHandle {
        let config = DeviceConfig::new("cam", kind).with_size(8, 6);
        DeviceHandle::new(config, Box::new(SyntheticDevice::new()))
    }

    struct BrokenDriver;

    impl DeviceDriver for BrokenDriver {
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
            Err(anyhow!("sensor disconnected"))
        }
        fn supports(&self, _feature: Feature) -> bool {
            false
        }
        fn get_feature(&mut self, feature: Feature) -> anyhow::Result<f32> {
            Err(anyhow!("no {}", feature))
        }
        fn set_feature(&mut self, feature: Feature, _value: f32) -> anyhow::Result<()> {
            Err(anyhow!("no {}", feature))
        }
    }

    #[test]
    fn lifecycle_follows_state_machine() {
        let device = synthetic(DeviceKind::Live);
        assert_eq!(device.state().unwrap(), DeviceState::Closed);
        assert!(device.set_streaming(true).is_err());

        device.open().unwrap();
        assert_eq!(device.state().unwrap(), DeviceState::Open);
        assert!(matches!(
            device.open(),
            Err(VisionError::InvalidTransition { .. })
        ));

        device.set_streaming(true).unwrap();
        let frame = device.next_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.sequence(), 1);

        device.set_streaming(false).unwrap();
        assert_eq!(device.state().unwrap(), DeviceState::Open);
        device.close().unwrap();
        assert_eq!(device.state().unwrap(), DeviceState::Closed);
    }

    #[test]
    fn failed_acquisition_requires_reopen() {
        let device = DeviceHandle::new(DeviceConfig::new("bad", DeviceKind::Live), Box::new(BrokenDriver));
        device.open().unwrap();
        device.set_streaming(true).unwrap();

        let err = device.next_frame().unwrap_err();
        assert_eq!(err.code(), "AcquisitionFailed");
        assert_eq!(device.state().unwrap(), DeviceState::Error);
        assert!(matches!(
            device.next_frame(),
            Err(VisionError::InvalidTransition { .. })
        ));

        device.reopen().unwrap();
        assert_eq!(device.state().unwrap(), DeviceState::Open);
    }

    #[test]
    fn features_require_open_device() {
        let device = synthetic(DeviceKind::Live);
        let err = device.set_feature(Feature::GainValue, 2.0).unwrap_err();
        assert_eq!(err.code(), "HardwareFault");

        device.open().unwrap();
        device.set_feature(Feature::GainValue, 2.0).unwrap();
        assert_eq!(device.get_feature(Feature::GainValue).unwrap(), 2.0);
        assert_eq!(device.get_feature_by_name("Gain-Value").unwrap(), 2.0);

        let err = device.get_feature_by_name("zoom").unwrap_err();
        assert_eq!(err.code(), "UnsupportedFeature");
    }

    #[test]
    fn still_sources_are_paced_and_lack_camera_features() {
        let device = synthetic(DeviceKind::Still);
        assert!(device.requires_pacing());
        device.open().unwrap();
        let err = device.set_feature(Feature::ExposureValue, 10.0).unwrap_err();
        assert_eq!(err.code(), "UnsupportedFeature");
        assert!(!synthetic(DeviceKind::Live).requires_pacing());
    }

    #[test]
    fn initial_features_are_applied_on_open() {
        let config = DeviceConfig::new("cam", DeviceKind::Live)
            .with_feature(Feature::ShutterValue, 500.0)
            .with_feature(Feature::GainMode, 0.0);
        let device = DeviceHandle::new(config, Box::new(SyntheticDevice::new()));
        device.open().unwrap();
        assert_eq!(device.get_feature(Feature::ShutterValue).unwrap(), 500.0);
        assert_eq!(device.get_feature(Feature::GainMode).unwrap(), 0.0);
    }

    #[test]
    fn feature_names_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(Feature::from_name(feature.name()), Some(feature));
        }
        assert_eq!(Feature::from_name("WHITE_BALANCE_RED"), Some(Feature::WhiteBalanceRed));
        assert!(Feature::GainMode.is_mode());
        assert!(!Feature::Gamma.is_mode());
    }
}
