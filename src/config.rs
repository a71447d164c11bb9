use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{
    DeviceConfig, DeviceKind, Feature, DEFAULT_ACQUISITION_TIMEOUT, MAX_FRAME_RATE,
};
use crate::task::TaskDescriptor;

const DEFAULT_PIPELINE_DIR: &str = "pipelines";
const DEFAULT_DEVICE_NAME: &str = "front";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_HEALTH_LOG_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct VisiondConfigFile {
    pipeline_dir: Option<PathBuf>,
    recording_dir: Option<PathBuf>,
    default_fps: Option<u32>,
    health_log_secs: Option<u64>,
    devices: Option<Vec<DeviceConfigFile>>,
    tasks: Option<Vec<TaskDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfigFile {
    name: String,
    kind: Option<DeviceKind>,
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    features: Option<BTreeMap<String, f32>>,
    acquisition_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct VisiondConfig {
    pub pipeline_dir: PathBuf,
    pub recording_dir: Option<PathBuf>,
    pub devices: Vec<DeviceConfig>,
    pub tasks: Vec<TaskDescriptor>,
    pub health_interval: Duration,
}

impl VisiondConfig {
    /// Load from `VISION_CONFIG` (JSON, or TOML for `.toml` paths), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let default_fps = match std::env::var("VISION_DEFAULT_FPS") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow!("VISION_DEFAULT_FPS must be a whole number of frames"))?,
            ),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default(), default_fps);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `fps_override` replaces the file's `default_fps` (devices with an
    /// explicit fps keep it).
    fn from_file(file: VisiondConfigFile, fps_override: Option<u32>) -> Self {
        let default_fps = fps_override
            .or(file.default_fps)
            .unwrap_or(DEFAULT_FPS);
        let devices = match file.devices {
            Some(devices) => devices
                .into_iter()
                .map(|device| device.into_config(default_fps))
                .collect(),
            None => vec![DeviceConfig::new(DEFAULT_DEVICE_NAME, DeviceKind::Live)
                .with_size(DEFAULT_WIDTH, DEFAULT_HEIGHT)
                .with_fps(default_fps)],
        };
        Self {
            pipeline_dir: file
                .pipeline_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINE_DIR)),
            recording_dir: file.recording_dir,
            devices,
            tasks: file.tasks.unwrap_or_default(),
            health_interval: Duration::from_secs(
                file.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("VISION_PIPELINE_DIR") {
            if !dir.trim().is_empty() {
                self.pipeline_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("VISION_RECORDING_DIR") {
            if !dir.trim().is_empty() {
                self.recording_dir = Some(PathBuf::from(dir));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(anyhow!("device names must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(anyhow!("device '{}' declared twice", device.name));
            }
            if device.fps == 0 || device.fps > MAX_FRAME_RATE {
                return Err(anyhow!(
                    "device '{}': fps must be between 1 and {}",
                    device.name,
                    MAX_FRAME_RATE
                ));
            }
            for feature in device.features.keys() {
                if Feature::from_name(feature).is_none() {
                    return Err(anyhow!(
                        "device '{}': unknown feature '{}'",
                        device.name,
                        feature
                    ));
                }
            }
        }
        let mut task_names = HashSet::new();
        for task in &self.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(anyhow!("task '{}' declared twice", task.name));
            }
            if !names.contains(task.device.as_str()) {
                return Err(anyhow!(
                    "task '{}' references undeclared device '{}'",
                    task.name,
                    task.device
                ));
            }
        }
        if self.health_interval.is_zero() {
            return Err(anyhow!("health_log_secs must be greater than zero"));
        }
        Ok(())
    }
}

impl DeviceConfigFile {
    fn into_config(self, default_fps: u32) -> DeviceConfig {
        let mut config = DeviceConfig::new(self.name, self.kind.unwrap_or(DeviceKind::Live))
            .with_size(
                self.width.unwrap_or(DEFAULT_WIDTH),
                self.height.unwrap_or(DEFAULT_HEIGHT),
            )
            .with_fps(self.fps.unwrap_or(default_fps));
        if let Some(source) = self.source.filter(|s| !s.trim().is_empty()) {
            config = config.with_source(source);
        }
        config.features = self.features.unwrap_or_default();
        config.acquisition_timeout_ms = self
            .acquisition_timeout_ms
            .unwrap_or(DEFAULT_ACQUISITION_TIMEOUT.as_millis() as u64);
        config
    }
}

fn read_config_file(path: &Path) -> Result<VisiondConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
