use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::acquisition::AcquisitionLoop;
use crate::device::{self, DeviceConfig, DeviceDriver, DeviceHandle, DeviceState};
use crate::error::{VisionError, VisionResult};

/// Loop shared by every task attached to one device.
struct Streamer {
    acquisition: Option<Arc<AcquisitionLoop>>,
    refs: usize,
}

struct DeviceSlot {
    handle: Arc<DeviceHandle>,
    streamer: Mutex<Streamer>,
}

impl DeviceSlot {
    fn streamer(&self) -> VisionResult<MutexGuard<'_, Streamer>> {
        self.streamer
            .lock()
            .map_err(|_| VisionError::LockPoisoned("device streamer"))
    }
}

/// Device handles by name, plus the reference-counted loop of each.
///
/// The map lock only guards lookups. Opening devices and starting or stopping
/// loops happens under the per-device streamer lock, so one slow camera does
/// not block the others.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceSlot>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with an explicit driver. An existing device with the
    /// same name is returned unchanged.
    pub fn register(&self, config: DeviceConfig, driver: Box<dyn DeviceDriver>) -> VisionResult<Arc<DeviceHandle>> {
        let mut devices = self.lock()?;
        if let Some(slot) = devices.get(&config.name) {
            return Ok(slot.handle.clone());
        }
        let name = config.name.clone();
        let handle = Arc::new(DeviceHandle::new(config, driver));
        devices.insert(
            name.clone(),
            Arc::new(DeviceSlot {
                handle: handle.clone(),
                streamer: Mutex::new(Streamer {
                    acquisition: None,
                    refs: 0,
                }),
            }),
        );
        log::info!("device {} registered ({:?})", name, handle.kind());
        Ok(handle)
    }

    /// Register a device, picking the driver from its `source`.
    pub fn register_config(&self, config: DeviceConfig) -> VisionResult<Arc<DeviceHandle>> {
        if let Ok(existing) = self.get(&config.name) {
            return Ok(existing);
        }
        let driver = device::driver_for(&config).map_err(|e| VisionError::DeviceUnavailable {
            device: config.name.clone(),
            reason: e.to_string(),
        })?;
        self.register(config, driver)
    }

    pub fn get(&self, name: &str) -> VisionResult<Arc<DeviceHandle>> {
        Ok(self.slot(name)?.handle.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_ok()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Attach to the device's loop, starting it (and the device) for the
    /// first user.
    pub fn acquire_loop(&self, name: &str) -> VisionResult<Arc<AcquisitionLoop>> {
        let slot = self.slot(name)?;
        let mut streamer = slot.streamer()?;
        if let Some(acquisition) = streamer.acquisition.clone() {
            streamer.refs += 1;
            log::debug!("device {}: loop attached ({} users)", name, streamer.refs);
            return Ok(acquisition);
        }

        let handle = &slot.handle;
        if matches!(handle.state()?, DeviceState::Closed | DeviceState::Error) {
            handle.open()?;
        }
        if let Err(err) = handle.set_streaming(true) {
            close_after_failure(handle, name);
            return Err(err);
        }
        let acquisition = Arc::new(AcquisitionLoop::new(handle.clone()));
        if let Err(err) = acquisition.start() {
            close_after_failure(handle, name);
            return Err(err);
        }
        streamer.acquisition = Some(acquisition.clone());
        streamer.refs = 1;
        Ok(acquisition)
    }

    /// Drop one reference. The last one stops the loop and closes the
    /// device. Returns true when the loop was stopped.
    pub fn release_loop(&self, name: &str) -> VisionResult<bool> {
        let slot = self.slot(name)?;
        let mut streamer = slot.streamer()?;
        if streamer.acquisition.is_none() {
            return Err(VisionError::unknown("acquisition loop", name));
        }
        streamer.refs = streamer.refs.saturating_sub(1);
        if streamer.refs > 0 {
            log::debug!("device {}: loop detached ({} users)", name, streamer.refs);
            return Ok(false);
        }
        let Some(acquisition) = streamer.acquisition.take() else {
            return Ok(false);
        };
        acquisition.stop()?;
        slot.handle.close()?;
        Ok(true)
    }

    /// Loop currently running on the device, if any.
    pub fn loop_for(&self, name: &str) -> Option<Arc<AcquisitionLoop>> {
        let slot = self.slot(name).ok()?;
        let streamer = slot.streamer().ok()?;
        streamer.acquisition.clone()
    }

    pub fn loop_refs(&self, name: &str) -> usize {
        self.slot(name)
            .ok()
            .and_then(|slot| slot.streamer().ok().map(|s| s.refs))
            .unwrap_or(0)
    }

    /// Re-open a device, typically after it went to `Error`. A running loop
    /// picks the device back up on its next iteration.
    pub fn reopen(&self, name: &str) -> VisionResult<()> {
        let slot = self.slot(name)?;
        let streamer = slot.streamer()?;
        slot.handle.reopen()?;
        if streamer.acquisition.is_some() {
            slot.handle.set_streaming(true)?;
        }
        log::info!("device {} reopened", name);
        Ok(())
    }

    /// Unregister a device. Fails while a loop still references it.
    pub fn remove(&self, name: &str) -> VisionResult<()> {
        let slot = self.slot(name)?;
        {
            let streamer = slot.streamer()?;
            if streamer.acquisition.is_some() {
                return Err(VisionError::ResourceBusy {
                    kind: "device",
                    name: name.to_string(),
                    holder: format!("{} task(s)", streamer.refs),
                });
            }
            self.lock()?.remove(name);
        }
        slot.handle.close()?;
        log::info!("device {} removed", name);
        Ok(())
    }

    fn slot(&self, name: &str) -> VisionResult<Arc<DeviceSlot>> {
        self.lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| VisionError::unknown("device", name))
    }

    fn lock(&self) -> VisionResult<MutexGuard<'_, HashMap<String, Arc<DeviceSlot>>>> {
        self.devices
            .lock()
            .map_err(|_| VisionError::LockPoisoned("device registry"))
    }
}

fn close_after_failure(handle: &DeviceHandle, name: &str) {
    if let Err(err) = handle.close() {
        log::warn!("device {}: close after failed start: {}", name, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, Feature, SyntheticDevice};
    use crate::frame::Frame;
    use anyhow::anyhow;
    use std::time::Duration;

    /// Opens, but refuses to stream.
    struct NoStreamDriver;

    impl DeviceDriver for NoStreamDriver {
        fn open(&mut self, _: &DeviceConfig) -> anyhow::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn set_streaming(&mut self, _: bool) -> anyhow::Result<()> {
            Err(anyhow!("stream on refused"))
        }

        fn next_frame(&mut self, _: Duration) -> anyhow::Result<Frame> {
            Err(anyhow!("not streaming"))
        }

        fn supports(&self, _: Feature) -> bool {
            false
        }

        fn get_feature(&mut self, feature: Feature) -> anyhow::Result<f32> {
            Err(anyhow!("{} not supported", feature))
        }

        fn set_feature(&mut self, feature: Feature, _: f32) -> anyhow::Result<()> {
            Err(anyhow!("{} not supported", feature))
        }
    }

    fn registry() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        let config = DeviceConfig::new("front", DeviceKind::Video)
            .with_size(4, 4)
            .with_fps(100);
        registry
            .register(config, Box::new(SyntheticDevice::new()))
            .unwrap();
        registry
    }

    #[test]
    fn register_is_idempotent() -> VisionResult<()> {
        let registry = registry();
        let first = registry.get("front")?;
        let again = registry.register_config(DeviceConfig::new("front", DeviceKind::Live))?;
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.kind(), DeviceKind::Video);
        assert_eq!(registry.names(), vec!["front"]);
        Ok(())
    }

    #[test]
    fn loop_is_shared_and_refcounted() -> VisionResult<()> {
        let registry = registry();
        let a = registry.acquire_loop("front")?;
        let b = registry.acquire_loop("front")?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.loop_refs("front"), 2);
        assert_eq!(registry.get("front")?.state()?, DeviceState::Streaming);

        assert!(!registry.release_loop("front")?);
        assert!(a.is_running());
        assert!(registry.release_loop("front")?);
        assert!(!a.is_running());
        assert_eq!(registry.get("front")?.state()?, DeviceState::Closed);
        assert!(registry.loop_for("front").is_none());
        Ok(())
    }

    #[test]
    fn failed_stream_on_closes_device() -> VisionResult<()> {
        let registry = DeviceRegistry::new();
        registry.register(
            DeviceConfig::new("bottom", DeviceKind::Video),
            Box::new(NoStreamDriver),
        )?;
        let err = registry.acquire_loop("bottom").unwrap_err();
        assert_eq!(err.code(), "HardwareFault");
        assert_eq!(registry.get("bottom")?.state()?, DeviceState::Closed);
        assert!(registry.loop_for("bottom").is_none());
        assert_eq!(registry.loop_refs("bottom"), 0);
        Ok(())
    }

    #[test]
    fn busy_device_cannot_be_removed() -> VisionResult<()> {
        let registry = registry();
        registry.acquire_loop("front")?;
        assert_eq!(registry.remove("front").unwrap_err().code(), "ResourceBusy");
        registry.release_loop("front")?;
        registry.remove("front")?;
        assert_eq!(registry.get("front").unwrap_err().code(), "UnknownName");
        Ok(())
    }

    #[test]
    fn unknown_scheme_is_unavailable() {
        let registry = DeviceRegistry::new();
        let config = DeviceConfig::new("gige", DeviceKind::Live).with_source("gige://10.0.0.2");
        let err = registry.register_config(config).unwrap_err();
        assert_eq!(err.code(), "DeviceUnavailable");
    }
}
