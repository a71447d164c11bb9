use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{VisionError, VisionResult};
use crate::pipeline::{Pipeline, PipelineDefinition, PipelineStore, StageFactory};

struct PipelineEntry {
    pipeline: Arc<Pipeline>,
    /// Task currently running this instance.
    owner: Option<String>,
}

/// Live pipeline instances plus the store they are loaded from.
///
/// An instance is created from its stored definition on first use and edited
/// in place afterwards. `save` writes it back; `release` by the owning task
/// discards it, so unsaved edits live exactly as long as the task.
pub struct PipelineRegistry {
    store: PipelineStore,
    factory: Arc<StageFactory>,
    instances: Mutex<HashMap<String, PipelineEntry>>,
}

impl PipelineRegistry {
    pub fn new(store: PipelineStore, factory: StageFactory) -> Self {
        Self {
            store,
            factory: Arc::new(factory),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn factory(&self) -> &Arc<StageFactory> {
        &self.factory
    }

    /// Stored and live pipeline names, sorted and de-duplicated.
    pub fn names(&self) -> VisionResult<Vec<String>> {
        let mut names = self.store.list()?;
        names.extend(self.lock()?.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn stage_types(&self) -> Vec<String> {
        self.factory.list()
    }

    /// Live instance for `name`, loading it from the store if needed.
    pub fn instance(&self, name: &str) -> VisionResult<Arc<Pipeline>> {
        if let Some(entry) = self.lock()?.get(name) {
            return Ok(entry.pipeline.clone());
        }
        // Store I/O happens outside the map lock.
        let def = self.store.load(name)?;
        let pipeline = Arc::new(Pipeline::from_definition(&def, self.factory.clone())?);
        let mut instances = self.lock()?;
        let entry = instances.entry(name.to_string()).or_insert_with(|| {
            log::info!("pipeline {} instantiated ({} stages)", name, def.stages.len());
            PipelineEntry {
                pipeline,
                owner: None,
            }
        });
        Ok(entry.pipeline.clone())
    }

    /// Live instance if one exists. Never touches the store.
    pub fn running(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.lock()
            .ok()
            .and_then(|instances| instances.get(name).map(|e| e.pipeline.clone()))
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|instances| instances.get(name).and_then(|e| e.owner.clone()))
    }

    /// Hand the instance to `task`. A pipeline runs in at most one task.
    pub fn bind(&self, name: &str, task: &str) -> VisionResult<Arc<Pipeline>> {
        self.instance(name)?;
        let mut instances = self.lock()?;
        let entry = instances
            .get_mut(name)
            .ok_or_else(|| VisionError::unknown("pipeline", name))?;
        if let Some(holder) = entry.owner.as_deref().filter(|holder| *holder != task) {
            return Err(VisionError::ResourceBusy {
                kind: "pipeline",
                name: name.to_string(),
                holder: format!("task {}", holder),
            });
        }
        entry.owner = Some(task.to_string());
        Ok(entry.pipeline.clone())
    }

    /// Called when `task` stops. Drops the instance.
    pub fn release(&self, name: &str, task: &str) -> VisionResult<()> {
        let mut instances = self.lock()?;
        match instances.get(name) {
            Some(entry) if entry.owner.as_deref() == Some(task) => {
                instances.remove(name);
                log::info!("pipeline {} released by task {}", name, task);
                Ok(())
            }
            Some(_) => Err(VisionError::ResourceBusy {
                kind: "pipeline",
                name: name.to_string(),
                holder: "another task".to_string(),
            }),
            None => Err(VisionError::unknown("pipeline", name)),
        }
    }

    /// Persist the live instance (or re-save the stored definition).
    pub fn save(&self, name: &str) -> VisionResult<()> {
        let def = match self.running(name) {
            Some(pipeline) => pipeline.to_definition()?,
            None => self.store.load(name)?,
        };
        self.store.save(&def)?;
        log::info!("pipeline {} saved", name);
        Ok(())
    }

    pub fn definition(&self, name: &str) -> VisionResult<PipelineDefinition> {
        match self.running(name) {
            Some(pipeline) => pipeline.to_definition(),
            None => self.store.load(name),
        }
    }

    /// Create an empty stored pipeline. Returns false if it already existed.
    pub fn create(&self, name: &str) -> VisionResult<bool> {
        let created = self.store.create(name)?;
        if created {
            log::info!("pipeline {} created", name);
        }
        Ok(created)
    }

    /// Delete a stored pipeline. Refused while a task runs it.
    pub fn erase(&self, name: &str) -> VisionResult<()> {
        {
            let mut instances = self.lock()?;
            if let Some(holder) = instances.get(name).and_then(|e| e.owner.clone()) {
                return Err(VisionError::ResourceBusy {
                    kind: "pipeline",
                    name: name.to_string(),
                    holder: format!("task {}", holder),
                });
            }
            instances.remove(name);
        }
        self.store.erase(name)?;
        log::info!("pipeline {} erased", name);
        Ok(())
    }

    /// Copy `from` (live edits included) to a new stored definition `to`.
    pub fn copy(&self, from: &str, to: &str) -> VisionResult<()> {
        let mut def = self.definition(from)?;
        def.name = to.to_string();
        self.store.save(&def)?;
        log::info!("pipeline {} copied to {}", from, to);
        Ok(())
    }

    fn lock(&self) -> VisionResult<MutexGuard<'_, HashMap<String, PipelineEntry>>> {
        self.instances
            .lock()
            .map_err(|_| VisionError::LockPoisoned("pipeline registry"))
    }
}
