use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{VisionError, VisionResult};
use crate::task::ProcessingTask;

enum TaskSlot {
    /// Name reserved while the task's resources are being acquired.
    Starting,
    Running(Arc<ProcessingTask>),
}

/// Running tasks by name.
///
/// Starting a task is two-phase: `reserve` claims the name under the map
/// lock, the caller builds the task without holding it, then `commit` or
/// `abandon` settles the slot.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskSlot>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, name: &str) -> VisionResult<()> {
        let mut tasks = self.lock()?;
        if tasks.contains_key(name) {
            return Err(VisionError::DuplicateTask(name.to_string()));
        }
        tasks.insert(name.to_string(), TaskSlot::Starting);
        Ok(())
    }

    pub fn commit(&self, task: Arc<ProcessingTask>) -> VisionResult<()> {
        self.lock()?
            .insert(task.name().to_string(), TaskSlot::Running(task));
        Ok(())
    }

    pub fn abandon(&self, name: &str) {
        if let Ok(mut tasks) = self.lock() {
            if matches!(tasks.get(name), Some(TaskSlot::Starting)) {
                tasks.remove(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> VisionResult<Arc<ProcessingTask>> {
        match self.lock()?.get(name) {
            Some(TaskSlot::Running(task)) => Ok(task.clone()),
            Some(TaskSlot::Starting) => Err(starting(name)),
            None => Err(VisionError::unknown("task", name)),
        }
    }

    /// Remove a running task from the map. The caller stops it.
    pub fn take(&self, name: &str) -> VisionResult<Arc<ProcessingTask>> {
        let mut tasks = self.lock()?;
        match tasks.remove(name) {
            Some(TaskSlot::Running(task)) => Ok(task),
            Some(TaskSlot::Starting) => {
                tasks.insert(name.to_string(), TaskSlot::Starting);
                Err(starting(name))
            }
            None => Err(VisionError::unknown("task", name)),
        }
    }

    /// Every running task, removed from the map.
    pub fn take_all(&self) -> Vec<Arc<ProcessingTask>> {
        let Ok(mut tasks) = self.lock() else {
            return Vec::new();
        };
        let names: Vec<String> = tasks
            .iter()
            .filter(|(_, slot)| matches!(slot, TaskSlot::Running(_)))
            .map(|(name, _)| name.clone())
            .collect();
        let mut taken: Vec<Arc<ProcessingTask>> = names
            .iter()
            .filter_map(|name| match tasks.remove(name) {
                Some(TaskSlot::Running(task)) => Some(task),
                _ => None,
            })
            .collect();
        taken.sort_by(|a, b| a.name().cmp(b.name()));
        taken
    }

    /// Running task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|(_, slot)| matches!(slot, TaskSlot::Running(_)))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> VisionResult<MutexGuard<'_, HashMap<String, TaskSlot>>> {
        self.tasks
            .lock()
            .map_err(|_| VisionError::LockPoisoned("task registry"))
    }
}

fn starting(name: &str) -> VisionError {
    VisionError::ResourceBusy {
        kind: "task",
        name: name.to_string(),
        holder: "startup".to_string(),
    }
}
