//! Pipeline definition persistence.
//!
//! A store is either a directory holding one `<name>.json` file per
//! definition, or an in-memory map (tests, ephemeral daemons). Writes go
//! through a temp file and a rename so a crash never leaves half a definition.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::definition::PipelineDefinition;
use crate::error::{VisionError, VisionResult};

const EXTENSION: &str = "json";

enum Backing {
    Directory(PathBuf),
    Memory(Mutex<BTreeMap<String, PipelineDefinition>>),
}

pub struct PipelineStore {
    backing: Backing,
}

impl PipelineStore {
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(BTreeMap::new())),
        }
    }

    /// Open (creating if needed) a directory-backed store.
    pub fn open(dir: impl AsRef<Path>) -> VisionResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            VisionError::Storage(format!("create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            backing: Backing::Directory(dir),
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Directory(dir) => Some(dir),
            Backing::Memory(_) => None,
        }
    }

    /// Stored definition names, sorted.
    pub fn list(&self) -> VisionResult<Vec<String>> {
        match &self.backing {
            Backing::Directory(dir) => {
                let entries = fs::read_dir(dir).map_err(|e| storage("list", dir, e))?;
                let mut names = Vec::new();
                for entry in entries {
                    let path = entry.map_err(|e| storage("list", dir, e))?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
                names.sort();
                Ok(names)
            }
            Backing::Memory(map) => Ok(lock(map)?.keys().cloned().collect()),
        }
    }

    pub fn exists(&self, name: &str) -> VisionResult<bool> {
        check_name(name)?;
        match &self.backing {
            Backing::Directory(dir) => Ok(path_for(dir, name).is_file()),
            Backing::Memory(map) => Ok(lock(map)?.contains_key(name)),
        }
    }

    pub fn load(&self, name: &str) -> VisionResult<PipelineDefinition> {
        check_name(name)?;
        let mut def = match &self.backing {
            Backing::Directory(dir) => {
                let path = path_for(dir, name);
                if !path.is_file() {
                    return Err(VisionError::unknown("pipeline", name));
                }
                let raw = fs::read(&path).map_err(|e| storage("read", &path, e))?;
                serde_json::from_slice::<PipelineDefinition>(&raw).map_err(|e| {
                    VisionError::Storage(format!("parse {}: {}", path.display(), e))
                })?
            }
            Backing::Memory(map) => lock(map)?
                .get(name)
                .cloned()
                .ok_or_else(|| VisionError::unknown("pipeline", name))?,
        };
        // The file name is authoritative.
        def.name = name.to_string();
        Ok(def)
    }

    pub fn save(&self, def: &PipelineDefinition) -> VisionResult<()> {
        check_name(&def.name)?;
        match &self.backing {
            Backing::Directory(dir) => {
                let path = path_for(dir, &def.name);
                let json = serde_json::to_vec_pretty(def)
                    .map_err(|e| VisionError::Storage(format!("encode {}: {}", def.name, e)))?;
                write_atomic(&path, &json).map_err(|e| storage("write", &path, e))
            }
            Backing::Memory(map) => {
                lock(map)?.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    /// Create an empty definition. An existing one is left alone.
    pub fn create(&self, name: &str) -> VisionResult<bool> {
        if self.exists(name)? {
            return Ok(false);
        }
        self.save(&PipelineDefinition::new(name))?;
        Ok(true)
    }

    pub fn erase(&self, name: &str) -> VisionResult<()> {
        check_name(name)?;
        match &self.backing {
            Backing::Directory(dir) => {
                let path = path_for(dir, name);
                if !path.is_file() {
                    return Err(VisionError::unknown("pipeline", name));
                }
                fs::remove_file(&path).map_err(|e| storage("remove", &path, e))
            }
            Backing::Memory(map) => lock(map)?
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| VisionError::unknown("pipeline", name)),
        }
    }

    /// Copy `from` to `to`, overwriting `to`.
    pub fn copy(&self, from: &str, to: &str) -> VisionResult<()> {
        let mut def = self.load(from)?;
        def.name = to.to_string();
        self.save(&def)
    }
}

fn check_name(name: &str) -> VisionResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(VisionError::Storage(format!(
            "invalid pipeline name '{}'",
            name
        )))
    }
}

fn path_for(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, EXTENSION))
}

fn lock<T>(m: &Mutex<T>) -> VisionResult<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| VisionError::LockPoisoned("pipeline store"))
}

fn storage(op: &str, path: &Path, err: std::io::Error) -> VisionError {
    VisionError::Storage(format!("{} {}: {}", op, path.display(), err))
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}
