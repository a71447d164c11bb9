use std::collections::HashMap;
use std::sync::Arc;

use super::stage::Stage;
use super::stages::{
    BlurStage, CentroidStage, GrayStage, InvertStage, OriginalImageStage, ThresholdStage,
};
use crate::error::{VisionError, VisionResult};

type StageConstructor = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Name -> constructor map for stage types.
///
/// Stages are created fresh for every pipeline slot; the factory itself holds
/// no stage instances.
#[derive(Clone, Default)]
pub struct StageFactory {
    constructors: HashMap<String, StageConstructor>,
}

impl StageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with every stage shipped in this crate.
    pub fn with_builtin_stages() -> Self {
        let mut factory = Self::new();
        factory.register::<GrayStage>();
        factory.register::<ThresholdStage>();
        factory.register::<InvertStage>();
        factory.register::<BlurStage>();
        factory.register::<OriginalImageStage>();
        factory.register::<CentroidStage>();
        factory
    }

    /// Register a stage type under its own `type_name`.
    pub fn register<S: Stage + Default + 'static>(&mut self) {
        let name = S::default().type_name().to_string();
        self.register_with(&name, || Box::new(S::default()));
    }

    /// Register a constructor under an explicit name. Replaces any previous one.
    pub fn register_with<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn create(&self, type_name: &str) -> VisionResult<Box<dyn Stage>> {
        self.constructors
            .get(type_name)
            .map(|ctor| ctor())
            .ok_or_else(|| VisionError::UnknownStageType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_by_type_name() {
        let factory = StageFactory::with_builtin_stages();
        assert_eq!(
            factory.list(),
            vec!["Blur", "Centroid", "Gray", "Invert", "OriginalImage", "Threshold"]
        );
        for name in factory.list() {
            assert_eq!(factory.create(&name).unwrap().type_name(), name);
        }
    }

    #[test]
    fn unknown_type_is_reported() {
        let factory = StageFactory::new();
        let err = factory.create("Sobel").err().unwrap();
        assert_eq!(err.code(), "UnknownStageType");
    }
}
