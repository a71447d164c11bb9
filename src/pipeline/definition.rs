use serde::{Deserialize, Serialize};

use super::params::ParamValue;

/// One named parameter in a stage definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub value: ParamValue,
}

/// Stage type plus its parameter values, in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Vec<ParamEntry>,
}

fn enabled_by_default() -> bool {
    true
}

impl StageConfig {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            enabled: true,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.push(ParamEntry {
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Durable form of a pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }
}
