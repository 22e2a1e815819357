use std::collections::HashMap;

use anyhow::Result;

use crate::error::KernelError;

use super::stage::{Stage, StageParams};
use super::stages::{AdaptiveThreshold, BackgroundSubtract, Grayscale, Morphology};

/// Builds a configured stage from descriptor parameters. Never fails: unknown
/// or invalid parameters fall back to defaults.
pub type StageFactory = fn(&StageParams) -> Box<dyn Stage>;

/// Function table from stage type name to factory.
///
/// Names are matched case-insensitively. Several names may map to the same
/// factory (`background` is an alias of `backgroundsubtract`).
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in stage library and its aliases.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("grayscale", build_grayscale);
        registry.register("backgroundsubtract", build_background);
        registry.register("background", build_background);
        registry.register("adaptivethreshold", build_threshold);
        registry.register("threshold", build_threshold);
        registry.register("morphology", build_morphology);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: StageFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Build a stage, or `KernelError::UnknownStageType`.
    pub fn build(&self, name: &str, params: &StageParams) -> Result<Box<dyn Stage>> {
        let factory = self
            .factories
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| KernelError::UnknownStageType(name.to_string()))?;
        Ok(factory(params))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn build_grayscale(params: &StageParams) -> Box<dyn Stage> {
    Box::new(Grayscale::from_params(params))
}

fn build_background(params: &StageParams) -> Box<dyn Stage> {
    Box::new(BackgroundSubtract::from_params(params))
}

fn build_threshold(params: &StageParams) -> Box<dyn Stage> {
    Box::new(AdaptiveThreshold::from_params(params))
}

fn build_morphology(params: &StageParams) -> Box<dyn Stage> {
    Box::new(Morphology::from_params(params))
}
