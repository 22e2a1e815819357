//! Configurable image-processing pipeline.
//!
//! A [`PipelineEngine`] runs an ordered list of [`Stage`]s over one frame at a
//! time, threading a [`PipelineContext`] through them. Stages are built from
//! descriptors by a [`StageRegistry`]; [`PipelineConfigLoader`] turns a JSON
//! document into an engine.

pub mod context;
pub mod engine;
pub mod loader;
pub mod registry;
pub mod stage;
pub mod stages;

pub use context::PipelineContext;
pub use engine::{PipelineEngine, PipelineOutput};
pub use loader::{PipelineConfigLoader, StageDescriptor};
pub use registry::{StageFactory, StageRegistry};
pub use stage::{ParamValue, Stage, StageParams};
pub use stages::{
    AdaptiveThreshold, BackgroundMode, BackgroundSubtract, Grayscale, MorphOp, Morphology,
    ThresholdMode,
};
