//! Arena Kernel
//!
//! Real-time video ingestion and foreground segmentation for a
//! behavioral-tracking instrument.
//!
//! # Architecture
//!
//! Frames flow in one direction:
//!
//! ```text
//! FrameSource -> CaptureDispatcher (bounded, drop-oldest) -> consumers
//!                                                          -> TrackingSession
//!                                                             -> PipelineEngine
//!                                                             -> mask -> tracker
//! ```
//!
//! A `SpeedBalancer` watches downstream queue occupancy and adjusts the
//! `PlaybackSpeed` that paces file-based sources, so playback slows down
//! instead of dropping frames when processing falls behind.
//!
//! # Module Structure
//!
//! - `frame`: pixel buffers (`Frame`, `GrayBuffer`, `BinaryMask`) and conversions
//! - `pool`: shape-keyed buffer recycling
//! - `pipeline`: stage contract, built-in stages, engine, registry and loader
//! - `ingest`: frame sources (synthetic scenes, image sequences)
//! - `capture`: capture/dispatch threads, queue, FPS meter, consumers
//! - `speed`: speed laws, balancer and the shared playback speed
//! - `status`: status sink and the periodic metrics/speed tick
//! - `session`: the tracking consumer
//! - `config`: daemon configuration
//! - `error`: error taxonomy

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod pool;
pub mod session;
pub mod speed;
pub mod status;

pub use capture::{
    CaptureDispatcher, CaptureParams, DispatchMetrics, DispatcherConfig, DispatcherState,
    FrameConsumer, MetricsHandle, OccupancyProbe, QueuedConsumer,
};
pub use config::ArenaConfig;
pub use error::KernelError;
pub use frame::{BinaryMask, Frame, GrayBuffer, Shape};
pub use ingest::{
    FileSource, FrameSource, PixelFormat, RawFrame, SceneConfig, SyntheticScene, SyntheticSource,
};
pub use pipeline::{PipelineConfigLoader, PipelineContext, PipelineEngine, Stage, StageRegistry};
pub use pool::BufferPool;
pub use session::{MaskSummary, TrackingSession};
pub use speed::{PlaybackSpeed, SpeedBalancer, SpeedLaw, SpeedLimits};
pub use status::{LogStatusSink, MetricsReporter, SpeedGovernor, StatusSink};
