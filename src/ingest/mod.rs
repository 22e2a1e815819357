//! Frame ingestion sources.
//!
//! This module provides the sources frames are pulled from:
//! - Synthetic scenes (`stub://` devices) for tests and demos
//! - Image-sequence directories played back at an adjustable speed
//!
//! Live cameras sit behind the same `FrameSource` trait but are provided by
//! the embedding application.
//!
//! All sources produce `RawFrame`s in whatever pixel layout they decode to.
//! The capture activity normalizes them into the packed RGB `Frame` before
//! they enter the dispatch queue, reusing pooled buffers.

pub mod file;
mod normalize;
pub mod synthetic;

use anyhow::Result;

use crate::error::KernelError;
use crate::speed::PlaybackSpeed;

pub use file::{FileSource, FileSourceConfig};
pub use normalize::normalize_into;
pub use synthetic::{SceneConfig, SyntheticScene, SyntheticSource};

/// Pixel layouts a source may hand to capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    /// Full-resolution Y plane followed by interleaved half-resolution UV.
    Nv12,
    Gray8,
}

impl PixelFormat {
    /// Bytes a frame of `width` x `height` occupies in this layout.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels.checked_mul(3),
            PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
            PixelFormat::Gray8 => Some(pixels),
        }
    }
}

/// Undecoded-to-RGB frame as produced by a source.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }
}

/// Statistics every source exposes.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub device: String,
}

/// Anything capture can pull frames from.
///
/// `grab_frame` returning `Ok(None)` means no frame is available right now;
/// capture pauses briefly and asks again. An `Err` is treated as a transient
/// acquisition failure and retried the same way. Only `open` failures are
/// fatal to a start.
pub trait FrameSource: Send {
    fn open(&mut self, device: &str, width: u32, height: u32) -> Result<()>;

    fn grab_frame(&mut self) -> Result<Option<RawFrame>>;

    fn close(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Pick a source implementation for `device`.
///
/// `stub://...` selects a synthetic scene; any other path is treated as an
/// image-sequence directory paced by `speed`.
pub fn source_for_device(
    device: &str,
    fps: f64,
    looping: bool,
    speed: PlaybackSpeed,
) -> Result<Box<dyn FrameSource>> {
    let device = device.trim();
    if device.is_empty() {
        return Err(KernelError::configuration("device must not be empty"));
    }
    if device.starts_with(synthetic::STUB_SCHEME) {
        return Ok(Box::new(SyntheticSource::new()));
    }
    if device.contains("://") {
        return Err(KernelError::configuration(format!(
            "unsupported device scheme in '{}'",
            device
        )));
    }
    Ok(Box::new(FileSource::new(FileSourceConfig {
        fps,
        looping,
        speed,
    })))
}
