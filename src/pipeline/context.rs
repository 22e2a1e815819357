use anyhow::{anyhow, Result};

use crate::frame::{frame_to_gray, BinaryMask, Frame, GrayBuffer};
use crate::pool::BufferPool;

/// Per-invocation state threaded through the stages.
///
/// `input` is always present and read-only. `gray`, `work` and `mask`, when
/// set, have the input's dimensions; `set_mask` enforces this for the mask and
/// the engine re-checks it after every stage. `background` is owned by the
/// caller between invocations: it comes in through `PipelineEngine::run` and
/// goes back out in `PipelineOutput`. It may arrive with stale dimensions
/// after a resolution change; the background stage re-seeds it.
pub struct PipelineContext<'a> {
    input: &'a Frame,
    pub gray: Option<GrayBuffer>,
    pub background: Option<GrayBuffer>,
    pub work: Option<GrayBuffer>,
    pub mask: Option<BinaryMask>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(input: &'a Frame, background: Option<GrayBuffer>) -> Self {
        Self {
            input,
            gray: None,
            background,
            work: None,
            mask: None,
        }
    }

    pub fn input(&self) -> &'a Frame {
        self.input
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.input.width, self.input.height)
    }

    /// Derive `gray` from `input` unless a matching one is already present.
    pub fn ensure_gray(&mut self, pool: &mut BufferPool) -> Result<()> {
        let (width, height) = self.dimensions();
        match self.gray.take() {
            Some(gray) if gray.width == width && gray.height == height => {
                self.gray = Some(gray);
            }
            stale => {
                if let Some(stale) = stale {
                    pool.release_gray(stale);
                }
                let mut gray = pool.gray(width, height);
                frame_to_gray(self.input, &mut gray)?;
                self.gray = Some(gray);
            }
        }
        Ok(())
    }

    /// Take the `work` scratch buffer, or a fresh pooled one of input size.
    pub fn take_work(&mut self, pool: &mut BufferPool) -> GrayBuffer {
        let (width, height) = self.dimensions();
        match self.work.take() {
            Some(work) if work.width == width && work.height == height => work,
            stale => {
                if let Some(stale) = stale {
                    pool.release_gray(stale);
                }
                pool.gray(width, height)
            }
        }
    }

    /// Replace the mask, returning any previous one to the pool.
    pub fn set_mask(&mut self, mask: BinaryMask, pool: &mut BufferPool) -> Result<()> {
        let (width, height) = self.dimensions();
        if mask.width != width || mask.height != height {
            let err = anyhow!(
                "mask {}x{} does not match input {}x{}",
                mask.width,
                mask.height,
                width,
                height
            );
            pool.release_mask(mask);
            return Err(err);
        }
        if let Some(previous) = self.mask.replace(mask) {
            pool.release_mask(previous);
        }
        Ok(())
    }

    /// True when every present per-frame buffer matches the input geometry.
    /// `background` is not checked.
    pub fn is_consistent(&self) -> bool {
        let (width, height) = self.dimensions();
        let gray_ok = |g: &Option<GrayBuffer>| {
            g.as_ref()
                .map_or(true, |g| g.width == width && g.height == height)
        };
        let mask_ok = self
            .mask
            .as_ref()
            .map_or(true, |m| m.width == width && m.height == height);
        gray_ok(&self.gray) && gray_ok(&self.work) && mask_ok
    }
}
