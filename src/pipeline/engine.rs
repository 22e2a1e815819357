use crate::error::KernelError;
use crate::frame::{BinaryMask, Frame, GrayBuffer};
use crate::pool::{BufferPool, PoolStats};

use super::context::PipelineContext;
use super::stage::Stage;
use super::stages::threshold::{DEFAULT_BLOCK_SIZE, DEFAULT_C};
use super::stages::{AdaptiveThreshold, BackgroundSubtract, Grayscale, MorphOp, Morphology};

/// What the caller keeps after a run.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Foreground mask, or `None` when no stage produced one or a stage faulted.
    pub mask: Option<BinaryMask>,
    /// Background to pass into the next `run`.
    pub background: Option<GrayBuffer>,
}

/// Ordered stage sequence plus the pool its stages borrow scratch buffers from.
///
/// The engine owns its pool; nothing else touches it. A stage error does not
/// propagate: the remaining stages are skipped, the mask is cleared and the
/// fault is logged, so the next frame is processed normally.
pub struct PipelineEngine {
    stages: Vec<Box<dyn Stage>>,
    pool: BufferPool,
    faults: u64,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self::with_pool(stages, BufferPool::new())
    }

    pub fn with_pool(stages: Vec<Box<dyn Stage>>, pool: BufferPool) -> Self {
        Self {
            stages,
            pool,
            faults: 0,
        }
    }

    /// grayscale → running background (α = 0.05) → adaptive mean (15×15, C = 5)
    /// → open 3×3.
    pub fn tracking_default() -> Self {
        Self::new(vec![
            Box::new(Grayscale::new()),
            Box::new(BackgroundSubtract::running(0.05)),
            Box::new(AdaptiveThreshold::adaptive_mean(DEFAULT_BLOCK_SIZE, DEFAULT_C, false)),
            Box::new(Morphology::new(MorphOp::Open, 3)),
        ])
    }

    pub fn push(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Apply every stage in order and return the final context.
    pub fn run<'a>(
        &mut self,
        input: &'a Frame,
        background: Option<GrayBuffer>,
    ) -> PipelineContext<'a> {
        let mut ctx = PipelineContext::new(input, background);
        for stage in &self.stages {
            let outcome = stage.apply(&mut ctx, &mut self.pool).and_then(|()| {
                if ctx.is_consistent() {
                    Ok(())
                } else {
                    Err(KernelError::stage_fault(
                        stage.name(),
                        "left a buffer with the wrong dimensions",
                    ))
                }
            });
            if let Err(err) = outcome {
                self.faults += 1;
                log::warn!("stage {} faulted, frame has no mask: {:#}", stage.name(), err);
                if let Some(mask) = ctx.mask.take() {
                    self.pool.release_mask(mask);
                }
                break;
            }
        }
        ctx
    }

    /// Recycle the scratch buffers of `ctx` and hand back mask and background.
    pub fn finish(&mut self, mut ctx: PipelineContext<'_>) -> PipelineOutput {
        if let Some(gray) = ctx.gray.take() {
            self.pool.release_gray(gray);
        }
        if let Some(work) = ctx.work.take() {
            self.pool.release_gray(work);
        }
        let (width, height) = ctx.dimensions();
        let background = match ctx.background.take() {
            Some(b) if b.width == width && b.height == height => Some(b),
            Some(stale) => {
                self.pool.release_gray(stale);
                None
            }
            None => None,
        };
        PipelineOutput {
            mask: ctx.mask.take(),
            background,
        }
    }

    /// `run` followed by `finish`.
    pub fn process(&mut self, input: &Frame, background: Option<GrayBuffer>) -> PipelineOutput {
        let ctx = self.run(input, background);
        self.finish(ctx)
    }

    /// Return a mask obtained from `finish` once the caller is done with it.
    pub fn recycle_mask(&mut self, mask: BinaryMask) {
        self.pool.release_mask(mask);
    }

    pub fn recycle_background(&mut self, background: GrayBuffer) {
        self.pool.release_gray(background);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of frames on which a stage faulted.
    pub fn faults(&self) -> u64 {
        self.faults
    }
}
