use anyhow::{anyhow, Result};

use crate::frame::{sentinel, GrayBuffer};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageParams};
use crate::pool::BufferPool;

pub const DEFAULT_LEVEL: u8 = 128;
pub const DEFAULT_BLOCK_SIZE: u32 = 15;
pub const DEFAULT_C: i32 = 5;

#[derive(Clone, Debug, PartialEq)]
pub enum ThresholdMode {
    /// Single split at `level`.
    Global { level: u8 },
    /// Compare each pixel against a Gaussian-weighted neighbourhood mean.
    AdaptiveMean { block_size: u32, c: i32 },
}

/// Binary split of `gray` into `mask`.
///
/// With `dark == false` foreground is brighter than the threshold; with
/// `dark == true` it is darker. The adaptive mode blurs `gray` into `work`
/// with a Gaussian of σ = block_size / 6 and radius block_size / 2, which
/// approximates the box mean of a block_size × block_size window.
/// The offset `c` pushes the split away from the mean in the foreground's
/// direction: bright foreground needs `g > mean + c`, dark foreground needs
/// `g < mean - c`.
#[derive(Clone, Debug)]
pub struct AdaptiveThreshold {
    mode: ThresholdMode,
    dark: bool,
    kernel: Vec<f32>,
}

impl AdaptiveThreshold {
    pub fn global(level: u8, dark: bool) -> Self {
        Self {
            mode: ThresholdMode::Global { level },
            dark,
            kernel: Vec::new(),
        }
    }

    pub fn adaptive_mean(block_size: u32, c: i32, dark: bool) -> Self {
        let block_size = odd_at_least_three(block_size);
        Self {
            mode: ThresholdMode::AdaptiveMean { block_size, c },
            dark,
            kernel: gaussian_kernel(block_size),
        }
    }

    pub fn from_params(params: &StageParams) -> Self {
        params.warn_unrecognized(
            "adaptivethreshold",
            &["mode", "level", "threshold", "dark", "blocksize", "c"],
        );
        let dark = params.bool("dark").unwrap_or(false);
        let mode = params.str("mode").map(str::to_ascii_lowercase);
        match mode.as_deref() {
            Some("adaptivemean") | Some("adaptive_mean") | Some("adaptive") | Some("mean") => {
                let block_size = params
                    .i64("blocksize")
                    .map(|b| b.clamp(3, 255) as u32)
                    .unwrap_or(DEFAULT_BLOCK_SIZE);
                let c = params
                    .i64("c")
                    .map(|c| c.clamp(-255, 255) as i32)
                    .unwrap_or(DEFAULT_C);
                Self::adaptive_mean(block_size, c, dark)
            }
            None | Some("global") | Some("binary") => {
                let level = params
                    .i64("level")
                    .or_else(|| params.i64("threshold"))
                    .map(|l| l.clamp(0, 255) as u8)
                    .unwrap_or(DEFAULT_LEVEL);
                Self::global(level, dark)
            }
            Some(other) => {
                log::warn!("adaptivethreshold: unknown mode '{}', using global", other);
                Self::global(DEFAULT_LEVEL, dark)
            }
        }
    }

    pub fn mode(&self) -> &ThresholdMode {
        &self.mode
    }

    pub fn is_dark(&self) -> bool {
        self.dark
    }
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self::global(DEFAULT_LEVEL, false)
    }
}

impl Stage for AdaptiveThreshold {
    fn name(&self) -> &'static str {
        "adaptivethreshold"
    }

    fn apply(&self, ctx: &mut PipelineContext<'_>, pool: &mut BufferPool) -> Result<()> {
        ctx.ensure_gray(pool)?;
        let (width, height) = ctx.dimensions();
        let mut mask = pool.mask(width, height);

        match self.mode {
            ThresholdMode::Global { level } => {
                let gray = ctx.gray.as_ref().ok_or_else(|| anyhow!("gray missing"))?;
                for (m, &g) in mask.as_mut_slice().iter_mut().zip(gray.as_slice()) {
                    let fg = if self.dark { g < level } else { g > level };
                    *m = sentinel(fg);
                }
            }
            ThresholdMode::AdaptiveMean { c, .. } => {
                let mut work = ctx.take_work(pool);
                let gray = ctx.gray.as_ref().ok_or_else(|| anyhow!("gray missing"))?;
                let mut scratch = pool.gray(width, height);
                gaussian_blur(gray, &mut work, &mut scratch, &self.kernel);
                pool.release_gray(scratch);

                for ((m, &g), &mean) in mask
                    .as_mut_slice()
                    .iter_mut()
                    .zip(gray.as_slice())
                    .zip(work.as_slice())
                {
                    let (g, mean) = (g as i32, mean as i32);
                    let fg = if self.dark { g < mean - c } else { g > mean + c };
                    *m = sentinel(fg);
                }
                ctx.work = Some(work);
            }
        }

        ctx.set_mask(mask, pool)
    }
}

fn odd_at_least_three(size: u32) -> u32 {
    let size = size.max(3);
    if size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

/// Normalised 1-D Gaussian taps for a `block_size` window (σ = block_size / 6).
fn gaussian_kernel(block_size: u32) -> Vec<f32> {
    let radius = (block_size / 2) as i32;
    let sigma = block_size as f32 / 6.0;
    let denom = 2.0 * sigma * sigma;
    let taps: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

/// Separable blur with edge replication; `scratch` holds the horizontal pass.
fn gaussian_blur(src: &GrayBuffer, dst: &mut GrayBuffer, scratch: &mut GrayBuffer, kernel: &[f32]) {
    let width = src.width as usize;
    let height = src.height as usize;
    if width == 0 || height == 0 {
        return;
    }
    let radius = (kernel.len() / 2) as isize;
    let input = src.as_slice();

    {
        let horiz = scratch.as_mut_slice();
        for y in 0..height {
            let row = &input[y * width..(y + 1) * width];
            for x in 0..width {
                let mut acc = 0.0f32;
                for (k, &w) in kernel.iter().enumerate() {
                    let sx = (x as isize + k as isize - radius).clamp(0, width as isize - 1);
                    acc += w * row[sx as usize] as f32;
                }
                horiz[y * width + x] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let horiz = scratch.as_slice();
    let out = dst.as_mut_slice();
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (k, &w) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - radius).clamp(0, height as isize - 1);
                acc += w * horiz[sy as usize * width + x] as f32;
            }
            out[y * width + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
}
