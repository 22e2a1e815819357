use anyhow::Result;

use crate::frame::BinaryMask;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageParams};
use crate::pool::BufferPool;

pub const DEFAULT_SIZE: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphOp {
    Erode,
    Dilate,
    /// Erode then dilate. Removes specks smaller than the element.
    Open,
    /// Dilate then erode. Fills gaps smaller than the element.
    Close,
}

/// Binary morphology with a `size` × `size` all-ones structuring element.
///
/// Kernel positions that fall outside the image are ignored, which keeps
/// opening anti-extensive and closing extensive up to the border.
#[derive(Clone, Debug)]
pub struct Morphology {
    op: MorphOp,
    size: u32,
}

impl Morphology {
    pub fn new(op: MorphOp, size: u32) -> Self {
        let size = size.max(1);
        let size = if size % 2 == 0 { size + 1 } else { size };
        Self { op, size }
    }

    pub fn from_params(params: &StageParams) -> Self {
        params.warn_unrecognized("morphology", &["op", "operation", "size", "kernel"]);
        let op_name = params
            .str("op")
            .or_else(|| params.str("operation"))
            .map(str::to_ascii_lowercase);
        let op = match op_name.as_deref() {
            None | Some("open") | Some("opening") => MorphOp::Open,
            Some("close") | Some("closing") => MorphOp::Close,
            Some("erode") | Some("erosion") => MorphOp::Erode,
            Some("dilate") | Some("dilation") => MorphOp::Dilate,
            Some(other) => {
                log::warn!("morphology: unknown op '{}', using open", other);
                MorphOp::Open
            }
        };
        let size = params
            .i64("size")
            .or_else(|| params.i64("kernel"))
            .map(|s| s.clamp(1, 63) as u32)
            .unwrap_or(DEFAULT_SIZE);
        if size % 2 == 0 {
            log::warn!("morphology: even size {} rounded up to {}", size, size + 1);
        }
        Self::new(op, size)
    }

    pub fn op(&self) -> MorphOp {
        self.op
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Apply the configured operation to `mask` in place.
    pub fn filter(&self, mask: &mut BinaryMask, pool: &mut BufferPool) {
        let radius = (self.size / 2) as usize;
        if radius == 0 {
            return;
        }
        let mut out = pool.mask(mask.width, mask.height);
        let mut scratch = pool.mask(mask.width, mask.height);
        match self.op {
            MorphOp::Erode => {
                sweep(mask, &mut out, &mut scratch, radius, Rule::All);
                std::mem::swap(mask, &mut out);
            }
            MorphOp::Dilate => {
                sweep(mask, &mut out, &mut scratch, radius, Rule::Any);
                std::mem::swap(mask, &mut out);
            }
            MorphOp::Open => {
                sweep(mask, &mut out, &mut scratch, radius, Rule::All);
                sweep(&out, mask, &mut scratch, radius, Rule::Any);
            }
            MorphOp::Close => {
                sweep(mask, &mut out, &mut scratch, radius, Rule::Any);
                sweep(&out, mask, &mut scratch, radius, Rule::All);
            }
        }
        pool.release_mask(out);
        pool.release_mask(scratch);
    }
}

impl Default for Morphology {
    fn default() -> Self {
        Self::new(MorphOp::Open, DEFAULT_SIZE)
    }
}

impl Stage for Morphology {
    fn name(&self) -> &'static str {
        "morphology"
    }

    fn apply(&self, ctx: &mut PipelineContext<'_>, pool: &mut BufferPool) -> Result<()> {
        let Some(mut mask) = ctx.mask.take() else {
            log::debug!("morphology: no mask in context, nothing to filter");
            return Ok(());
        };
        self.filter(&mut mask, pool);
        ctx.set_mask(mask, pool)
    }
}

#[derive(Clone, Copy)]
enum Rule {
    /// Erosion: every in-bounds element must be foreground.
    All,
    /// Dilation: at least one in-bounds element must be foreground.
    Any,
}

/// Square-element erosion/dilation as a horizontal then vertical pass.
fn sweep(
    src: &BinaryMask,
    dst: &mut BinaryMask,
    scratch: &mut BinaryMask,
    radius: usize,
    rule: Rule,
) {
    let width = src.width as usize;
    let height = src.height as usize;
    pass(src.as_slice(), scratch.as_mut_slice(), width, height, radius, rule, true);
    pass(scratch.as_slice(), dst.as_mut_slice(), width, height, radius, rule, false);
}

fn pass(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    radius: usize,
    rule: Rule,
    horizontal: bool,
) {
    for y in 0..height {
        for x in 0..width {
            let (pos, len) = if horizontal { (x, width) } else { (y, height) };
            let lo = pos.saturating_sub(radius);
            let hi = (pos + radius).min(len - 1);
            let at = |i: usize| {
                let idx = if horizontal { y * width + i } else { i * width + x };
                src[idx] == BinaryMask::FOREGROUND
            };
            let fg = match rule {
                Rule::All => (lo..=hi).all(at),
                Rule::Any => (lo..=hi).any(at),
            };
            dst[y * width + x] = crate::frame::sentinel(fg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn mask_from_rows(rows: &[&str]) -> BinaryMask {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        let mut mask = BinaryMask::new(width, height);
        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.chars().enumerate() {
                mask.set(x as u32, y as u32, ch == '#');
            }
        }
        mask
    }

    fn random_mask(rng: &mut StdRng, width: u32, height: u32, density: f64) -> BinaryMask {
        let mut mask = BinaryMask::new(width, height);
        for y in 0..height {
            for x in 0..width {
                mask.set(x, y, rng.gen_bool(density));
            }
        }
        mask
    }

    fn filtered(op: MorphOp, size: u32, mask: &BinaryMask) -> BinaryMask {
        let mut pool = BufferPool::new();
        let mut out = mask.clone();
        Morphology::new(op, size).filter(&mut out, &mut pool);
        out
    }

    #[test]
    fn open_removes_isolated_pixel_keeps_block() {
        let mask = mask_from_rows(&[
            "........",
            ".#......",
            "........",
            "....###.",
            "....###.",
            "....###.",
        ]);
        let opened = filtered(MorphOp::Open, 3, &mask);
        assert!(!opened.is_foreground(1, 1));
        assert_eq!(opened.foreground_count(), 9);
    }

    #[test]
    fn close_fills_single_pixel_gap() {
        let mask = mask_from_rows(&[".......", ".#####.", ".##.##.", ".#####.", "......."]);
        let closed = filtered(MorphOp::Close, 3, &mask);
        assert!(closed.is_foreground(3, 2));
    }

    #[test]
    fn erode_and_dilate_are_bounded_by_input() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = random_mask(&mut rng, 24, 17, 0.5);
        let eroded = filtered(MorphOp::Erode, 3, &mask);
        let dilated = filtered(MorphOp::Dilate, 3, &mask);
        for (i, &v) in mask.as_slice().iter().enumerate() {
            if eroded.as_slice()[i] == BinaryMask::FOREGROUND {
                assert_eq!(v, BinaryMask::FOREGROUND);
            }
            if v == BinaryMask::FOREGROUND {
                assert_eq!(dilated.as_slice()[i], BinaryMask::FOREGROUND);
            }
        }
    }

    #[test]
    fn open_never_grows_close_never_shrinks() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for trial in 0..40 {
            let width = rng.gen_range(1..30);
            let height = rng.gen_range(1..30);
            let density = rng.gen_range(0.05..0.95);
            let size = [1, 3, 5, 7][trial % 4];
            let mask = random_mask(&mut rng, width, height, density);
            let count = mask.foreground_count();

            assert!(filtered(MorphOp::Open, size, &mask).foreground_count() <= count);
            assert!(filtered(MorphOp::Close, size, &mask).foreground_count() >= count);
        }
    }

    #[test]
    fn even_size_rounds_up() {
        assert_eq!(Morphology::new(MorphOp::Open, 4).size(), 5);
        assert_eq!(Morphology::default().size(), 3);
        assert_eq!(Morphology::default().op(), MorphOp::Open);
    }

    #[test]
    fn stage_without_mask_is_a_no_op() -> Result<()> {
        let frame = crate::frame::Frame::filled(4, 4, [0, 0, 0], 0);
        let mut pool = BufferPool::new();
        let mut ctx = PipelineContext::new(&frame, None);
        Morphology::default().apply(&mut ctx, &mut pool)?;
        assert!(ctx.mask.is_none());
        Ok(())
    }
}
