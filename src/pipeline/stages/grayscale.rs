use anyhow::Result;

use crate::frame::frame_to_gray;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageParams};
use crate::pool::BufferPool;

/// Writes the input's luminance into `gray`, overwriting whatever was there.
#[derive(Clone, Debug, Default)]
pub struct Grayscale;

impl Grayscale {
    pub fn new() -> Self {
        Self
    }

    pub fn from_params(params: &StageParams) -> Self {
        params.warn_unrecognized("grayscale", &[]);
        Self
    }
}

impl Stage for Grayscale {
    fn name(&self) -> &'static str {
        "grayscale"
    }

    fn apply(&self, ctx: &mut PipelineContext<'_>, pool: &mut BufferPool) -> Result<()> {
        let (width, height) = ctx.dimensions();
        let mut gray = match ctx.gray.take() {
            Some(gray) if gray.width == width && gray.height == height => gray,
            stale => {
                if let Some(stale) = stale {
                    pool.release_gray(stale);
                }
                pool.gray(width, height)
            }
        };
        frame_to_gray(ctx.input(), &mut gray)?;
        ctx.gray = Some(gray);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{luminance, Frame};

    #[test]
    fn grayscale_writes_luminance() -> Result<()> {
        let frame = Frame::filled(4, 3, [200, 100, 50], 0);
        let mut pool = BufferPool::new();
        let mut ctx = PipelineContext::new(&frame, None);

        Grayscale::new().apply(&mut ctx, &mut pool)?;

        let gray = ctx.gray.as_ref().expect("gray");
        assert_eq!((gray.width, gray.height), (4, 3));
        assert!(gray
            .as_slice()
            .iter()
            .all(|&v| v == luminance(200, 100, 50)));
        Ok(())
    }
}
