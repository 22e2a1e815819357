use anyhow::{anyhow, Result};

use crate::frame::GrayBuffer;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageParams};
use crate::pool::BufferPool;

pub const DEFAULT_ALPHA: f32 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackgroundMode {
    /// Background captured once per session, never updated.
    Static,
    /// Per-pixel exponential moving average.
    Running,
}

/// Background model and subtraction.
///
/// When the context carries no background (first frame of a session, or a
/// geometry change) the current `gray` becomes the background and the
/// foreground signal for that call is all zero. Otherwise
/// `work = |gray - background|`, the running model is updated, and `gray` is
/// replaced by the difference so later stages threshold foreground signal.
#[derive(Clone, Debug)]
pub struct BackgroundSubtract {
    mode: BackgroundMode,
    alpha: f32,
}

impl BackgroundSubtract {
    pub fn new(mode: BackgroundMode, alpha: f32) -> Self {
        Self {
            mode,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn running(alpha: f32) -> Self {
        Self::new(BackgroundMode::Running, alpha)
    }

    pub fn static_model() -> Self {
        Self::new(BackgroundMode::Static, DEFAULT_ALPHA)
    }

    pub fn from_params(params: &StageParams) -> Self {
        params.warn_unrecognized("backgroundsubtract", &["mode", "alpha"]);
        let mode = match params.str("mode").map(str::to_ascii_lowercase).as_deref() {
            None | Some("running") | Some("ema") => BackgroundMode::Running,
            Some("static") => BackgroundMode::Static,
            Some(other) => {
                log::warn!(
                    "backgroundsubtract: unknown mode '{}', using running",
                    other
                );
                BackgroundMode::Running
            }
        };
        let alpha = match params.f64("alpha") {
            Some(alpha) if (0.0..=1.0).contains(&alpha) => alpha as f32,
            Some(alpha) => {
                log::warn!(
                    "backgroundsubtract: alpha {} outside [0, 1], clamping",
                    alpha
                );
                alpha.clamp(0.0, 1.0) as f32
            }
            None => DEFAULT_ALPHA,
        };
        Self::new(mode, alpha)
    }

    pub fn mode(&self) -> BackgroundMode {
        self.mode
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }
}

impl Stage for BackgroundSubtract {
    fn name(&self) -> &'static str {
        "backgroundsubtract"
    }

    fn apply(&self, ctx: &mut PipelineContext<'_>, pool: &mut BufferPool) -> Result<()> {
        ctx.ensure_gray(pool)?;
        let gray = ctx
            .gray
            .take()
            .ok_or_else(|| anyhow!("gray missing after derivation"))?;
        let mut work = ctx.take_work(pool);

        match ctx.background.take() {
            Some(mut background) if background.shape() == gray.shape() => {
                abs_diff(&gray, &background, &mut work);
                if self.mode == BackgroundMode::Running {
                    ema_update(&mut background, &gray, self.alpha);
                }
                ctx.background = Some(background);
            }
            stale => {
                if let Some(stale) = stale {
                    log::debug!("backgroundsubtract: background geometry changed, re-seeding");
                    pool.release_gray(stale);
                }
                let mut background = pool.gray(gray.width, gray.height);
                background.copy_from(&gray)?;
                work.fill(0);
                ctx.background = Some(background);
            }
        }

        pool.release_gray(gray);
        ctx.gray = Some(work);
        Ok(())
    }
}

/// One EMA step on an 8-bit intensity, rounded and clamped.
pub fn ema_step(background: u8, value: u8, alpha: f32) -> u8 {
    let b = background as f32;
    (b + alpha * (value as f32 - b)).round().clamp(0.0, 255.0) as u8
}

fn ema_update(background: &mut GrayBuffer, gray: &GrayBuffer, alpha: f32) {
    for (b, &g) in background
        .as_mut_slice()
        .iter_mut()
        .zip(gray.as_slice().iter())
    {
        *b = ema_step(*b, g, alpha);
    }
}

fn abs_diff(gray: &GrayBuffer, background: &GrayBuffer, out: &mut GrayBuffer) {
    for ((o, &g), &b) in out
        .as_mut_slice()
        .iter_mut()
        .zip(gray.as_slice().iter())
        .zip(background.as_slice().iter())
    {
        *o = g.abs_diff(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::pipeline::stage::ParamValue;

    #[test]
    fn ema_converges_monotonically() {
        let mut bg = 0u8;
        let mut history = vec![bg];
        let mut updates_to_converge = None;
        for update in 1..=20 {
            let next = ema_step(bg, 100, 0.5);
            assert!(next <= 100);
            if bg < 99 {
                assert!(next > bg, "sequence must increase until converged");
            }
            bg = next;
            history.push(bg);
            if updates_to_converge.is_none() && 100 - bg <= 1 {
                updates_to_converge = Some(update);
            }
        }
        assert_eq!(&history[..4], &[0, 50, 75, 88]);
        assert!(updates_to_converge.expect("converged") <= 9);
    }

    #[test]
    fn first_call_bootstraps_with_zero_foreground() -> Result<()> {
        let frame = Frame::filled(6, 4, [90, 90, 90], 0);
        let mut pool = BufferPool::new();
        let stage = BackgroundSubtract::running(0.05);

        let mut ctx = PipelineContext::new(&frame, None);
        stage.apply(&mut ctx, &mut pool)?;

        let background = ctx.background.as_ref().expect("background seeded");
        assert!(background.as_slice().iter().all(|&v| v == 90));
        let signal = ctx.gray.as_ref().expect("gray replaced by difference");
        assert!(signal.as_slice().iter().all(|&v| v == 0));
        Ok(())
    }

    #[test]
    fn difference_replaces_gray_and_model_tracks_input() -> Result<()> {
        let mut pool = BufferPool::new();
        let stage = BackgroundSubtract::running(0.5);
        let dark = Frame::filled(2, 2, [0, 0, 0], 0);
        let bright = Frame::filled(2, 2, [100, 100, 100], 1);

        let mut ctx = PipelineContext::new(&dark, None);
        stage.apply(&mut ctx, &mut pool)?;
        let background = ctx.background.take();

        let mut ctx = PipelineContext::new(&bright, background);
        stage.apply(&mut ctx, &mut pool)?;

        assert!(ctx.gray.as_ref().unwrap().as_slice().iter().all(|&v| v == 100));
        assert!(ctx
            .background
            .as_ref()
            .unwrap()
            .as_slice()
            .iter()
            .all(|&v| v == 50));
        Ok(())
    }

    #[test]
    fn static_model_never_moves() -> Result<()> {
        let mut pool = BufferPool::new();
        let stage = BackgroundSubtract::static_model();
        let first = Frame::filled(2, 2, [10, 10, 10], 0);
        let later = Frame::filled(2, 2, [200, 200, 200], 1);

        let mut ctx = PipelineContext::new(&first, None);
        stage.apply(&mut ctx, &mut pool)?;
        let mut background = ctx.background.take();
        for _ in 0..5 {
            let mut ctx = PipelineContext::new(&later, background);
            stage.apply(&mut ctx, &mut pool)?;
            background = ctx.background.take();
        }
        assert!(background.unwrap().as_slice().iter().all(|&v| v == 10));
        Ok(())
    }

    #[test]
    fn params_are_parsed_and_clamped() {
        let stage = BackgroundSubtract::from_params(
            &StageParams::new()
                .with("mode", ParamValue::Str("static".into()))
                .with("alpha", ParamValue::Float(3.0)),
        );
        assert_eq!(stage.mode(), BackgroundMode::Static);
        assert_eq!(stage.alpha(), 1.0);

        let defaults = BackgroundSubtract::from_params(&StageParams::new());
        assert_eq!(defaults.mode(), BackgroundMode::Running);
        assert_eq!(defaults.alpha(), DEFAULT_ALPHA);
    }
}
