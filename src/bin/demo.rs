//! demo - end-to-end synthetic run of the arena kernel
//!
//! Renders a moving disk, pushes it through the capture dispatcher and the
//! tracking pipeline, and prints how often the disk was segmented.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arena_kernel::{
    BinaryMask, CaptureDispatcher, CaptureParams, DispatcherConfig, Frame, MaskSummary,
    PipelineConfigLoader, PipelineEngine, SyntheticSource, TrackingSession,
};

/// A frame with more foreground than this counts as a detection.
const DETECTION_MIN_PIXELS: usize = 50;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frames to deliver before stopping.
    #[arg(long, default_value_t = 100)]
    frames: u64,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
    /// Paint the right half of the disk with the background color.
    #[arg(long)]
    occlude: bool,
    /// Scene noise seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Pipeline description (JSON). Defaults to the built-in tracking pipeline.
    #[arg(long, env = "ARENA_PIPELINE")]
    pipeline: Option<PathBuf>,
    #[arg(long, default_value_t = 160)]
    width: u32,
    #[arg(long, default_value_t = 120)]
    height: u32,
}

#[derive(Default)]
struct Tally {
    frames: u64,
    with_mask: u64,
    detections: u64,
    foreground_total: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if !(args.fps > 0.0 && args.fps.is_finite()) {
        return Err(anyhow!("fps must be > 0"));
    }

    stage("build pipeline");
    let engine = match &args.pipeline {
        Some(path) => PipelineConfigLoader::new().load_file(path)?,
        None => PipelineEngine::tracking_default(),
    };
    eprintln!("demo: stages: {}", engine.stage_names().join(" -> "));

    let tally = Arc::new(Mutex::new(Tally::default()));
    let tracker_tally = tally.clone();
    let session = TrackingSession::new(
        engine,
        Box::new(move |_frame: &Frame, mask: Option<&BinaryMask>| {
            let mut tally = tracker_tally
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tally.frames += 1;
            if let Some(mask) = mask {
                let summary = MaskSummary::from_mask(mask);
                tally.with_mask += 1;
                tally.foreground_total += summary.foreground as u64;
                if summary.foreground > DETECTION_MIN_PIXELS {
                    tally.detections += 1;
                }
            }
        }),
    );

    stage("start capture");
    let mut dispatcher = CaptureDispatcher::new(DispatcherConfig::default());
    dispatcher.register_consumer(session);
    let device = format!(
        "stub://demo?seed={}&occlude={}&fps={}",
        args.seed, args.occlude, args.fps
    );
    dispatcher.start(
        Box::new(SyntheticSource::new()),
        CaptureParams::new(device, args.width, args.height),
    )?;

    let expected = Duration::from_secs_f64(args.frames as f64 / args.fps);
    let deadline = Instant::now() + expected * 2 + Duration::from_secs(2);
    while dispatcher.metrics().frames_delivered < args.frames && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    stage("stop capture");
    dispatcher.stop();

    let metrics = dispatcher.metrics();
    let tally = tally.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mean_foreground = if tally.with_mask > 0 {
        tally.foreground_total as f64 / tally.with_mask as f64
    } else {
        0.0
    };

    println!("demo summary:");
    println!("  frames captured: {}", metrics.frames_captured);
    println!("  frames delivered: {}", metrics.frames_delivered);
    println!("  frames dropped: {}", metrics.frames_dropped);
    println!("  delivery rate: {:.1} fps", metrics.fps);
    println!("  frames with mask: {}/{}", tally.with_mask, tally.frames);
    println!(
        "  detections (> {} px): {}",
        DETECTION_MIN_PIXELS, tally.detections
    );
    println!("  mean foreground: {:.1} px", mean_foreground);
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
