//! arenad - arena capture and segmentation daemon
//!
//! This daemon:
//! 1. Loads configuration from `ARENA_CONFIG` and `ARENA_*` overrides
//! 2. Opens the configured source (synthetic scene or image sequence)
//! 3. Runs capture and dispatch around a bounded drop-oldest queue
//! 4. Segments every delivered frame in a queued tracking session
//! 5. Reports metrics periodically and governs playback speed from the
//!    session queue occupancy
//! 6. Stops cleanly on Ctrl-C

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;

use arena_kernel::ingest::source_for_device;
use arena_kernel::{
    ArenaConfig, BinaryMask, CaptureDispatcher, Frame, LogStatusSink, MaskSummary,
    MetricsReporter, PipelineConfigLoader, PipelineEngine, PlaybackSpeed, QueuedConsumer,
    SpeedGovernor, StatusSink, TrackingSession,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ArenaConfig::load()?;
    log::info!(
        "arenad {} starting: device={} {}x{} @ {} fps",
        env!("CARGO_PKG_VERSION"),
        cfg.source.device,
        cfg.source.width,
        cfg.source.height,
        cfg.source.fps
    );

    let engine = match &cfg.pipeline_path {
        Some(path) => PipelineConfigLoader::new().load_file(path)?,
        None => PipelineEngine::tracking_default(),
    };
    log::info!("pipeline: {}", engine.stage_names().join(" -> "));

    let session = TrackingSession::new(engine, Box::new(report_detection));
    let consumer = QueuedConsumer::spawn("tracking", cfg.session_queue_capacity, session)?;
    let session_probe = consumer.occupancy_probe();

    let speed = PlaybackSpeed::new(1.0);
    let source = source_for_device(
        &cfg.source.device,
        cfg.source.fps,
        cfg.source.looping,
        speed.clone(),
    )?;

    let sink: Arc<dyn StatusSink> = Arc::new(LogStatusSink);
    let mut dispatcher = CaptureDispatcher::new(cfg.dispatcher.clone()).with_status_sink(sink.clone());
    dispatcher.register_consumer(consumer);
    dispatcher.start(source, cfg.source.capture_params())?;

    let governor = SpeedGovernor::new(cfg.speed.balancer()?, speed, session_probe);
    log::info!("speed law: {}", governor.balancer().law().name());
    let mut reporter = MetricsReporter::spawn(
        cfg.metrics_interval,
        dispatcher.metrics_handle(),
        sink,
        Some(governor),
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("arenad running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture...");

    reporter.stop();
    dispatcher.stop();
    log::info!("final metrics: {}", dispatcher.metrics());
    Ok(())
}

fn report_detection(frame: &Frame, mask: Option<&BinaryMask>) {
    let Some(mask) = mask else {
        log::debug!("t={}ms: no mask", frame.timestamp_ms);
        return;
    };
    let summary = MaskSummary::from_mask(mask);
    match summary.centroid {
        Some((x, y)) => log::debug!(
            "t={}ms: {} px, centroid ({:.1}, {:.1})",
            frame.timestamp_ms,
            summary.foreground,
            x,
            y
        ),
        None => log::debug!("t={}ms: no foreground", frame.timestamp_ms),
    }
}
