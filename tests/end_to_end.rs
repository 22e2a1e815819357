use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use arena_kernel::{
    BinaryMask, CaptureDispatcher, CaptureParams, DispatcherConfig, Frame, MaskSummary,
    PipelineConfigLoader, PipelineEngine, SceneConfig, SyntheticScene, SyntheticSource,
    TrackingSession,
};

/// The tracking pipeline as a config file would spell it, all parameters left
/// at their defaults.
const DEFAULTS_JSON: &str = r#"{ "stages": [
    { "type": "grayscale" },
    { "type": "background", "mode": "running" },
    { "type": "threshold", "mode": "adaptiveMean" },
    { "type": "morphology", "op": "open" }
] }"#;

fn run_scene(config: SceneConfig, frames: u64) -> Result<Vec<(u64, Option<MaskSummary>)>> {
    run_scene_with(PipelineEngine::tracking_default(), config, frames)
}

fn run_scene_with(
    engine: PipelineEngine,
    config: SceneConfig,
    frames: u64,
) -> Result<Vec<(u64, Option<MaskSummary>)>> {
    let mut scene = SyntheticScene::new(config);
    let mut session = TrackingSession::detached(engine);
    let mut out = Vec::new();
    for i in 0..frames {
        let frame = scene.next_frame(i * 33)?;
        out.push((i, session.process(&frame)));
    }
    Ok(out)
}

fn foreground(summary: &Option<MaskSummary>) -> usize {
    summary.map(|s| s.foreground).unwrap_or(0)
}

#[test]
fn moving_disk_is_segmented_in_most_frames() -> Result<()> {
    let results = run_scene(SceneConfig::default(), 20)?;
    let detected = results
        .iter()
        .filter(|(_, summary)| foreground(summary) > 50)
        .count();
    assert!(
        detected >= 15,
        "only {} of 20 frames had > 50 foreground pixels: {:?}",
        detected,
        results
            .iter()
            .map(|(_, s)| foreground(s))
            .collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn loaded_default_pipeline_segments_plain_and_occluded_disk() -> Result<()> {
    let loader = PipelineConfigLoader::new();
    for (occlude, min_pixels) in [(false, 50), (true, 20)] {
        let results = run_scene_with(
            loader.load_str(DEFAULTS_JSON)?,
            SceneConfig {
                occlude,
                ..SceneConfig::default()
            },
            20,
        )?;
        let detected = results
            .iter()
            .filter(|(_, summary)| foreground(summary) > min_pixels)
            .count();
        assert!(
            detected >= 15,
            "occlude={}: only {} of 20 frames above {} px",
            occlude,
            detected,
            min_pixels
        );
    }
    Ok(())
}

#[test]
fn first_frame_only_seeds_the_background() -> Result<()> {
    let results = run_scene(SceneConfig::default(), 1)?;
    assert_eq!(foreground(&results[0].1), 0);
    Ok(())
}

#[test]
fn mask_follows_the_disk() -> Result<()> {
    let config = SceneConfig::default();
    let reference = SyntheticScene::new(config.clone());
    let results = run_scene(config, 20)?;

    let mut covered = 0;
    for (index, summary) in results.iter().skip(5) {
        let Some(bbox) = summary.and_then(|s| s.bbox) else {
            continue;
        };
        let (cx, cy) = reference.disk_center(*index);
        let (min_x, min_y, max_x, max_y) = bbox;
        if (min_x as f64) <= cx && cx <= max_x as f64 && (min_y as f64) <= cy && cy <= max_y as f64
        {
            covered += 1;
        }
    }
    assert!(covered >= 12, "disk center inside mask bbox in {} of 15 frames", covered);
    Ok(())
}

#[test]
fn half_occluded_disk_still_yields_foreground() -> Result<()> {
    let results = run_scene(
        SceneConfig {
            occlude: true,
            ..SceneConfig::default()
        },
        20,
    )?;
    let detected = results
        .iter()
        .filter(|(_, summary)| foreground(summary) > 20)
        .count();
    assert!(detected >= 15, "only {} of 20 occluded frames detected", detected);
    Ok(())
}

#[test]
fn static_scene_produces_no_blobs() -> Result<()> {
    let results = run_scene(
        SceneConfig {
            radius: 0.0,
            foreground: 120,
            ..SceneConfig::default()
        },
        10,
    )?;
    for (index, summary) in &results {
        assert!(
            foreground(summary) < 50,
            "frame {} has {} px of noise",
            index,
            foreground(summary)
        );
    }
    Ok(())
}

#[test]
fn tracking_session_behind_the_dispatcher() -> Result<()> {
    let detections = Arc::new(Mutex::new((0usize, 0usize)));
    let sink = detections.clone();
    let session = TrackingSession::new(
        PipelineEngine::tracking_default(),
        Box::new(move |_frame: &Frame, mask: Option<&BinaryMask>| {
            let mut counts = sink.lock().unwrap();
            counts.0 += 1;
            if mask.map(|m| m.foreground_count() > 50).unwrap_or(false) {
                counts.1 += 1;
            }
        }),
    );

    let mut dispatcher = CaptureDispatcher::new(DispatcherConfig::default());
    dispatcher.register_consumer(session);
    dispatcher.start(
        Box::new(SyntheticSource::new()),
        CaptureParams::new("stub://e2e?seed=7&fps=60", 160, 120),
    )?;

    let deadline = Instant::now() + Duration::from_secs(20);
    while detections.lock().unwrap().0 < 12 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    dispatcher.stop();

    let (processed, detected) = *detections.lock().unwrap();
    assert!(processed >= 12, "processed {} frames", processed);
    assert!(
        detected * 2 >= processed,
        "{} detections in {} frames",
        detected,
        processed
    );
    Ok(())
}
