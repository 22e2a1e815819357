//! Tracking session: the consumer that turns delivered frames into masks.

use crate::capture::FrameConsumer;
use crate::frame::{BinaryMask, Frame, GrayBuffer};
use crate::pipeline::PipelineEngine;

/// Receives every processed frame with its mask, or `None` when no stage
/// produced one (including frames on which a stage faulted).
pub type TrackerCallback = Box<dyn FnMut(&Frame, Option<&BinaryMask>) + Send>;

/// Foreground statistics of one mask.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskSummary {
    pub foreground: usize,
    /// Mean foreground coordinate `(x, y)`.
    pub centroid: Option<(f64, f64)>,
    /// Inclusive bounding box `(min_x, min_y, max_x, max_y)`.
    pub bbox: Option<(u32, u32, u32, u32)>,
}

impl MaskSummary {
    pub fn from_mask(mask: &BinaryMask) -> Self {
        let width = mask.width as usize;
        let mut count = 0usize;
        let (mut sum_x, mut sum_y) = (0f64, 0f64);
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        for (i, &v) in mask.as_slice().iter().enumerate() {
            if v != BinaryMask::FOREGROUND {
                continue;
            }
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            count += 1;
            sum_x += x as f64;
            sum_y += y as f64;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        if count == 0 {
            return Self {
                foreground: 0,
                centroid: None,
                bbox: None,
            };
        }
        Self {
            foreground: count,
            centroid: Some((sum_x / count as f64, sum_y / count as f64)),
            bbox: Some((min_x, min_y, max_x, max_y)),
        }
    }
}

/// Owns a pipeline and the background it carries from frame to frame.
pub struct TrackingSession {
    engine: PipelineEngine,
    background: Option<GrayBuffer>,
    tracker: TrackerCallback,
    frames: u64,
    frames_with_mask: u64,
    last: Option<MaskSummary>,
}

impl TrackingSession {
    pub fn new(engine: PipelineEngine, tracker: TrackerCallback) -> Self {
        Self {
            engine,
            background: None,
            tracker,
            frames: 0,
            frames_with_mask: 0,
            last: None,
        }
    }

    /// Session without a tracker; summaries are still computed.
    pub fn detached(engine: PipelineEngine) -> Self {
        Self::new(engine, Box::new(|_: &Frame, _: Option<&BinaryMask>| {}))
    }

    /// Run the pipeline on `frame`, notify the tracker and return the mask
    /// summary when a mask was produced.
    pub fn process(&mut self, frame: &Frame) -> Option<MaskSummary> {
        let output = self.engine.process(frame, self.background.take());
        self.background = output.background;
        self.frames += 1;

        (self.tracker)(frame, output.mask.as_ref());
        let summary = output.mask.map(|mask| {
            let summary = MaskSummary::from_mask(&mask);
            self.engine.recycle_mask(mask);
            summary
        });
        if summary.is_some() {
            self.frames_with_mask += 1;
        }
        self.last = summary;
        summary
    }

    /// Forget the background so the next frame bootstraps a new one.
    pub fn reset(&mut self) {
        if let Some(background) = self.background.take() {
            self.engine.recycle_background(background);
        }
        self.last = None;
        log::info!("tracking session reset after {} frames", self.frames);
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn background(&self) -> Option<&GrayBuffer> {
        self.background.as_ref()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn frames_with_mask(&self) -> u64 {
        self.frames_with_mask
    }

    pub fn last_summary(&self) -> Option<MaskSummary> {
        self.last
    }
}

impl FrameConsumer for TrackingSession {
    fn on_frame(&mut self, frame: &Frame, _timestamp_ms: u64) {
        self.process(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn summary_of_block() {
        let mut mask = BinaryMask::new(10, 8);
        for y in 2..5 {
            for x in 3..7 {
                mask.set(x, y, true);
            }
        }
        let summary = MaskSummary::from_mask(&mask);
        assert_eq!(summary.foreground, 12);
        assert_eq!(summary.bbox, Some((3, 2, 6, 4)));
        assert_eq!(summary.centroid, Some((4.5, 3.0)));
    }

    #[test]
    fn empty_mask_has_no_geometry() {
        let summary = MaskSummary::from_mask(&BinaryMask::new(4, 4));
        assert_eq!(summary.foreground, 0);
        assert!(summary.centroid.is_none());
        assert!(summary.bbox.is_none());
    }

    #[test]
    fn session_threads_background_and_reset_clears_it() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let mut session = TrackingSession::new(
            PipelineEngine::tracking_default(),
            Box::new(move |frame: &Frame, mask: Option<&BinaryMask>| {
                sink.lock()
                    .expect("lock")
                    .push((frame.timestamp_ms, mask.map(|m| m.foreground_count())));
            }),
        );

        let frame = Frame::filled(24, 24, [90, 90, 90], 1);
        assert!(session.background().is_none());
        let summary = session.process(&frame).expect("threshold stage yields a mask");
        assert_eq!(summary.foreground, 0);
        assert!(session.background().is_some());

        session.on_frame(&Frame::filled(24, 24, [90, 90, 90], 2), 2);
        assert_eq!(session.frames_processed(), 2);
        assert_eq!(session.frames_with_mask(), 2);

        session.reset();
        assert!(session.background().is_none());
        assert_eq!(*calls.lock().expect("lock"), vec![(1, Some(0)), (2, Some(0))]);
    }
}
