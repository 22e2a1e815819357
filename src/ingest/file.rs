//! Image-sequence playback source.
//!
//! `FileSource` plays a local directory of still images (PNG or JPEG, in
//! file-name order) as a video. Frame pulls are paced at
//! `1 / (fps * speed)` where `speed` is read from a shared `PlaybackSpeed`
//! on every pull, so a speed governor can slow playback down when the
//! consumers fall behind.
//!
//! The file source MUST NOT fetch remote URLs; only local paths are accepted.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::imageops::FilterType;

use super::{FrameSource, PixelFormat, RawFrame, SourceStats};
use crate::error::KernelError;
use crate::speed::PlaybackSpeed;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Clone, Debug)]
pub struct FileSourceConfig {
    /// Nominal frame rate at speed 1.0. Zero disables pacing.
    pub fps: f64,
    /// Restart from the first image after the last one.
    pub looping: bool,
    pub speed: PlaybackSpeed,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            looping: false,
            speed: PlaybackSpeed::default(),
        }
    }
}

pub struct FileSource {
    config: FileSourceConfig,
    path: String,
    files: Vec<PathBuf>,
    cursor: usize,
    width: u32,
    height: u32,
    next_due: Option<Instant>,
    frames_captured: u64,
    exhausted: bool,
}

impl FileSource {
    pub fn new(config: FileSourceConfig) -> Self {
        Self {
            config,
            path: String::new(),
            files: Vec::new(),
            cursor: 0,
            width: 0,
            height: 0,
            next_due: None,
            frames_captured: 0,
            exhausted: false,
        }
    }

    /// Number of images in the opened sequence.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True once a non-looping sequence has played its last image.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Current pull interval, or `None` when unpaced.
    pub fn frame_interval(&self) -> Option<Duration> {
        if self.config.fps <= 0.0 {
            return None;
        }
        let rate = self.config.fps * self.config.speed.get();
        if !(rate.is_finite() && rate > 0.0) {
            return None;
        }
        Some(Duration::from_secs_f64(1.0 / rate))
    }

    fn load(&self, path: &Path) -> Result<RawFrame> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        let image = if image.width() != self.width || image.height() != self.height {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        } else {
            image
        };
        Ok(RawFrame::new(
            self.width,
            self.height,
            PixelFormat::Rgb24,
            image.into_raw(),
        ))
    }
}

impl FrameSource for FileSource {
    fn open(&mut self, device: &str, width: u32, height: u32) -> Result<()> {
        if device.contains("://") {
            return Err(KernelError::configuration(
                "file ingestion only supports local paths (no URL schemes)",
            ));
        }
        if width == 0 || height == 0 {
            return Err(KernelError::configuration(format!(
                "frame dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        let dir = Path::new(device);
        if !dir.is_dir() {
            return Err(KernelError::configuration(format!(
                "image sequence directory {} does not exist",
                dir.display()
            )));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        if files.is_empty() {
            return Err(KernelError::configuration(format!(
                "no PNG/JPEG images in {}",
                dir.display()
            )));
        }
        files.sort();

        self.path = device.to_string();
        self.files = files;
        self.cursor = 0;
        self.width = width;
        self.height = height;
        self.next_due = None;
        self.exhausted = false;
        log::info!(
            "FileSource: opened {} ({} images, {}x{})",
            device,
            self.files.len(),
            width,
            height
        );
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.files.is_empty() {
            return Err(KernelError::transient("file source is not open"));
        }
        if self.cursor >= self.files.len() {
            if !self.config.looping {
                if !self.exhausted {
                    log::info!("FileSource: end of sequence {}", self.path);
                    self.exhausted = true;
                }
                return Ok(None);
            }
            self.cursor = 0;
        }

        let now = Instant::now();
        if let Some(due) = self.next_due {
            if now < due {
                return Ok(None);
            }
        }
        self.next_due = self.frame_interval().map(|interval| now + interval);

        let path = self.files[self.cursor].clone();
        self.cursor += 1;
        let raw = self
            .load(&path)
            .map_err(|e| KernelError::transient(format!("{:#}", e)))?;
        self.frames_captured += 1;
        Ok(Some(raw))
    }

    fn close(&mut self) {
        if !self.files.is_empty() {
            log::info!("FileSource: closed {}", self.path);
        }
        self.files.clear();
        self.cursor = 0;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            device: self.path.clone(),
        }
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_sequence(dir: &Path, count: u8) -> Result<()> {
        for i in 0..count {
            let image = RgbImage::from_pixel(4, 3, Rgb([i * 10, 0, 0]));
            image.save(dir.join(format!("frame_{:03}.png", i)))?;
        }
        std::fs::write(dir.join("notes.txt"), b"not an image")?;
        Ok(())
    }

    fn unpaced(looping: bool) -> FileSource {
        FileSource::new(FileSourceConfig {
            fps: 0.0,
            looping,
            speed: PlaybackSpeed::default(),
        })
    }

    #[test]
    fn plays_images_in_name_order_then_stops() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_sequence(dir.path(), 3)?;
        let device = dir.path().to_string_lossy().into_owned();

        let mut source = unpaced(false);
        source.open(&device, 4, 3)?;
        assert_eq!(source.len(), 3);
        for i in 0..3u8 {
            let raw = source.grab_frame()?.expect("frame");
            assert_eq!(raw.format, PixelFormat::Rgb24);
            assert_eq!(raw.data[0], i * 10);
        }
        assert!(source.grab_frame()?.is_none());
        assert!(source.is_exhausted());
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn looping_wraps_and_resizes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_sequence(dir.path(), 2)?;
        let device = dir.path().to_string_lossy().into_owned();

        let mut source = unpaced(true);
        source.open(&device, 8, 6)?;
        let mut firsts = Vec::new();
        for _ in 0..4 {
            let raw = source.grab_frame()?.expect("frame");
            assert_eq!(raw.data.len(), 8 * 6 * 3);
            firsts.push(raw.data[0]);
        }
        assert_eq!(firsts, vec![0, 10, 0, 10]);
        Ok(())
    }

    #[test]
    fn pacing_follows_playback_speed() {
        let speed = PlaybackSpeed::new(1.0);
        let source = FileSource::new(FileSourceConfig {
            fps: 10.0,
            looping: false,
            speed: speed.clone(),
        });
        let secs = |s: &FileSource| s.frame_interval().map(|d| d.as_secs_f64());
        assert!((secs(&source).unwrap_or(0.0) - 0.1).abs() < 1e-6);
        speed.set(2.0);
        assert!((secs(&source).unwrap_or(0.0) - 0.05).abs() < 1e-6);
    }

    #[test]
    fn open_rejects_missing_or_empty_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = unpaced(false);
        let empty = dir.path().to_string_lossy().into_owned();
        assert!(source.open(&empty, 4, 3).is_err());
        assert!(source.open("/nonexistent/arena/frames", 4, 3).is_err());
        assert!(source.open("http://example.com/frames", 4, 3).is_err());
        Ok(())
    }
}
