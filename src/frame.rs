//! Pixel representations.
//!
//! Three distinct buffer types flow through the kernel and are never mixed:
//!
//! - `Frame`: packed RGB24 image with a monotonic timestamp. Produced by capture.
//! - `GrayBuffer`: single-channel intensity image (`gray`, `background`, `work`).
//! - `BinaryMask`: single-channel image restricted to `FOREGROUND` / `BACKGROUND`.
//!
//! Conversions between them are explicit functions; none of them derefs to a
//! shared "image" type.

use anyhow::{anyhow, Result};

/// Buffer geometry used as the pool key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl Shape {
    pub const fn rgb(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 3,
        }
    }

    pub const fn single(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 1,
        }
    }

    /// Number of bytes a buffer of this shape holds.
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Frame: packed color image
// ----------------------------------------------------------------------------

/// Packed RGB24 frame.
///
/// Owned by its queue slot until delivered; after delivery the dispatcher
/// hands the backing buffer back to the capture pool.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Monotonic capture timestamp in milliseconds since the session epoch.
    pub timestamp_ms: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_ms: u64) -> Result<Self> {
        let expected = Shape::rgb(width, height).len();
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            timestamp_ms,
            data,
        })
    }

    /// Frame filled with a single color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], timestamp_ms: u64) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(Shape::rgb(width, height).len())
            .collect();
        Self {
            width,
            height,
            timestamp_ms,
            data,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::rgb(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    /// Give the backing buffer back (for pool release).
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

// ----------------------------------------------------------------------------
// GrayBuffer: single-channel intensities
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayBuffer {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl GrayBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Shape::single(width, height).len()],
        }
    }

    pub fn from_vec(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        check_single_len(width, height, data.len())?;
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn shape(&self) -> Shape {
        Shape::single(self.width, self.height)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    pub fn copy_from(&mut self, other: &GrayBuffer) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(anyhow!(
                "gray buffer shape mismatch: {}x{} vs {}x{}",
                self.width,
                self.height,
                other.width,
                other.height
            ));
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

// ----------------------------------------------------------------------------
// BinaryMask: foreground / background
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryMask {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl BinaryMask {
    pub const FOREGROUND: u8 = 255;
    pub const BACKGROUND: u8 = 0;

    /// All-background mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![Self::BACKGROUND; Shape::single(width, height).len()],
        }
    }

    /// Wrap a buffer, snapping every non-zero byte to `FOREGROUND`.
    pub fn from_vec(width: u32, height: u32, mut data: Vec<u8>) -> Result<Self> {
        check_single_len(width, height, data.len())?;
        for value in data.iter_mut() {
            *value = if *value == Self::BACKGROUND {
                Self::BACKGROUND
            } else {
                Self::FOREGROUND
            };
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Wrap a pooled buffer without normalising it. Contents are unspecified
    /// until a stage overwrites every byte.
    pub(crate) fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), Shape::single(width, height).len());
        Self {
            width,
            height,
            data,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::single(self.width, self.height)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Raw access for stages. Writers must only store the two sentinels.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize] == Self::FOREGROUND
    }

    pub fn set(&mut self, x: u32, y: u32, foreground: bool) {
        let idx = y as usize * self.width as usize + x as usize;
        self.data[idx] = sentinel(foreground);
    }

    pub fn foreground_count(&self) -> usize {
        self.data
            .iter()
            .filter(|&&value| value == Self::FOREGROUND)
            .count()
    }

    /// Reinterpret the mask as intensities (0 / 255).
    pub fn to_gray(&self) -> GrayBuffer {
        GrayBuffer {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

pub(crate) fn sentinel(foreground: bool) -> u8 {
    if foreground {
        BinaryMask::FOREGROUND
    } else {
        BinaryMask::BACKGROUND
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

/// Rec.601 luma in 8.8 fixed point (weights 77/150/29 sum to 256).
pub fn luminance(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

/// Write the luminance of `frame` into `gray`.
pub fn frame_to_gray(frame: &Frame, gray: &mut GrayBuffer) -> Result<()> {
    if gray.width != frame.width || gray.height != frame.height {
        return Err(anyhow!(
            "gray target {}x{} does not match frame {}x{}",
            gray.width,
            gray.height,
            frame.width,
            frame.height
        ));
    }
    for (dst, rgb) in gray.data.iter_mut().zip(frame.data.chunks_exact(3)) {
        *dst = luminance(rgb[0], rgb[1], rgb[2]);
    }
    Ok(())
}

fn check_single_len(width: u32, height: u32, len: usize) -> Result<()> {
    let expected = Shape::single(width, height).len();
    if len != expected {
        return Err(anyhow!(
            "single-channel length mismatch: expected {}, got {}",
            expected,
            len
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        assert!(Frame::new(4, 4, vec![0; 47], 0).is_err());
        assert!(Frame::new(4, 4, vec![0; 48], 0).is_ok());
    }

    #[test]
    fn luminance_of_gray_is_identity() {
        for v in [0u8, 1, 64, 127, 128, 200, 255] {
            assert_eq!(luminance(v, v, v), v);
        }
    }

    #[test]
    fn luminance_weights_green_heaviest() {
        assert!(luminance(0, 255, 0) > luminance(255, 0, 0));
        assert!(luminance(255, 0, 0) > luminance(0, 0, 255));
    }

    #[test]
    fn frame_to_gray_checks_shape() -> Result<()> {
        let frame = Frame::filled(3, 2, [10, 20, 30], 0);
        let mut gray = GrayBuffer::new(3, 2);
        frame_to_gray(&frame, &mut gray)?;
        assert!(gray.as_slice().iter().all(|&v| v == luminance(10, 20, 30)));

        let mut wrong = GrayBuffer::new(2, 3);
        assert!(frame_to_gray(&frame, &mut wrong).is_err());
        Ok(())
    }

    #[test]
    fn mask_from_vec_snaps_to_sentinels() -> Result<()> {
        let mask = BinaryMask::from_vec(2, 2, vec![0, 1, 128, 255])?;
        assert_eq!(mask.as_slice(), &[0, 255, 255, 255]);
        assert_eq!(mask.foreground_count(), 3);
        Ok(())
    }
}
