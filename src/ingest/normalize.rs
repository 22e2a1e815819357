use anyhow::{anyhow, Result};

use super::{PixelFormat, RawFrame};

/// Convert `raw` into packed RGB24 inside `dst`.
///
/// `dst` must already be `width * height * 3` bytes (a pooled buffer).
pub fn normalize_into(raw: &RawFrame, dst: &mut [u8]) -> Result<()> {
    let expected = raw
        .format
        .frame_len(raw.width, raw.height)
        .ok_or_else(|| anyhow!("{:?} frame dimensions overflow", raw.format))?;
    if raw.data.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            raw.format,
            expected,
            raw.data.len()
        ));
    }
    if raw.format == PixelFormat::Nv12 && (raw.width % 2 != 0 || raw.height % 2 != 0) {
        return Err(anyhow!(
            "NV12 frame needs even dimensions, got {}x{}",
            raw.width,
            raw.height
        ));
    }
    let rgb_len = raw.width as usize * raw.height as usize * 3;
    if dst.len() != rgb_len {
        return Err(anyhow!(
            "destination buffer length mismatch: expected {}, got {}",
            rgb_len,
            dst.len()
        ));
    }

    match raw.format {
        PixelFormat::Rgb24 => dst.copy_from_slice(&raw.data),
        PixelFormat::Bgr24 => {
            for (out, bgr) in dst.chunks_exact_mut(3).zip(raw.data.chunks_exact(3)) {
                out[0] = bgr[2];
                out[1] = bgr[1];
                out[2] = bgr[0];
            }
        }
        PixelFormat::Gray8 => {
            for (out, &v) in dst.chunks_exact_mut(3).zip(raw.data.iter()) {
                out.fill(v);
            }
        }
        PixelFormat::Nv12 => nv12_to_rgb(&raw.data, raw.width, raw.height, dst),
    }
    Ok(())
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32, rgb: &mut [u8]) {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(y + 1.402 * v);
            rgb[offset + 1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
            rgb[offset + 2] = clamp_to_u8(y + 1.772 * u);
        }
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
