//! Outbound photo normalization.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};

/// JPEG quality used for re-encoded photos.
pub const JPEG_QUALITY: u8 = 90;

/// Re-encode any supported image as an opaque JPEG.
///
/// The platform only accepts JPEG uploads. Transparent pixels are
/// composited onto white so they do not come out black.
///
/// # Errors
///
/// Returns [`ImageError`] if the input cannot be decoded or the output
/// cannot be encoded.
pub fn normalize_photo(bytes: &[u8]) -> Result<Vec<u8>, ImageError> {
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut flat = RgbImage::new(width, height);
    for (src, dst) in rgba.pixels().zip(flat.pixels_mut()) {
        let [r, g, b, a] = src.0;
        dst.0 = [over_white(r, a), over_white(g, a), over_white(b, a)];
    }

    let mut out = Cursor::new(Vec::new());
    flat.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?;
    Ok(out.into_inner())
}

/// Blend one channel over a white background.
fn over_white(channel: u8, alpha: u8) -> u8 {
    let c = u32::from(channel);
    let a = u32::from(alpha);
    let blended = c
        .saturating_mul(a)
        .saturating_add(255_u32.saturating_mul(255_u32.saturating_sub(a)))
        / 255;
    u8::try_from(blended).unwrap_or(u8::MAX)
}
