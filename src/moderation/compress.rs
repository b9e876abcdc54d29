//! Lossy size reduction that keeps the source container format.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, warn};

pub const DEFAULT_QUALITY: u8 = 85;

/// Re-encodes image bytes. Implementations report failure as `None` and never
/// panic, so callers can retry.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], quality: u8) -> Option<Vec<u8>>;
}

/// `image`-crate backed compressor: JPEG honours `quality`, PNG uses the best
/// deflate level, everything else goes through the format's default encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCompressor;

impl Compressor for ImageCompressor {
    fn compress(&self, data: &[u8], quality: u8) -> Option<Vec<u8>> {
        match reencode(data, quality) {
            Ok(output) if !output.is_empty() => {
                debug!(
                    "[compress] Image compressed successfully ({} -> {} bytes)",
                    data.len(),
                    output.len()
                );
                Some(output)
            }
            Ok(_) => {
                warn!("[compress] Error compressing image: encoder produced no output");
                None
            }
            Err(e) => {
                warn!("[compress] Error compressing image: {}", e);
                None
            }
        }
    }
}

fn reencode(
    data: &[u8],
    quality: u8,
) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    let format = reader.format().ok_or("unrecognised image format")?;
    let img = reader.decode()?;

    let mut output = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let img = if img.color().has_alpha() {
                DynamicImage::ImageRgb8(img.to_rgb8())
            } else {
                img
            };
            img.write_with_encoder(JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100)))?;
        }
        ImageFormat::Png => {
            img.write_with_encoder(PngEncoder::new_with_quality(
                &mut output,
                CompressionType::Best,
                FilterType::Adaptive,
            ))?;
        }
        other => img.write_to(&mut output, other)?,
    }

    Ok(output.into_inner())
}
