//! Full-decode image validation.
//!
//! Sniffing the header is not enough to catch truncated CDN transfers, so the
//! whole image is decoded before it is reported as intact.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};
use tracing::debug;

/// Result of inspecting an image blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCheck {
    pub ok: bool,
    pub format: Option<ImageFormat>,
    pub width: u32,
    pub height: u32,
}

impl ImageCheck {
    pub fn invalid(format: Option<ImageFormat>) -> Self {
        Self {
            ok: false,
            format,
            width: 0,
            height: 0,
        }
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        self.format.map(|format| format.to_mime_type())
    }
}

/// Decode `data` completely and report its format and dimensions.
/// Never fails: any decode problem yields `ok == false`.
pub fn validate(data: &[u8]) -> ImageCheck {
    let reader = match ImageReader::new(Cursor::new(data)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("[validate] Image format detection failed: {}", e);
            return ImageCheck::invalid(None);
        }
    };

    let Some(format) = reader.format() else {
        debug!("[validate] Unrecognised image format ({} bytes)", data.len());
        return ImageCheck::invalid(None);
    };

    match reader.decode() {
        Ok(img) => ImageCheck {
            ok: true,
            format: Some(format),
            width: img.width(),
            height: img.height(),
        },
        Err(e) => {
            debug!("[validate] Image failed to decode as {:?}: {}", format, e);
            ImageCheck::invalid(Some(format))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg_bytes, png_bytes};

    #[test]
    fn test_valid_png_reports_dimensions() {
        let check = validate(&png_bytes(48, 32));
        assert!(check.ok);
        assert_eq!(check.format, Some(ImageFormat::Png));
        assert_eq!((check.width, check.height), (48, 32));
        assert_eq!(check.mime_type(), Some("image/png"));
    }

    #[test]
    fn test_valid_jpeg() {
        let check = validate(&jpeg_bytes(20, 20));
        assert!(check.ok);
        assert_eq!(check.mime_type(), Some("image/jpeg"));
    }

    #[test]
    fn test_truncated_png_is_invalid_but_format_known() {
        let bytes = png_bytes(64, 64);
        let check = validate(&bytes[..bytes.len() / 2]);
        assert!(!check.ok);
        assert_eq!(check.format, Some(ImageFormat::Png));
    }

    #[test]
    fn test_garbage_and_empty_are_invalid() {
        assert_eq!(validate(b"definitely not an image"), ImageCheck::invalid(None));
        assert!(!validate(&[]).ok);
    }
}
