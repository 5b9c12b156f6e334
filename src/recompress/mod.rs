//! Image Recompressor - size-adaptive page re-encoding
//!
//! Pages at or above the threshold are decoded and re-encoded as JPEG so the
//! base64 text frames stay bounded. Pure and stateless; any failure passes
//! the original bytes through untouched.

use image::codecs::jpeg::JpegEncoder;

pub struct Recompressor {
    threshold: u64,
    quality: u8,
}

impl Recompressor {
    pub fn new(threshold: u64, quality: u8) -> Self {
        Self { threshold, quality }
    }

    /// Recompress `data` when it is at or above the threshold
    ///
    /// Returns the (possibly new) bytes and format tag.
    pub fn process(&self, data: Vec<u8>, format: &str) -> (Vec<u8>, String) {
        if (data.len() as u64) < self.threshold {
            return (data, format.to_string());
        }

        match self.reencode(&data) {
            Ok(smaller) => {
                tracing::debug!(
                    original = data.len(),
                    recompressed = smaller.len(),
                    "Page recompressed"
                );
                (smaller, "jpg".to_string())
            }
            Err(err) => {
                tracing::warn!(error = %err, format, "Recompression failed, passing page through");
                (data, format.to_string())
            }
        }
    }

    fn reencode(&self, data: &[u8]) -> image::ImageResult<Vec<u8>> {
        let decoded = image::load_from_memory(data)?;
        // JPEG has no alpha channel
        let rgb = decoded.to_rgb8();
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        rgb.write_with_encoder(encoder)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 253) as u8])
        });
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
            .unwrap();
        buf
    }

    #[test]
    fn small_pages_pass_through_unchanged() {
        let recompressor = Recompressor::new(5 * 1024 * 1024, 85);
        let data = png_bytes(32, 32);
        let original = data.clone();
        let (out, format) = recompressor.process(data, "png");
        assert_eq!(out, original);
        assert_eq!(format, "png");
    }

    #[test]
    fn large_pages_become_jpeg() {
        // Threshold of 1 byte forces the path regardless of image size
        let recompressor = Recompressor::new(1, 85);
        let (out, format) = recompressor.process(png_bytes(128, 128), "png");
        assert_eq!(format, "jpg");
        // JPEG magic
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
        assert!(image::load_from_memory(&out).is_ok());
    }

    #[test]
    fn undecodable_payload_passes_through() {
        let recompressor = Recompressor::new(1, 85);
        let garbage = vec![0x42u8; 64];
        let (out, format) = recompressor.process(garbage.clone(), "raw");
        assert_eq!(out, garbage);
        assert_eq!(format, "raw");
    }
}
