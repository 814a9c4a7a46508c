//! Conversion of normalized frames into `image` buffers and PNG files.

use std::path::Path;

use image::{DynamicImage, ImageBuffer, ImageFormat};
use tracing::debug;

use crate::capture::NormalizedFrame;
use crate::error::{CaptureError, Result};

impl NormalizedFrame {
    /// 16-bit image matching the frame's channel count.
    pub fn to_image(&self) -> Result<DynamicImage> {
        let (width, height) = (self.width(), self.height());
        let samples: Vec<u16> = self.samples().collect();
        let malformed = || {
            CaptureError::MalformedFrame(format!(
                "{} samples do not fill {width}x{height}x{}",
                samples_len(self),
                self.channels()
            ))
        };

        let image = match self.channels() {
            1 => DynamicImage::ImageLuma16(
                ImageBuffer::from_raw(width, height, samples).ok_or_else(malformed)?,
            ),
            2 => DynamicImage::ImageLumaA16(
                ImageBuffer::from_raw(width, height, samples).ok_or_else(malformed)?,
            ),
            3 => DynamicImage::ImageRgb16(
                ImageBuffer::from_raw(width, height, samples).ok_or_else(malformed)?,
            ),
            4 => DynamicImage::ImageRgba16(
                ImageBuffer::from_raw(width, height, samples).ok_or_else(malformed)?,
            ),
            other => {
                return Err(CaptureError::MalformedFrame(format!(
                    "cannot export {other} channels"
                )))
            }
        };
        Ok(image)
    }

    /// Write the frame as a 16-bit PNG.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.to_image()?.save_with_format(path, ImageFormat::Png)?;
        debug!(index = self.index(), path = %path.display(), "frame saved");
        Ok(())
    }
}

fn samples_len(frame: &NormalizedFrame) -> usize {
    frame.as_bytes().len() / 2
}

#[cfg(test)]
mod tests {
    use crate::capture::normalize::normalize_buffer;

    #[test]
    fn test_mono_frame_exports_as_luma16() {
        let frame = normalize_buffer(&[0x00, 0x7F, 0xFF, 0x10], 2, 2, 8, 1).expect("normalize");
        let image = frame.to_image().expect("to image");
        let luma = image.as_luma16().expect("luma16 image");
        assert_eq!(luma.dimensions(), (2, 2));
        assert_eq!(luma.get_pixel(1, 0).0, [0xFF00]);
        assert_eq!(luma.get_pixel(0, 1).0, [0x1000]);
    }

    #[test]
    fn test_rgb_frame_exports_as_rgb16() {
        let raw: Vec<u8> = vec![1, 2, 3, 4, 5, 6];
        let frame = normalize_buffer(&raw, 2, 1, 8, 3).expect("normalize");
        let image = frame.to_image().expect("to image");
        let rgb = image.as_rgb16().expect("rgb16 image");
        assert_eq!(rgb.get_pixel(1, 0).0, [0x0400, 0x0500, 0x0600]);
    }

    #[test]
    fn test_save_writes_png() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("frame.png");
        let frame = normalize_buffer(&[0xFF; 16], 4, 2, 16, 1).expect("normalize");
        frame.save(&path).expect("save");

        let loaded = image::open(&path).expect("reload png");
        assert_eq!(loaded.as_luma16().map(|img| img.dimensions()), Some((4, 2)));
    }
}
