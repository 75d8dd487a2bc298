//! Decoded source images.
//!
//! `DecodedImage` is the only image type the core accepts: an owned RGB8
//! buffer whose width and height are known and non-zero. Gallery pickers,
//! camera captures and files all funnel into it before a submission.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

/// Rotations a detector accepts, clockwise, in degrees.
pub const SUPPORTED_ROTATIONS: [u32; 4] = [0, 90, 180, 270];

/// Owned RGB8 image of known, non-zero dimensions.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    rgb: RgbImage,
}

impl DecodedImage {
    /// Wrap raw interleaved RGB bytes.
    pub fn from_rgb8(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("image must be non-empty (got {}x{})", width, height));
        }
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("image dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }
        let rgb = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
        Ok(Self { rgb })
    }

    /// Solid-colour image, handy for tests and synthetic runs.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("image must be non-empty (got {}x{})", width, height));
        }
        Ok(Self {
            rgb: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        })
    }

    pub fn from_dynamic(image: DynamicImage) -> Result<Self> {
        let rgb = image.into_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(anyhow!("decoded image is empty"));
        }
        Ok(Self { rgb })
    }

    /// Decode an encoded image (JPEG, PNG) held in memory.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("failed to decode image bytes")?;
        Self::from_dynamic(decoded)
    }

    /// Decode an image file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        Self::from_dynamic(decoded)
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    /// Interleaved RGB bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.rgb.as_raw()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Rotate clockwise by one of [`SUPPORTED_ROTATIONS`].
    ///
    /// A zero rotation borrows instead of copying.
    pub fn rotated(&self, degrees: u32) -> Result<Cow<'_, DecodedImage>> {
        let rgb = match degrees {
            0 => return Ok(Cow::Borrowed(self)),
            90 => imageops::rotate90(&self.rgb),
            180 => imageops::rotate180(&self.rgb),
            270 => imageops::rotate270(&self.rgb),
            other => return Err(anyhow!("unsupported rotation {} degrees", other)),
        };
        Ok(Cow::Owned(Self { rgb }))
    }

    /// Stretch-resize to a `size` x `size` square (no letterboxing).
    pub fn resized_square(&self, size: u32) -> Result<RgbImage> {
        if size == 0 {
            return Err(anyhow!("model input size must be > 0"));
        }
        Ok(imageops::resize(&self.rgb, size, size, FilterType::Triangle))
    }
}
