//! Decoded image payloads
//!
//! [`ImageBuf`] wraps an RGBA pixel buffer. Size accounting everywhere in the
//! engine uses the uncompressed pixel-buffer byte size (width x height x 4),
//! not the encoded size, since that is what actually occupies memory.

use image::RgbaImage;

/// A decoded, possibly transformed image payload.
#[derive(Debug, Clone)]
pub struct ImageBuf {
  pixels: RgbaImage,
  /// Whether the payload carries meaningful alpha; decides PNG vs JPEG when
  /// persisted to the disk tier.
  has_alpha: bool,
}

impl ImageBuf {
  pub fn new(pixels: RgbaImage, has_alpha: bool) -> Self {
    Self { pixels, has_alpha }
  }

  /// Build a solid-color image; used for tests and synthesized placeholders.
  pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
    let pixels = RgbaImage::from_pixel(width.max(1), height.max(1), image::Rgba(rgba));
    Self {
      pixels,
      has_alpha: rgba[3] != 0xff,
    }
  }

  pub fn width(&self) -> u32 {
    self.pixels.width()
  }

  pub fn height(&self) -> u32 {
    self.pixels.height()
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.pixels.dimensions()
  }

  pub fn has_alpha(&self) -> bool {
    self.has_alpha
  }

  pub fn pixels(&self) -> &RgbaImage {
    &self.pixels
  }

  pub fn into_pixels(self) -> RgbaImage {
    self.pixels
  }

  /// Resident size in bytes: width x height x bytes-per-pixel (RGBA8 = 4).
  pub fn byte_size(&self) -> usize {
    self.pixels.width() as usize * self.pixels.height() as usize * 4
  }

  /// Total pixel count, used against the decode/transform pixel budget.
  pub fn pixel_count(&self) -> u64 {
    u64::from(self.pixels.width()) * u64::from(self.pixels.height())
  }
}
