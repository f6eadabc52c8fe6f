//! Decoding origin bytes into pixel buffers
//!
//! [`StdDecoder`] recognizes formats by magic bytes, honors EXIF orientation,
//! enforces the decode pixel budget before allocating the full frame, and
//! subsamples down to the request's bound dimensions so oversized sources
//! never occupy more memory than the caller asked for.

use crate::error::DecodeError;
use crate::payload::ImageBuf;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;
use std::sync::Arc;

/// Per-request decode parameters derived from the attribute set and engine
/// config.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
  /// Bound dimensions; the decoded frame is subsampled to fit within these.
  /// `0` disables the bound on that axis.
  pub max_width: u32,
  pub max_height: u32,
  /// Hard pixel budget; frames beyond it fail with [`DecodeError::TooLarge`]
  /// before the pixel buffer is allocated. `0` disables the budget.
  pub max_pixels: u64,
  /// Use a high-quality resampling filter when subsampling.
  pub high_quality: bool,
}

/// Decodes encoded bytes into an [`ImageBuf`].
pub trait Decoder: Send + Sync {
  /// Bounds-only probe: read the header and report `(width, height)` without
  /// allocating the pixel buffer.
  fn probe(&self, bytes: &[u8]) -> Result<(u32, u32), DecodeError>;

  fn decode(&self, bytes: &[u8], opts: &DecodeOptions) -> Result<ImageBuf, DecodeError>;
}

impl<T: Decoder + ?Sized> Decoder for Arc<T> {
  fn probe(&self, bytes: &[u8]) -> Result<(u32, u32), DecodeError> {
    (**self).probe(bytes)
  }

  fn decode(&self, bytes: &[u8], opts: &DecodeOptions) -> Result<ImageBuf, DecodeError> {
    (**self).decode(bytes, opts)
  }
}

/// Default decoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDecoder;

impl StdDecoder {
  pub fn new() -> Self {
    Self
  }

  /// EXIF orientation as (quarter turns clockwise, horizontal flip first).
  fn exif_orientation(bytes: &[u8]) -> Option<(u8, bool)> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let value = exif
      .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
      .and_then(|f| f.value.get_uint(0))?;
    match value {
      1 => Some((0, false)),
      2 => Some((0, true)),
      3 => Some((2, false)),
      4 => Some((2, true)),
      5 => Some((1, true)),
      6 => Some((1, false)),
      7 => Some((3, true)),
      8 => Some((3, false)),
      _ => None,
    }
  }

  fn apply_orientation(img: DynamicImage, quarter_turns: u8, flip_x: bool) -> DynamicImage {
    let img = if flip_x { img.fliph() } else { img };
    match quarter_turns % 4 {
      1 => img.rotate90(),
      2 => img.rotate180(),
      3 => img.rotate270(),
      _ => img,
    }
  }
}

impl Decoder for StdDecoder {
  fn probe(&self, bytes: &[u8]) -> Result<(u32, u32), DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()
      .map_err(|e| DecodeError::UnsupportedFormat { reason: e.to_string() })?;
    if reader.format().is_none() {
      return Err(DecodeError::UnsupportedFormat {
        reason: "unrecognized magic bytes".to_string(),
      });
    }
    reader.into_dimensions().map_err(|_| DecodeError::Malformed {
      reason: "missing image header".to_string(),
    })
  }

  fn decode(&self, bytes: &[u8], opts: &DecodeOptions) -> Result<ImageBuf, DecodeError> {
    // Reject over-budget frames from the header alone, before the pixel
    // buffer exists.
    let (width, height) = self.probe(bytes)?;
    if opts.max_pixels > 0 {
      let pixels = u64::from(width) * u64::from(height);
      if pixels > opts.max_pixels {
        return Err(DecodeError::TooLarge {
          width,
          height,
          limit: opts.max_pixels,
        });
      }
    }

    let decoded = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()
      .map_err(|e| DecodeError::UnsupportedFormat { reason: e.to_string() })?
      .decode()
      .map_err(|e| DecodeError::Malformed { reason: e.to_string() })?;
    let has_alpha = decoded.color().has_alpha();

    let oriented = match Self::exif_orientation(bytes) {
      Some((turns, flip)) => Self::apply_orientation(decoded, turns, flip),
      None => decoded,
    };

    // Subsample to the bound dimensions. Aspect ratio is preserved; the bound
    // is a ceiling, not a target.
    let (w, h) = oriented.dimensions();
    let exceeds_w = opts.max_width > 0 && w > opts.max_width;
    let exceeds_h = opts.max_height > 0 && h > opts.max_height;
    let bounded = if exceeds_w || exceeds_h {
      let target_w = if opts.max_width > 0 { opts.max_width } else { w };
      let target_h = if opts.max_height > 0 { opts.max_height } else { h };
      let filter = if opts.high_quality {
        FilterType::Lanczos3
      } else {
        FilterType::Triangle
      };
      oriented.resize(target_w, target_h, filter)
    } else {
      oriented
    };

    Ok(ImageBuf::new(bounded.into_rgba8(), has_alpha))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbaImage;

  fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
      .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
      .unwrap();
    out
  }

  #[test]
  fn decodes_png_to_rgba() {
    let buf = StdDecoder::new().decode(&png_bytes(8, 6), &DecodeOptions::default()).unwrap();
    assert_eq!(buf.dimensions(), (8, 6));
    assert_eq!(buf.pixels().get_pixel(0, 0).0, [10, 20, 30, 255]);
  }

  #[test]
  fn probe_reads_dimensions_without_decoding() {
    assert_eq!(StdDecoder::new().probe(&png_bytes(31, 17)).unwrap(), (31, 17));
    assert!(matches!(
      StdDecoder::new().probe(b"not an image").unwrap_err(),
      DecodeError::UnsupportedFormat { .. }
    ));
  }

  #[test]
  fn garbage_is_unsupported_format() {
    let err = StdDecoder::new()
      .decode(b"definitely not an image", &DecodeOptions::default())
      .unwrap_err();
    assert!(matches!(err, DecodeError::UnsupportedFormat { .. }));
  }

  #[test]
  fn truncated_png_is_malformed() {
    let mut bytes = png_bytes(16, 16);
    bytes.truncate(bytes.len() / 2);
    let err = StdDecoder::new().decode(&bytes, &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, DecodeError::Malformed { .. }));
  }

  #[test]
  fn pixel_budget_rejects_before_decode() {
    let opts = DecodeOptions {
      max_pixels: 100,
      ..DecodeOptions::default()
    };
    let err = StdDecoder::new().decode(&png_bytes(20, 20), &opts).unwrap_err();
    assert!(matches!(err, DecodeError::TooLarge { width: 20, height: 20, limit: 100 }));
  }

  #[test]
  fn bound_dimensions_subsample() {
    let opts = DecodeOptions {
      max_width: 10,
      max_height: 10,
      ..DecodeOptions::default()
    };
    let buf = StdDecoder::new().decode(&png_bytes(40, 20), &opts).unwrap();
    assert_eq!(buf.dimensions(), (10, 5));
  }

  #[test]
  fn small_sources_are_not_upscaled() {
    let opts = DecodeOptions {
      max_width: 100,
      max_height: 100,
      ..DecodeOptions::default()
    };
    let buf = StdDecoder::new().decode(&png_bytes(8, 6), &opts).unwrap();
    assert_eq!(buf.dimensions(), (8, 6));
  }
}
