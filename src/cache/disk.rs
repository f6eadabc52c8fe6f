//! Disk payload storage
//!
//! Payloads are stored one file per cache key as `{key}.img`. Writes go
//! through a temp file and an atomic rename so readers never observe a
//! partial payload. The encoding is chosen per payload: PNG when the image
//! carries alpha or the request asked for full quality, JPEG at quality 90
//! otherwise.

use crate::attribute::CacheKey;
use crate::payload::ImageBuf;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Raw payload byte storage, keyed by cache key.
///
/// Failures in this layer are non-fatal to requests; callers treat a failed
/// read as a miss and a failed write as "not persisted".
pub trait Storage: Send + Sync {
  fn read(&self, key: &CacheKey) -> Option<Vec<u8>>;
  fn write(&self, key: &CacheKey, bytes: &[u8]) -> std::io::Result<()>;
  fn remove(&self, key: &CacheKey);
  fn exists(&self, key: &CacheKey) -> bool;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
  fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
    (**self).read(key)
  }
  fn write(&self, key: &CacheKey, bytes: &[u8]) -> std::io::Result<()> {
    (**self).write(key, bytes)
  }
  fn remove(&self, key: &CacheKey) {
    (**self).remove(key)
  }
  fn exists(&self, key: &CacheKey) -> bool {
    (**self).exists(key)
  }
}

/// Filesystem-backed [`Storage`].
pub struct FsStorage {
  dir: PathBuf,
}

impl FsStorage {
  /// Use `dir` for payload files, creating it if needed.
  pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(Self { dir })
  }

  fn payload_path(&self, key: &CacheKey) -> PathBuf {
    self.dir.join(format!("{key}.img"))
  }
}

impl Storage for FsStorage {
  fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
    std::fs::read(self.payload_path(key)).ok()
  }

  fn write(&self, key: &CacheKey, bytes: &[u8]) -> std::io::Result<()> {
    let final_path = self.payload_path(key);
    let tmp_path = self.dir.join(format!("{key}.img.tmp"));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, &final_path)
  }

  fn remove(&self, key: &CacheKey) {
    let _ = std::fs::remove_file(self.payload_path(key));
  }

  fn exists(&self, key: &CacheKey) -> bool {
    self.payload_path(key).exists()
  }
}

const JPEG_QUALITY: u8 = 90;

/// Encode a payload for the disk tier: lossless PNG when alpha matters or
/// full quality was requested, JPEG 90 otherwise.
pub fn encode_payload(img: &ImageBuf, high_quality: bool) -> Result<Vec<u8>, String> {
  let mut out = Vec::new();
  if img.has_alpha() || high_quality {
    DynamicImage::ImageRgba8(img.pixels().clone())
      .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
      .map_err(|e| e.to_string())?;
  } else {
    let rgb = DynamicImage::ImageRgba8(img.pixels().clone()).into_rgb8();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), JPEG_QUALITY)
      .encode_image(&rgb)
      .map_err(|e| e.to_string())?;
  }
  Ok(out)
}

/// Decode a disk payload. `None` means the file is unreadable as an image
/// (truncated write, bit rot); callers treat it as a miss and self-heal.
pub fn decode_payload(bytes: &[u8]) -> Option<ImageBuf> {
  let decoded = image::load_from_memory(bytes).ok()?;
  let has_alpha = decoded.color().has_alpha();
  Some(ImageBuf::new(decoded.into_rgba8(), has_alpha))
}
