//! Request attributes, fingerprints, and cache keys
//!
//! [`ImageAttributes`] describes everything a request wants: the transforms to
//! apply, how the result should be displayed, and how the work should be
//! scheduled. Only transform-affecting fields participate in the
//! [`fingerprint`](ImageAttributes::fingerprint); display and scheduling
//! policy never change the computed payload, so they must not change the key.

use crate::locator::SourceLocator;
use crate::resources::ResourceId;
use crate::scheduler::PoolOrdering;
use sha2::{Digest, Sha256};

/// How a resize stage maps the source onto the target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResizeMode {
  /// Preserve aspect ratio, bounded by the dominant side: landscape sources
  /// match the target width, portrait sources the target height.
  #[default]
  Fit,
  /// Scale until both dimensions cover the target, but no further than needed
  /// (expand-to-fill without over-upscaling); output may exceed the target on
  /// one axis.
  Expand,
  /// Scale to cover, then center-crop to exactly the target dimensions
  /// (full-bleed thumbnails).
  Crop,
}

impl ResizeMode {
  fn tag(self) -> u8 {
    match self {
      ResizeMode::Fit => 0,
      ResizeMode::Expand => 1,
      ResizeMode::Crop => 2,
    }
  }
}

/// How a sink should scale a delivered image or placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
  #[default]
  FitCenter,
  CenterCrop,
  Center,
}

/// Display policy: placeholders and presentation hints. Never part of the
/// fingerprint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayPolicy {
  /// Placeholder shown while the request is in flight.
  pub default_resource: Option<ResourceId>,
  /// Placeholder bound on failure.
  pub fail_resource: Option<ResourceId>,
  /// Background fill behind the bound image.
  pub background: Option<ResourceId>,
  pub default_scale: ScaleMode,
  pub fail_scale: ScaleMode,
  pub done_scale: ScaleMode,
  /// Ask the sink to animate the successful bind (e.g. fade-in).
  pub animate_on_success: bool,
}

/// Scheduling policy: which pool runs the task. Never part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PoolPolicy {
  /// The shared default pool (LIFO).
  #[default]
  Default,
  /// A caller-named pool, created lazily on first use and reused thereafter.
  Named {
    id: String,
    size: usize,
    ordering: PoolOrdering,
  },
}

/// Immutable description of desired transforms and request policy.
///
/// Constructed with chained `with_*` builders:
///
/// ```
/// use imagemill::attribute::{ImageAttributes, ResizeMode};
///
/// let attrs = ImageAttributes::new()
///   .with_resize(320, 240, ResizeMode::Crop)
///   .with_round_corners(8);
/// assert!(attrs.has_transforms());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAttributes {
  // Transform-affecting fields (fingerprinted).
  max_width: u32,
  max_height: u32,
  resize_width: u32,
  resize_height: u32,
  resize_mode: ResizeMode,
  round_pixels: u32,
  blend_overlay: Option<ResourceId>,
  blur_radius: u32,
  filter_id: u32,
  reflection: bool,
  high_quality: bool,

  // Policy fields (excluded from the fingerprint).
  pub display: DisplayPolicy,
  pub pool: PoolPolicy,
}

impl ImageAttributes {
  pub fn new() -> Self {
    Self::default()
  }

  /// Decode bounds: the decoder may subsample so the base image does not
  /// exceed these dimensions. `0` disables the bound.
  pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
    self.max_width = width;
    self.max_height = height;
    self
  }

  pub fn with_resize(mut self, width: u32, height: u32, mode: ResizeMode) -> Self {
    self.resize_width = width;
    self.resize_height = height;
    self.resize_mode = mode;
    self
  }

  /// Round-corner radius in output pixels (relative to the resized image,
  /// since resize runs first in the pipeline).
  pub fn with_round_corners(mut self, pixels: u32) -> Self {
    self.round_pixels = pixels;
    self
  }

  pub fn with_blend_overlay(mut self, overlay: ResourceId) -> Self {
    self.blend_overlay = Some(overlay);
    self
  }

  pub fn with_blur(mut self, radius: u32) -> Self {
    self.blur_radius = radius;
    self
  }

  /// Select a registered filter by id; `0` means none.
  pub fn with_filter(mut self, id: u32) -> Self {
    self.filter_id = id;
    self
  }

  pub fn with_reflection(mut self) -> Self {
    self.reflection = true;
    self
  }

  /// Keep full quality: disk payloads are written lossless (PNG, alpha
  /// preserved) instead of JPEG.
  pub fn with_high_quality(mut self) -> Self {
    self.high_quality = true;
    self
  }

  pub fn with_display(mut self, display: DisplayPolicy) -> Self {
    self.display = display;
    self
  }

  /// Run this request on a caller-named pool. An empty id falls back to the
  /// default pool.
  pub fn with_pool(mut self, id: impl Into<String>, size: usize, ordering: PoolOrdering) -> Self {
    let id = id.into();
    self.pool = if id.is_empty() {
      PoolPolicy::Default
    } else {
      PoolPolicy::Named { id, size, ordering }
    };
    self
  }

  pub fn max_size(&self) -> (u32, u32) {
    (self.max_width, self.max_height)
  }

  pub fn resize(&self) -> Option<(u32, u32, ResizeMode)> {
    if self.resize_width != 0 && self.resize_height != 0 {
      Some((self.resize_width, self.resize_height, self.resize_mode))
    } else {
      None
    }
  }

  pub fn round_pixels(&self) -> u32 {
    self.round_pixels
  }

  pub fn blend_overlay(&self) -> Option<ResourceId> {
    self.blend_overlay
  }

  pub fn blur_radius(&self) -> u32 {
    self.blur_radius
  }

  pub fn filter_id(&self) -> u32 {
    self.filter_id
  }

  pub fn reflection(&self) -> bool {
    self.reflection
  }

  pub fn high_quality(&self) -> bool {
    self.high_quality
  }

  /// True when any transform-affecting field differs from its default, i.e.
  /// the computed payload differs from the plain decoded source.
  pub fn has_transforms(&self) -> bool {
    self.fingerprint() != Self::default().fingerprint()
  }

  /// Deterministic encoding of every transform-affecting field.
  ///
  /// Structurally equal attribute sets produce identical fingerprints;
  /// display and scheduling policy are deliberately absent.
  pub fn fingerprint(&self) -> String {
    format!(
      "w{}h{}rw{}rh{}m{}c{}o{}u{}f{}e{}q{}",
      self.max_width,
      self.max_height,
      self.resize_width,
      self.resize_height,
      self.resize_mode.tag(),
      self.round_pixels,
      self.blend_overlay.map_or(0, |r| r.0),
      self.blur_radius,
      self.filter_id,
      u8::from(self.reflection),
      u8::from(self.high_quality),
    )
  }
}

/// Unique identity of a computed artifact: a SHA-256 digest over the locator
/// and the attribute fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Derive the key for `(locator, attrs)`. Deterministic and side-effect
  /// free; structurally equal inputs always yield identical keys.
  pub fn derive(locator: &SourceLocator, attrs: &ImageAttributes) -> Self {
    Self::from_fingerprint(locator, &attrs.fingerprint())
  }

  /// Key of the unmodified origin copy of `locator` (empty attribute set).
  pub fn origin(locator: &SourceLocator) -> Self {
    Self::derive(locator, &ImageAttributes::default())
  }

  pub(crate) fn from_fingerprint(locator: &SourceLocator, fingerprint: &str) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(locator.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for &b in digest.iter() {
      out.push(HEX[(b >> 4) as usize] as char);
      out.push(HEX[(b & 0x0f) as usize] as char);
    }
    Self(out)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}
