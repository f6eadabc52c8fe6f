//! Transform pipeline
//!
//! An attribute set compiles into an ordered list of stages which always run
//! in the same sequence: resize, blend, round corners, blur, filter,
//! reflection. Stage order is part of the cache contract; two requests with
//! equal fingerprints must produce byte-identical payloads, so the order is
//! fixed rather than caller-chosen.
//!
//! A stage failure aborts the whole pipeline; partially transformed payloads
//! are never cached or delivered.

use crate::attribute::{ImageAttributes, ResizeMode};
use crate::error::TransformError;
use crate::payload::ImageBuf;
use crate::resources::{PlatformResources, ResourceId};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A caller-registered per-pixel effect, selected by id through
/// [`ImageAttributes::with_filter`](crate::attribute::ImageAttributes::with_filter).
pub trait ImageFilter: Send + Sync {
  fn apply(&self, img: RgbaImage) -> Result<RgbaImage, TransformError>;
}

/// Registry mapping filter ids to implementations. Id `0` is reserved for
/// "no filter" and cannot be registered.
#[derive(Default)]
pub struct FilterRegistry {
  filters: Mutex<HashMap<u32, Arc<dyn ImageFilter>>>,
}

impl FilterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, id: u32, filter: Arc<dyn ImageFilter>) {
    if id == 0 {
      return;
    }
    self.filters.lock().unwrap().insert(id, filter);
  }

  pub fn get(&self, id: u32) -> Option<Arc<dyn ImageFilter>> {
    self.filters.lock().unwrap().get(&id).cloned()
  }
}

/// Shared collaborators a pipeline run needs: overlay resolution, filter
/// lookup, and the allocation budget.
pub struct TransformContext {
  pub resources: Arc<dyn PlatformResources>,
  pub filters: Arc<FilterRegistry>,
  /// Pixel budget for any stage output; `0` disables the check.
  pub max_pixels: u64,
}

impl TransformContext {
  fn ensure_budget(&self, stage: &'static str, width: u32, height: u32) -> Result<(), TransformError> {
    if self.max_pixels == 0 {
      return Ok(());
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > self.max_pixels {
      return Err(TransformError::OutOfMemory {
        stage,
        pixels,
        limit: self.max_pixels,
      });
    }
    Ok(())
  }
}

type StageFn = Box<dyn Fn(RgbaImage, &TransformContext) -> Result<RgbaImage, TransformError> + Send + Sync>;

struct Stage {
  name: &'static str,
  run: StageFn,
}

/// Ordered transform stages compiled from an attribute set.
pub struct TransformPipeline {
  stages: Vec<Stage>,
  /// Whether any stage introduces meaningful alpha (round corners,
  /// reflection); decides the disk encoding of the result.
  adds_alpha: bool,
}

impl TransformPipeline {
  pub fn from_attributes(attrs: &ImageAttributes) -> Self {
    let mut stages: Vec<Stage> = Vec::new();

    if let Some((width, height, mode)) = attrs.resize() {
      let high_quality = attrs.high_quality();
      stages.push(Stage {
        name: "resize",
        run: Box::new(move |img, ctx| resize_stage(img, ctx, width, height, mode, high_quality)),
      });
    }

    if let Some(overlay) = attrs.blend_overlay() {
      stages.push(Stage {
        name: "blend",
        run: Box::new(move |img, ctx| blend_stage(img, ctx, overlay)),
      });
    }

    if attrs.round_pixels() > 0 {
      let radius = attrs.round_pixels();
      stages.push(Stage {
        name: "round-corners",
        run: Box::new(move |img, _| Ok(round_corners(img, radius))),
      });
    }

    if attrs.blur_radius() > 0 {
      let radius = attrs.blur_radius();
      stages.push(Stage {
        name: "blur",
        run: Box::new(move |img, _| Ok(imageops::blur(&img, radius as f32))),
      });
    }

    if attrs.filter_id() != 0 {
      let id = attrs.filter_id();
      stages.push(Stage {
        name: "filter",
        run: Box::new(move |img, ctx| {
          let filter = ctx.filters.get(id).ok_or(TransformError::UnknownFilter { id })?;
          filter.apply(img)
        }),
      });
    }

    if attrs.reflection() {
      stages.push(Stage {
        name: "reflection",
        run: Box::new(|img, _| Ok(reflection(img))),
      });
    }

    Self {
      stages,
      adds_alpha: attrs.round_pixels() > 0 || attrs.reflection(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  /// Stage names in execution order.
  pub fn stage_names(&self) -> Vec<&'static str> {
    self.stages.iter().map(|s| s.name).collect()
  }

  /// Run every stage in order. Any failure aborts the run.
  pub fn apply(&self, input: ImageBuf, ctx: &TransformContext) -> Result<ImageBuf, TransformError> {
    let had_alpha = input.has_alpha();
    let mut pixels = input.into_pixels();
    for stage in &self.stages {
      pixels = (stage.run)(pixels, ctx)?;
    }
    Ok(ImageBuf::new(pixels, had_alpha || self.adds_alpha))
  }
}

fn resize_stage(
  img: RgbaImage,
  ctx: &TransformContext,
  target_w: u32,
  target_h: u32,
  mode: ResizeMode,
  high_quality: bool,
) -> Result<RgbaImage, TransformError> {
  let (w, h) = img.dimensions();
  if w == 0 || h == 0 {
    return Err(TransformError::Failed {
      stage: "resize",
      reason: "empty source image".to_string(),
    });
  }
  let filter = if high_quality { FilterType::Lanczos3 } else { FilterType::Triangle };

  let scale = match mode {
    // Landscape sources track the target width, portrait the target height.
    ResizeMode::Fit => {
      if w >= h {
        target_w as f64 / w as f64
      } else {
        target_h as f64 / h as f64
      }
    }
    ResizeMode::Expand | ResizeMode::Crop => {
      (target_w as f64 / w as f64).max(target_h as f64 / h as f64)
    }
  };

  let scaled_w = ((w as f64 * scale).round() as u32).max(1);
  let scaled_h = ((h as f64 * scale).round() as u32).max(1);
  ctx.ensure_budget("resize", scaled_w, scaled_h)?;
  // Already at the scaled dimensions; skip the resample pass.
  let scaled = if scaled_w == w && scaled_h == h {
    img
  } else {
    imageops::resize(&img, scaled_w, scaled_h, filter)
  };

  if mode == ResizeMode::Crop && (scaled_w != target_w || scaled_h != target_h) {
    let crop_w = target_w.min(scaled_w);
    let crop_h = target_h.min(scaled_h);
    let x = (scaled_w - crop_w) / 2;
    let y = (scaled_h - crop_h) / 2;
    return Ok(imageops::crop_imm(&scaled, x, y, crop_w, crop_h).to_image());
  }
  Ok(scaled)
}

fn blend_stage(
  mut img: RgbaImage,
  ctx: &TransformContext,
  overlay: ResourceId,
) -> Result<RgbaImage, TransformError> {
  let resource = ctx
    .resources
    .resolve(overlay)
    .ok_or(TransformError::MissingOverlay { id: overlay })?;
  let (bw, bh) = img.dimensions();
  let (ow, oh) = resource.dimensions();
  // Centered; the overlay keeps its own size.
  let x = i64::from(bw).saturating_sub(i64::from(ow)) / 2;
  let y = i64::from(bh).saturating_sub(i64::from(oh)) / 2;
  imageops::overlay(&mut img, resource.pixels(), x, y);
  Ok(img)
}

/// Clear the alpha of every pixel outside a quarter-circle of `radius` at
/// each corner.
fn round_corners(mut img: RgbaImage, radius: u32) -> RgbaImage {
  let (w, h) = img.dimensions();
  let r = radius.min(w / 2).min(h / 2);
  if r == 0 {
    return img;
  }
  let rf = r as f32;
  for y in 0..h {
    for x in 0..w {
      let cx = if x < r {
        Some(rf - 1.0 - x as f32)
      } else if x >= w - r {
        Some(x as f32 - (w - r) as f32)
      } else {
        None
      };
      let cy = if y < r {
        Some(rf - 1.0 - y as f32)
      } else if y >= h - r {
        Some(y as f32 - (h - r) as f32)
      } else {
        None
      };
      if let (Some(dx), Some(dy)) = (cx, cy) {
        if (dx + 1.0) * (dx + 1.0) + (dy + 1.0) * (dy + 1.0) > rf * rf {
          img.get_pixel_mut(x, y).0[3] = 0;
        }
      }
    }
  }
  img
}

/// Produce the mirrored reflection band: the bottom third of the source,
/// flipped vertically, fading out top to bottom. The band alone is the stage
/// output; compositing it under the original is the embedder's concern.
fn reflection(img: RgbaImage) -> RgbaImage {
  let (w, h) = img.dimensions();
  let band_h = (h / 3).max(1);
  let mut band = RgbaImage::new(w, band_h);
  for y in 0..band_h {
    // Mirrored: band row 0 is the source's bottom row.
    let src_y = h - 1 - y;
    let alpha = reflection_alpha(y, band_h);
    for x in 0..w {
      let Rgba([red, green, blue, a]) = *img.get_pixel(x, src_y);
      let faded = ((u16::from(a) * u16::from(alpha)) / 0xff) as u8;
      band.put_pixel(x, y, Rgba([red, green, blue, faded]));
    }
  }
  band
}

/// Two linear fade segments: 0x90 down to 0x30 over the top half of the
/// band, 0x30 down to 0 over the bottom half.
fn reflection_alpha(y: u32, band_h: u32) -> u8 {
  let half = (band_h / 2).max(1);
  if y < half {
    let t = y as f32 / half as f32;
    (0x90 as f32 - t * (0x90 - 0x30) as f32) as u8
  } else {
    let t = (y - half) as f32 / (band_h - half).max(1) as f32;
    (0x30 as f32 - t * 0x30 as f32) as u8
  }
}
