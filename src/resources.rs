//! Embedder-resolved resources
//!
//! Placeholder, failure, and blend-overlay images are referenced by opaque ids
//! and resolved through the [`PlatformResources`] capability supplied by the
//! embedding application. The core never names a platform resource type.

use crate::payload::ImageBuf;
use std::sync::Arc;

/// Opaque identifier for an embedder-provided resource (placeholder image,
/// blend overlay, background fill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl std::fmt::Display for ResourceId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "res:{}", self.0)
  }
}

/// Resolves built-in images by id.
///
/// Consulted only when an attribute set references a resource (blend overlay,
/// default/failure placeholder). Implementations must be cheap to call; the
/// engine does not cache resolutions.
pub trait PlatformResources: Send + Sync {
  /// Resolve a resource id to a decoded image, or `None` if unknown.
  fn resolve(&self, id: ResourceId) -> Option<Arc<ImageBuf>>;
}

/// Resource table backed by a plain map; convenient for embedders and tests.
#[derive(Default)]
pub struct StaticResources {
  entries: std::collections::HashMap<ResourceId, Arc<ImageBuf>>,
}

impl StaticResources {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, id: ResourceId, image: ImageBuf) {
    self.entries.insert(id, Arc::new(image));
  }
}

impl PlatformResources for StaticResources {
  fn resolve(&self, id: ResourceId) -> Option<Arc<ImageBuf>> {
    self.entries.get(&id).cloned()
  }
}
