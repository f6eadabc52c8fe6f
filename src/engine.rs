//! Request orchestration
//!
//! [`ImageEngine`] ties the tiers together: synchronous memory-cache hits on
//! the caller's thread, coalescing of concurrent requests for the same cache
//! key, task execution on the classified worker pool, and completion fan-out
//! through the dispatcher. The engine is a cheap `Clone` handle over shared
//! state.

use crate::attribute::{CacheKey, ImageAttributes};
use crate::cache::disk::{FsStorage, Storage};
use crate::cache::index::{IndexStore, JournalIndex};
use crate::cache::TieredCache;
use crate::decode::{DecodeOptions, Decoder, StdDecoder};
use crate::dispatch::{Callback, CompletionListener, Delivery, Dispatcher};
use crate::error::{DecodeError, Error, FetchError, Result, TransformError};
use crate::fetch::{Fetcher, SourceFetcher};
use crate::locator::{SourceKind, SourceLocator};
use crate::payload::ImageBuf;
use crate::resources::{PlatformResources, ResourceId, StaticResources};
use crate::scheduler::PoolRegistry;
use crate::sink::{BindingGuard, Sink};
use crate::transform::{FilterRegistry, ImageFilter, TransformContext, TransformPipeline};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Engine-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Memory tier budget in pixel-buffer bytes.
  pub memory_capacity_bytes: usize,
  /// Hard budget on decoded/transformed frame size, in pixels. Violations
  /// fail the request, never the process.
  pub max_decoded_pixels: u64,
  /// Keep a decoded copy of the unmodified origin so later requests with
  /// different transforms skip the fetch.
  pub cache_origin: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      memory_capacity_bytes: 32 * 1024 * 1024,
      max_decoded_pixels: 100_000_000,
      cache_origin: true,
    }
  }
}

/// Builder for [`ImageEngine`]. Collaborators not supplied explicitly fall
/// back to the stock implementations; a cache location (or explicit
/// storage + index pair) is the one required piece.
pub struct EngineBuilder {
  config: EngineConfig,
  cache_dir: Option<PathBuf>,
  fetcher: Option<Arc<dyn Fetcher>>,
  decoder: Option<Arc<dyn Decoder>>,
  storage: Option<Arc<dyn Storage>>,
  index: Option<Arc<dyn IndexStore>>,
  resources: Option<Arc<dyn PlatformResources>>,
}

impl EngineBuilder {
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Root directory for the disk tier (`payloads/` and `index/` beneath it).
  pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cache_dir = Some(dir.into());
    self
  }

  pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
    self.fetcher = Some(fetcher);
    self
  }

  pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
    self.decoder = Some(decoder);
    self
  }

  pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn index(mut self, index: Arc<dyn IndexStore>) -> Self {
    self.index = Some(index);
    self
  }

  pub fn resources(mut self, resources: Arc<dyn PlatformResources>) -> Self {
    self.resources = Some(resources);
    self
  }

  pub fn build(self) -> Result<ImageEngine> {
    let (storage, index): (Arc<dyn Storage>, Arc<dyn IndexStore>) =
      match (self.storage, self.index, &self.cache_dir) {
        (Some(storage), Some(index), _) => (storage, index),
        (storage, index, Some(dir)) => {
          let fs = match storage {
            Some(storage) => storage,
            None => Arc::new(
              FsStorage::open(dir.join("payloads")).map_err(|e| Error::Other(e.to_string()))?,
            ),
          };
          let journal = match index {
            Some(index) => index,
            None => Arc::new(JournalIndex::open(dir.join("index"))),
          };
          (fs, journal)
        }
        _ => {
          return Err(Error::Other(
            "engine needs a cache_dir or an explicit storage + index pair".to_string(),
          ))
        }
      };

    let shared = EngineShared {
      cache: TieredCache::new(self.config.memory_capacity_bytes, storage, index),
      config: self.config,
      fetcher: self.fetcher.unwrap_or_else(|| Arc::new(SourceFetcher::new())),
      decoder: self.decoder.unwrap_or_else(|| Arc::new(StdDecoder::new())),
      resources: self
        .resources
        .unwrap_or_else(|| Arc::new(StaticResources::new())),
      filters: Arc::new(FilterRegistry::new()),
      pools: PoolRegistry::new(),
      dispatcher: Dispatcher::new(),
      inflight: Mutex::new(HashMap::new()),
    };
    Ok(ImageEngine {
      shared: Arc::new(shared),
    })
  }
}

struct Watcher {
  guard: Option<BindingGuard>,
  callback: Option<Callback>,
  failure_placeholder: Option<Arc<ImageBuf>>,
}

/// Drains the in-flight watcher list on drop. A panic in a task body unwinds
/// through this, so the key is released and every watcher still gets a
/// failure completion instead of waiting on a dead task.
struct TaskCompletion<'a> {
  shared: &'a EngineShared,
  key: &'a CacheKey,
  result: Option<Arc<ImageBuf>>,
}

impl Drop for TaskCompletion<'_> {
  fn drop(&mut self) {
    self.shared.complete(self.key, self.result.take());
  }
}

struct EngineShared {
  config: EngineConfig,
  cache: TieredCache,
  fetcher: Arc<dyn Fetcher>,
  decoder: Arc<dyn Decoder>,
  resources: Arc<dyn PlatformResources>,
  filters: Arc<FilterRegistry>,
  pools: PoolRegistry,
  dispatcher: Dispatcher,
  /// At most one running task per cache key; later requesters attach here.
  inflight: Mutex<HashMap<CacheKey, Vec<Watcher>>>,
}

/// The image acquisition engine.
#[derive(Clone)]
pub struct ImageEngine {
  shared: Arc<EngineShared>,
}

impl ImageEngine {
  pub fn builder() -> EngineBuilder {
    EngineBuilder {
      config: EngineConfig::default(),
      cache_dir: None,
      fetcher: None,
      decoder: None,
      storage: None,
      index: None,
      resources: None,
    }
  }

  /// Request an image for a sink.
  ///
  /// On a memory-tier hit the image is bound synchronously on the calling
  /// thread and returned; otherwise the request is queued (coalescing with
  /// any in-flight task for the same key) and `Ok(None)` comes back
  /// immediately. The sink is retargeted exactly once, here, so anything
  /// previously in flight for it goes stale.
  pub fn request(
    &self,
    locator: &str,
    attrs: ImageAttributes,
    sink: Arc<dyn Sink>,
  ) -> Result<Option<Arc<ImageBuf>>> {
    self.submit(locator, attrs, Some(sink), None)
  }

  /// Like [`request`](Self::request), with a one-shot completion callback
  /// that fires after the bind attempt.
  pub fn request_with_callback(
    &self,
    locator: &str,
    attrs: ImageAttributes,
    sink: Arc<dyn Sink>,
    callback: impl FnOnce(&CacheKey, Option<Arc<ImageBuf>>) + Send + 'static,
  ) -> Result<Option<Arc<ImageBuf>>> {
    self.submit(locator, attrs, Some(sink), Some(Box::new(callback)))
  }

  /// Warm the cache without a sink.
  pub fn prefetch(&self, locator: &str, attrs: ImageAttributes) -> Result<()> {
    self.submit(locator, attrs, None, None).map(|_| ())
  }

  /// Blocking acquisition on the calling thread. Walks the same tiers as a
  /// queued request but returns errors directly instead of converging them
  /// to a failure delivery. Bypasses the coalescing registry.
  pub fn fetch_now(&self, locator: &str, attrs: ImageAttributes) -> Result<Arc<ImageBuf>> {
    let locator = SourceLocator::parse(locator)?;
    let key = CacheKey::derive(&locator, &attrs);
    if let Some((hit, _)) = self.shared.cache.lookup(&key) {
      return Ok(hit);
    }
    self.shared.compute(&locator, &attrs, &key)
  }

  /// Drop the memory tier. Disk payloads and the index survive.
  pub fn clear_memory(&self) {
    self.shared.cache.clear_memory();
  }

  pub fn memory_bytes(&self) -> usize {
    self.shared.cache.memory_bytes()
  }

  pub fn add_listener(&self, listener: Arc<dyn CompletionListener>) {
    self.shared.dispatcher.add_listener(listener);
  }

  /// Register a filter implementation under `id` (nonzero).
  pub fn register_filter(&self, id: u32, filter: Arc<dyn ImageFilter>) {
    self.shared.filters.register(id, filter);
  }

  fn submit(
    &self,
    locator: &str,
    attrs: ImageAttributes,
    sink: Option<Arc<dyn Sink>>,
    callback: Option<Callback>,
  ) -> Result<Option<Arc<ImageBuf>>> {
    let locator = SourceLocator::parse(locator)?;
    let key = CacheKey::derive(&locator, &attrs);
    let shared = &self.shared;

    let guard = sink.map(BindingGuard::acquire);

    // Memory tier only on the caller's thread; the guard was just acquired,
    // so the bind cannot be stale.
    if let Some(hit) = shared.cache.lookup_memory(&key) {
      if let Some(guard) = &guard {
        guard.deliver(Arc::clone(&hit));
      }
      if let Some(callback) = callback {
        callback(&key, Some(Arc::clone(&hit)));
      }
      // Sink and callback were already served on this thread; the listener
      // list still observes every completion, hits included.
      shared.dispatcher.dispatch(Delivery {
        key: key.clone(),
        image: Some(Arc::clone(&hit)),
        guard: None,
        failure_placeholder: None,
        callback: None,
      });
      return Ok(Some(hit));
    }

    if let Some(guard) = &guard {
      guard.notify_queued(shared.resolve_resource(attrs.display.default_resource));
    }

    let watcher = Watcher {
      guard,
      callback,
      failure_placeholder: shared.resolve_resource(attrs.display.fail_resource),
    };

    let mut inflight = shared.inflight.lock().unwrap();
    if let Some(watchers) = inflight.get_mut(&key) {
      // A task for this key is already running; share its result.
      watchers.push(watcher);
      debug!(key = %key, watchers = watchers.len(), "coalesced onto in-flight task");
      return Ok(None);
    }
    inflight.insert(key.clone(), vec![watcher]);
    drop(inflight);

    let pool = shared.pools.select(locator.kind(), &attrs);
    debug!(key = %key, locator = %locator, pool = pool.name(), "queued");
    let task_shared = Arc::clone(shared);
    pool.execute(move || task_shared.run_task(locator, attrs, key));
    Ok(None)
  }
}

impl EngineShared {
  fn resolve_resource(&self, id: Option<ResourceId>) -> Option<Arc<ImageBuf>> {
    id.and_then(|id| self.resources.resolve(id))
  }

  /// Task body. All failures, panics included, converge to a no-payload
  /// completion through the drop guard.
  fn run_task(&self, locator: SourceLocator, attrs: ImageAttributes, key: CacheKey) {
    let mut completion = TaskCompletion {
      shared: self,
      key: &key,
      result: None,
    };
    // Re-check the full tier stack: the disk tier was skipped on the
    // caller's thread, and another task may have finished since.
    completion.result = match self.cache.lookup(&key) {
      Some((hit, tier)) => {
        debug!(key = %key, ?tier, "task resolved from cache");
        Some(hit)
      }
      None => match self.compute(&locator, &attrs, &key) {
        Ok(img) => Some(img),
        Err(e) => {
          warn!(key = %key, locator = %locator, error = %e, "request failed");
          None
        }
      },
    };
  }

  /// Fetch, decode, transform, store. Shared by queued tasks and
  /// [`ImageEngine::fetch_now`].
  fn compute(
    &self,
    locator: &SourceLocator,
    attrs: &ImageAttributes,
    key: &CacheKey,
  ) -> Result<Arc<ImageBuf>> {
    let has_transforms = attrs.has_transforms();
    let origin_key = CacheKey::origin(locator);
    let (max_w, max_h) = attrs.max_size();
    let unbounded = max_w == 0 && max_h == 0;

    // Reuse the cached origin copy before going back to the source.
    let base = if has_transforms && self.config.cache_origin {
      self.cache.lookup(&origin_key).map(|(img, tier)| {
        debug!(key = %key, ?tier, "transform input from cached origin");
        img
      })
    } else {
      None
    };

    let base = match base {
      Some(base) => self.bound_base(&base, attrs),
      None => {
        if locator.kind() == SourceKind::Network && !self.fetcher.is_origin_reachable() {
          return Err(Error::Fetch(FetchError::Unreachable {
            locator: locator.as_str().to_string(),
          }));
        }
        let bytes = self.fetcher.fetch(locator)?;
        let opts = DecodeOptions {
          max_width: max_w,
          max_height: max_h,
          max_pixels: self.config.max_decoded_pixels,
          high_quality: attrs.high_quality(),
        };
        let decoded = self.decoder.decode(&bytes, &opts).map_err(|e| match e {
          // An over-budget frame is an allocation failure, not bad data.
          DecodeError::TooLarge { width, height, limit } => {
            Error::Transform(TransformError::OutOfMemory {
              stage: "decode",
              pixels: u64::from(width) * u64::from(height),
              limit,
            })
          }
          other => Error::Decode(other),
        })?;
        let decoded = Arc::new(decoded);
        // Persist the unmodified origin for future transform requests; only
        // an unbounded decode is a faithful origin copy.
        if has_transforms && self.config.cache_origin && unbounded {
          self.cache.store(
            &origin_key,
            locator.as_str(),
            &ImageAttributes::default().fingerprint(),
            Arc::clone(&decoded),
            attrs.high_quality(),
            true,
          );
        }
        decoded
      }
    };

    let result = if has_transforms {
      let pipeline = TransformPipeline::from_attributes(attrs);
      if pipeline.is_empty() {
        base
      } else {
        let ctx = TransformContext {
          resources: Arc::clone(&self.resources),
          filters: Arc::clone(&self.filters),
          max_pixels: self.config.max_decoded_pixels,
        };
        Arc::new(pipeline.apply((*base).clone(), &ctx)?)
      }
    } else {
      base
    };

    self.cache.store(
      key,
      locator.as_str(),
      &attrs.fingerprint(),
      Arc::clone(&result),
      attrs.high_quality(),
      true,
    );
    Ok(result)
  }

  /// Apply the decode bound to an origin copy pulled from cache, mirroring
  /// what the decoder would have done to fresh bytes.
  fn bound_base(&self, base: &Arc<ImageBuf>, attrs: &ImageAttributes) -> Arc<ImageBuf> {
    let (max_w, max_h) = attrs.max_size();
    let (w, h) = base.dimensions();
    let exceeds_w = max_w > 0 && w > max_w;
    let exceeds_h = max_h > 0 && h > max_h;
    if !exceeds_w && !exceeds_h {
      return Arc::clone(base);
    }
    let filter = if attrs.high_quality() {
      image::imageops::FilterType::Lanczos3
    } else {
      image::imageops::FilterType::Triangle
    };
    let target_w = if max_w > 0 { max_w } else { w };
    let target_h = if max_h > 0 { max_h } else { h };
    let bounded = image::DynamicImage::ImageRgba8(base.pixels().clone())
      .resize(target_w, target_h, filter)
      .into_rgba8();
    Arc::new(ImageBuf::new(bounded, base.has_alpha()))
  }

  /// Drain the watcher list for `key` and fan the result out. The payload is
  /// already in cache, so requests arriving from here on hit directly.
  fn complete(&self, key: &CacheKey, result: Option<Arc<ImageBuf>>) {
    let watchers = self
      .inflight
      .lock()
      .unwrap()
      .remove(key)
      .unwrap_or_default();
    debug!(key = %key, watchers = watchers.len(), ok = result.is_some(), "completing");
    for watcher in watchers {
      self.dispatcher.dispatch(Delivery {
        key: key.clone(),
        image: result.clone(),
        guard: watcher.guard,
        failure_placeholder: watcher.failure_placeholder,
        callback: watcher.callback,
      });
    }
  }
}
