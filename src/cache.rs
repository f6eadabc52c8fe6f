//! Tiered payload cache
//!
//! Lookups walk memory, then disk, then give up to the origin path. The
//! memory tier is a byte-budgeted LRU over decoded pixel buffers; the disk
//! tier persists encoded payloads under the durable index. Disk failures are
//! never fatal: a payload that cannot be read back is dropped from the index
//! and recomputed as if it had never been cached.

pub mod disk;
pub mod index;

use crate::attribute::CacheKey;
use crate::payload::ImageBuf;
use disk::Storage;
use index::IndexStore;
use lru::LruCache;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Byte-budgeted LRU over decoded payloads.
///
/// Capacity is enforced in pixel-buffer bytes (width x height x 4), not entry
/// count: one wallpaper-sized image costs what it actually occupies.
pub struct MemoryCache {
  entries: LruCache<CacheKey, Arc<ImageBuf>>,
  capacity_bytes: usize,
  total_bytes: usize,
}

impl MemoryCache {
  pub fn new(capacity_bytes: usize) -> Self {
    Self {
      entries: LruCache::unbounded(),
      capacity_bytes,
      total_bytes: 0,
    }
  }

  /// Get and promote to most recently used.
  pub fn get(&mut self, key: &CacheKey) -> Option<Arc<ImageBuf>> {
    self.entries.get(key).cloned()
  }

  /// Insert, then evict least-recently-used entries until the budget holds.
  /// An entry larger than the whole budget is evicted immediately after
  /// insertion, which still satisfies the in-flight request (the caller holds
  /// its own `Arc`). Evicted entries are returned so the owning tier can
  /// observe what fell out.
  pub fn insert(&mut self, key: CacheKey, img: Arc<ImageBuf>) -> Vec<(CacheKey, Arc<ImageBuf>)> {
    if let Some(old) = self.entries.put(key, Arc::clone(&img)) {
      self.total_bytes -= old.byte_size();
    }
    self.total_bytes += img.byte_size();
    let mut evicted = Vec::new();
    while self.total_bytes > self.capacity_bytes {
      let Some((evicted_key, entry)) = self.entries.pop_lru() else {
        break;
      };
      self.total_bytes -= entry.byte_size();
      evicted.push((evicted_key, entry));
    }
    evicted
  }

  pub fn remove(&mut self, key: &CacheKey) {
    if let Some(old) = self.entries.pop(key) {
      self.total_bytes -= old.byte_size();
    }
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.total_bytes = 0;
  }

  pub fn total_bytes(&self) -> usize {
    self.total_bytes
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Result of a tiered lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
  Memory,
  Disk,
}

/// Memory-over-disk cache with the durable index as the disk tier's source
/// of truth.
pub struct TieredCache {
  memory: Mutex<MemoryCache>,
  storage: Arc<dyn Storage>,
  index: Arc<dyn IndexStore>,
}

impl TieredCache {
  pub fn new(capacity_bytes: usize, storage: Arc<dyn Storage>, index: Arc<dyn IndexStore>) -> Self {
    Self {
      memory: Mutex::new(MemoryCache::new(capacity_bytes)),
      storage,
      index,
    }
  }

  /// Memory-tier-only lookup; never touches disk. This is the only lookup
  /// allowed on a caller's thread.
  pub fn lookup_memory(&self, key: &CacheKey) -> Option<Arc<ImageBuf>> {
    self.memory.lock().unwrap().get(key)
  }

  /// Full lookup: memory, then disk. A disk hit repopulates the memory tier.
  /// An index row whose payload is missing or unreadable is removed so the
  /// payload gets recomputed (self-healing).
  pub fn lookup(&self, key: &CacheKey) -> Option<(Arc<ImageBuf>, CacheTier)> {
    if let Some(hit) = self.lookup_memory(key) {
      return Some((hit, CacheTier::Memory));
    }

    self.index.find(key)?;
    let Some(bytes) = self.storage.read(key) else {
      warn!(key = %key, "indexed payload missing on disk, dropping index row");
      self.index.remove(key);
      return None;
    };
    let Some(img) = disk::decode_payload(&bytes) else {
      warn!(key = %key, "disk payload undecodable, dropping it");
      self.index.remove(key);
      self.storage.remove(key);
      return None;
    };

    let img = Arc::new(img);
    self.insert_memory(key.clone(), Arc::clone(&img));
    Some((img, CacheTier::Disk))
  }

  /// Store a computed payload in the memory tier and, when `persist` is set,
  /// in the disk tier. Disk failures are logged and leave the request
  /// unaffected; the index never names a payload that failed to write.
  pub fn store(
    &self,
    key: &CacheKey,
    locator: &str,
    fingerprint: &str,
    img: Arc<ImageBuf>,
    high_quality: bool,
    persist: bool,
  ) {
    self.insert_memory(key.clone(), Arc::clone(&img));
    if !persist {
      return;
    }
    let bytes = match disk::encode_payload(&img, high_quality) {
      Ok(bytes) => bytes,
      Err(reason) => {
        warn!(key = %key, %reason, "failed to encode payload for disk");
        return;
      }
    };
    if let Err(e) = self.storage.write(key, &bytes) {
      warn!(key = %key, reason = %e, "failed to persist payload");
      self.index.remove(key);
      return;
    }
    self.index.record(key, locator, fingerprint);
  }

  fn insert_memory(&self, key: CacheKey, img: Arc<ImageBuf>) {
    for (evicted_key, evicted) in self.memory.lock().unwrap().insert(key, img) {
      debug!(key = %evicted_key, bytes = evicted.byte_size(), "evicted from memory tier");
    }
  }

  /// Drop every memory-tier entry. Disk rows are untouched.
  pub fn clear_memory(&self) {
    self.memory.lock().unwrap().clear();
  }

  pub fn memory_bytes(&self) -> usize {
    self.memory.lock().unwrap().total_bytes()
  }
}
