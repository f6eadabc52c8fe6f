//! End-to-end engine behavior: coalescing, tiered caching, stale-bind
//! suppression, and pool ordering.

use image::RgbaImage;
use imagemill::error::{FetchError, TransformError};
use imagemill::fetch::Fetcher;
use imagemill::sink::BufferSink;
use imagemill::{
  CacheKey, CompletionListener, ImageAttributes, ImageBuf, ImageEngine, ImageFilter,
  PoolOrdering, Sink, SourceLocator,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
  let img = image::RgbaImage::from_pixel(w, h, image::Rgba([50, 60, 70, 255]));
  let mut bytes = Vec::new();
  image::DynamicImage::ImageRgba8(img)
    .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
    .unwrap();
  bytes
}

/// Serves a fixed PNG; each call blocks until its locator is released.
/// Records fetch start order so queue discipline is observable.
struct GatedFetcher {
  bytes: Vec<u8>,
  calls: AtomicU32,
  state: Mutex<GateState>,
  cond: Condvar,
}

#[derive(Default)]
struct GateState {
  started: Vec<String>,
  released: HashMap<String, bool>,
  release_all: bool,
}

impl GatedFetcher {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      bytes: png_bytes(8, 8),
      calls: AtomicU32::new(0),
      state: Mutex::new(GateState::default()),
      cond: Condvar::new(),
    })
  }

  fn open() -> Arc<Self> {
    let fetcher = Self::new();
    fetcher.state.lock().unwrap().release_all = true;
    fetcher
  }

  fn release(&self, locator: &str) {
    let mut state = self.state.lock().unwrap();
    state.released.insert(locator.to_string(), true);
    drop(state);
    self.cond.notify_all();
  }

  fn wait_for_start(&self, locator: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut state = self.state.lock().unwrap();
    while !state.started.iter().any(|s| s == locator) {
      let remaining = deadline.saturating_duration_since(Instant::now());
      assert!(!remaining.is_zero(), "fetch of {locator} never started");
      let (next, _) = self.cond.wait_timeout(state, remaining).unwrap();
      state = next;
    }
  }

  fn started(&self) -> Vec<String> {
    self.state.lock().unwrap().started.clone()
  }
}

impl Fetcher for GatedFetcher {
  fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let raw = locator.as_str().to_string();
    let mut state = self.state.lock().unwrap();
    state.started.push(raw.clone());
    self.cond.notify_all();
    while !state.release_all && !state.released.get(&raw).copied().unwrap_or(false) {
      state = self.cond.wait(state).unwrap();
    }
    Ok(self.bytes.clone())
  }
}

fn engine(fetcher: Arc<GatedFetcher>, dir: &std::path::Path) -> ImageEngine {
  ImageEngine::builder()
    .cache_dir(dir)
    .fetcher(fetcher)
    .build()
    .unwrap()
}

/// Queue a request and get a channel that fires when its completion lands.
fn request_traced(
  engine: &ImageEngine,
  locator: &str,
  attrs: ImageAttributes,
  sink: Arc<BufferSink>,
) -> mpsc::Receiver<bool> {
  let (tx, rx) = mpsc::channel();
  let queued = engine
    .request_with_callback(locator, attrs, sink as Arc<dyn Sink>, move |_, result| {
      let _ = tx.send(result.is_some());
    })
    .unwrap();
  assert!(queued.is_none(), "expected an asynchronous completion");
  rx
}

#[test]
fn concurrent_requests_for_one_key_share_a_single_fetch() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::new();
  let engine = engine(fetcher.clone(), dir.path());
  let url = "https://example.com/shared.png";

  let sinks: Vec<Arc<BufferSink>> = (0..5).map(|_| Arc::new(BufferSink::new())).collect();
  let receivers: Vec<_> = sinks
    .iter()
    .map(|sink| request_traced(&engine, url, ImageAttributes::new(), sink.clone()))
    .collect();

  fetcher.wait_for_start(url);
  fetcher.release(url);

  for rx in receivers {
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
  }
  assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1, "watchers must share one task");
  for sink in sinks {
    assert_eq!(sink.bind_count(), 1);
    assert!(sink.last_image().is_some());
  }
}

#[test]
fn completed_payload_serves_later_requests_synchronously() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::open();
  let engine = engine(fetcher.clone(), dir.path());
  let url = "https://example.com/hit.png";

  let sink = Arc::new(BufferSink::new());
  request_traced(&engine, url, ImageAttributes::new(), sink)
    .recv_timeout(Duration::from_secs(5))
    .unwrap();

  let late = Arc::new(BufferSink::new());
  let hit = engine
    .request(url, ImageAttributes::new(), late.clone() as Arc<dyn Sink>)
    .unwrap();
  assert!(hit.is_some(), "memory tier should answer synchronously");
  assert_eq!(late.bind_count(), 1);
  assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn disk_tier_serves_after_memory_clear_without_refetch() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::open();
  let engine = engine(fetcher.clone(), dir.path());
  let url = "https://example.com/durable.png";

  let sink = Arc::new(BufferSink::new());
  request_traced(&engine, url, ImageAttributes::new(), sink)
    .recv_timeout(Duration::from_secs(5))
    .unwrap();

  engine.clear_memory();
  assert_eq!(engine.memory_bytes(), 0);

  let sink = Arc::new(BufferSink::new());
  let sync_hit = engine
    .request(url, ImageAttributes::new(), sink.clone() as Arc<dyn Sink>)
    .unwrap();
  assert!(sync_hit.is_none(), "disk is never consulted on the caller's thread");

  let deadline = Instant::now() + Duration::from_secs(5);
  while sink.bind_count() == 0 {
    assert!(Instant::now() < deadline, "disk-tier delivery never arrived");
    std::thread::sleep(Duration::from_millis(10));
  }
  assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn retargeted_sink_never_sees_the_stale_payload() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::new();
  let engine = engine(fetcher.clone(), dir.path());
  let old_url = "https://example.com/old.png";
  let new_url = "https://example.com/new.png";

  let sink = Arc::new(BufferSink::new());
  let old_rx = request_traced(&engine, old_url, ImageAttributes::new(), sink.clone());
  fetcher.wait_for_start(old_url);

  // The sink scrolls on to a different image while the first fetch hangs.
  let new_rx = request_traced(&engine, new_url, ImageAttributes::new(), sink.clone());
  fetcher.wait_for_start(new_url);
  fetcher.release(new_url);
  assert!(new_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  assert_eq!(sink.bind_count(), 1);

  fetcher.release(old_url);
  assert!(old_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  // The old payload completed fine (and is cached) but must not bind.
  assert_eq!(sink.bind_count(), 1, "stale bind leaked through");
}

#[test]
fn failed_fetch_counts_as_failure_not_panic() {
  struct Unreachable;
  impl Fetcher for Unreachable {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
      Err(FetchError::Unreachable {
        locator: locator.as_str().to_string(),
      })
    }
  }

  let dir = tempfile::tempdir().unwrap();
  let engine = ImageEngine::builder()
    .cache_dir(dir.path())
    .fetcher(Arc::new(Unreachable))
    .build()
    .unwrap();

  let sink = Arc::new(BufferSink::new());
  let rx = request_traced(&engine, "https://example.com/gone.png", ImageAttributes::new(), sink.clone());
  assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
  assert_eq!(sink.failure_count(), 1);
  assert_eq!(sink.bind_count(), 0);
}

#[test]
fn single_worker_lifo_pool_runs_newest_request_first() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::new();
  let engine = engine(fetcher.clone(), dir.path());
  let pool = |a: ImageAttributes| a.with_pool("serial", 1, PoolOrdering::Lifo);

  let blocker = "https://example.com/blocker.png";
  let first = "https://example.com/first.png";
  let second = "https://example.com/second.png";

  let sinks: Vec<Arc<BufferSink>> = (0..3).map(|_| Arc::new(BufferSink::new())).collect();
  let blocker_rx = request_traced(&engine, blocker, pool(ImageAttributes::new()), sinks[0].clone());
  fetcher.wait_for_start(blocker);

  // Both queue behind the blocked single worker.
  let first_rx = request_traced(&engine, first, pool(ImageAttributes::new()), sinks[1].clone());
  let second_rx = request_traced(&engine, second, pool(ImageAttributes::new()), sinks[2].clone());

  fetcher.release(blocker);
  blocker_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  fetcher.wait_for_start(second);
  fetcher.release(second);
  second_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  fetcher.release(first);
  first_rx.recv_timeout(Duration::from_secs(5)).unwrap();

  assert_eq!(
    fetcher.started(),
    vec![blocker.to_string(), second.to_string(), first.to_string()],
    "stack pools must service the newest request first"
  );
}

#[test]
fn panicking_filter_fails_every_watcher_and_frees_the_key() {
  struct Exploding;
  impl ImageFilter for Exploding {
    fn apply(&self, _img: RgbaImage) -> Result<RgbaImage, TransformError> {
      panic!("filter stage failed");
    }
  }
  struct Passthrough;
  impl ImageFilter for Passthrough {
    fn apply(&self, img: RgbaImage) -> Result<RgbaImage, TransformError> {
      Ok(img)
    }
  }

  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::new();
  let engine = engine(fetcher.clone(), dir.path());
  engine.register_filter(5, Arc::new(Exploding));
  engine.register_filter(6, Arc::new(Passthrough));
  let url = "https://example.com/crash.png";

  let first = Arc::new(BufferSink::new());
  let second = Arc::new(BufferSink::new());
  let first_rx = request_traced(&engine, url, ImageAttributes::new().with_filter(5), first.clone());
  fetcher.wait_for_start(url);
  // Attaches to the in-flight task before the panic lands.
  let second_rx = request_traced(&engine, url, ImageAttributes::new().with_filter(5), second.clone());
  fetcher.release(url);

  assert!(!first_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  assert!(!second_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  assert_eq!(first.failure_count(), 1);
  assert_eq!(second.failure_count(), 1);

  // The single filter-pool worker must have survived the panic.
  let sink = Arc::new(BufferSink::new());
  let ok_url = "https://example.com/fine.png";
  let ok_rx = request_traced(&engine, ok_url, ImageAttributes::new().with_filter(6), sink.clone());
  fetcher.wait_for_start(ok_url);
  fetcher.release(ok_url);
  assert!(ok_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  assert_eq!(sink.bind_count(), 1);
}

#[test]
fn listeners_observe_synchronous_memory_hits() {
  struct ChannelListener(Mutex<mpsc::Sender<bool>>);
  impl CompletionListener for ChannelListener {
    fn on_complete(&self, _key: &CacheKey, image: Option<&Arc<ImageBuf>>) {
      let _ = self.0.lock().unwrap().send(image.is_some());
    }
  }

  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::open();
  let engine = engine(fetcher.clone(), dir.path());
  let (tx, events) = mpsc::channel();
  engine.add_listener(Arc::new(ChannelListener(Mutex::new(tx))));
  let url = "https://example.com/observed.png";

  let sink = Arc::new(BufferSink::new());
  request_traced(&engine, url, ImageAttributes::new(), sink)
    .recv_timeout(Duration::from_secs(5))
    .unwrap();
  assert!(events.recv_timeout(Duration::from_secs(5)).unwrap());

  let late = Arc::new(BufferSink::new());
  let hit = engine
    .request(url, ImageAttributes::new(), late as Arc<dyn Sink>)
    .unwrap();
  assert!(hit.is_some(), "second request should hit the memory tier");
  assert!(
    events.recv_timeout(Duration::from_secs(5)).unwrap(),
    "memory hits must reach the listener list"
  );
}

#[test]
fn transform_attributes_key_separate_payloads() {
  let dir = tempfile::tempdir().unwrap();
  let fetcher = GatedFetcher::open();
  let engine = engine(fetcher.clone(), dir.path());
  let url = "https://example.com/variants.png";

  let plain = Arc::new(BufferSink::new());
  request_traced(&engine, url, ImageAttributes::new(), plain.clone())
    .recv_timeout(Duration::from_secs(5))
    .unwrap();

  let cropped = Arc::new(BufferSink::new());
  request_traced(
    &engine,
    url,
    ImageAttributes::new().with_resize(4, 4, imagemill::ResizeMode::Crop),
    cropped.clone(),
  )
  .recv_timeout(Duration::from_secs(5))
  .unwrap();

  assert_eq!(plain.last_image().unwrap().dimensions(), (8, 8));
  assert_eq!(cropped.last_image().unwrap().dimensions(), (4, 4));
}
