//! Delivery targets and stale-bind suppression
//!
//! A [`Sink`] is whatever ultimately shows the image: a UI tile, a widget, a
//! test buffer. Sinks are recycled (a list cell scrolls to a new item while
//! its old request is still in flight), so every dispatch captures a
//! generation number at request time and checks it again at bind time. A
//! retargeted sink silently drops deliveries from earlier generations; the
//! old payload still lands in the cache.

use crate::payload::ImageBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A bind target for request results.
///
/// `bind` and `bind_failure` are invoked from the dispatcher thread, never
/// from the caller's thread, except on the synchronous memory-hit path.
pub trait Sink: Send + Sync {
  /// The generation currently shown by this sink.
  fn current_generation(&self) -> u64;

  /// Advance to a new generation and return it. Called once per request at
  /// dispatch time; anything still in flight for earlier generations
  /// becomes stale.
  fn retarget(&self) -> u64;

  /// The request was accepted and queued; `placeholder` is the display
  /// policy's default resource, if any.
  fn on_queued(&self, placeholder: Option<Arc<ImageBuf>>) {
    let _ = placeholder;
  }

  /// Deliver the final payload.
  fn bind(&self, image: Arc<ImageBuf>);

  /// The request failed; `placeholder` is the display policy's failure
  /// resource, if any.
  fn bind_failure(&self, placeholder: Option<Arc<ImageBuf>>);
}

/// A sink handle frozen at one generation.
///
/// The guard gates every delivery: once the sink retargets, deliveries
/// through older guards become no-ops. The check-and-bind pair is not atomic
/// with respect to a concurrent retarget; the window is the same one the
/// sink's own rendering has, and sinks must tolerate one late bind for the
/// generation they just left.
#[derive(Clone)]
pub struct BindingGuard {
  sink: Arc<dyn Sink>,
  generation: u64,
}

impl BindingGuard {
  /// Advance the sink to a fresh generation and bind this guard to it.
  pub fn acquire(sink: Arc<dyn Sink>) -> Self {
    let generation = sink.retarget();
    Self { sink, generation }
  }

  /// Guard an existing generation without advancing; used when one request
  /// fans out to watchers that were already retargeted.
  pub fn at_current(sink: Arc<dyn Sink>) -> Self {
    let generation = sink.current_generation();
    Self { sink, generation }
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Whether the sink still shows this guard's generation.
  pub fn is_still_valid(&self) -> bool {
    self.sink.current_generation() == self.generation
  }

  pub fn notify_queued(&self, placeholder: Option<Arc<ImageBuf>>) {
    if self.is_still_valid() {
      self.sink.on_queued(placeholder);
    }
  }

  /// Bind if still valid. Returns whether the delivery happened.
  pub fn deliver(&self, image: Arc<ImageBuf>) -> bool {
    if !self.is_still_valid() {
      return false;
    }
    self.sink.bind(image);
    true
  }

  /// Bind the failure placeholder if still valid.
  pub fn deliver_failure(&self, placeholder: Option<Arc<ImageBuf>>) -> bool {
    if !self.is_still_valid() {
      return false;
    }
    self.sink.bind_failure(placeholder);
    true
  }
}

#[derive(Default)]
struct BufferSinkState {
  last: Option<Arc<ImageBuf>>,
  failures: u32,
  binds: u32,
  queued: u32,
}

/// Sink that remembers its latest delivery; the reference implementation for
/// embedders and the workhorse of the test suite.
#[derive(Default)]
pub struct BufferSink {
  generation: AtomicU64,
  state: Mutex<BufferSinkState>,
}

impl BufferSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn last_image(&self) -> Option<Arc<ImageBuf>> {
    self.state.lock().unwrap().last.clone()
  }

  pub fn bind_count(&self) -> u32 {
    self.state.lock().unwrap().binds
  }

  pub fn failure_count(&self) -> u32 {
    self.state.lock().unwrap().failures
  }

  pub fn queued_count(&self) -> u32 {
    self.state.lock().unwrap().queued
  }
}

impl Sink for BufferSink {
  fn current_generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  fn retarget(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn on_queued(&self, _placeholder: Option<Arc<ImageBuf>>) {
    self.state.lock().unwrap().queued += 1;
  }

  fn bind(&self, image: Arc<ImageBuf>) {
    let mut state = self.state.lock().unwrap();
    state.last = Some(image);
    state.binds += 1;
  }

  fn bind_failure(&self, _placeholder: Option<Arc<ImageBuf>>) {
    self.state.lock().unwrap().failures += 1;
  }
}
