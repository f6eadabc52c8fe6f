//! Completion dispatch
//!
//! All completions funnel through one consumer thread so sinks and listeners
//! observe deliveries in a single total order. Each delivery fires at most
//! once per channel: the sink bind (gated by the binding guard), the
//! per-request callback, and the global completion listeners. A stale guard
//! suppresses only the sink bind; callbacks and listeners still see the
//! result, since the computed payload is valid regardless of where the sink
//! is now pointing.

use crate::attribute::CacheKey;
use crate::payload::ImageBuf;
use crate::sink::BindingGuard;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

/// One-shot per-request completion callback. `None` means the request
/// failed; the error was already logged at its source.
pub type Callback = Box<dyn FnOnce(&CacheKey, Option<Arc<ImageBuf>>) + Send>;

/// Process-wide observer of every completion.
pub trait CompletionListener: Send + Sync {
  fn on_complete(&self, key: &CacheKey, image: Option<&Arc<ImageBuf>>);
}

/// A finished request on its way to its consumers.
pub struct Delivery {
  pub key: CacheKey,
  /// The payload, or `None` for a failed request.
  pub image: Option<Arc<ImageBuf>>,
  /// Bind target; `None` for fire-and-forget requests.
  pub guard: Option<BindingGuard>,
  /// Failure placeholder from the display policy, bound instead of a payload.
  pub failure_placeholder: Option<Arc<ImageBuf>>,
  pub callback: Option<Callback>,
}

/// Single-threaded completion fan-out.
#[derive(Clone)]
pub struct Dispatcher {
  tx: mpsc::Sender<Delivery>,
  listeners: Arc<Mutex<Vec<Arc<dyn CompletionListener>>>>,
}

impl Dispatcher {
  /// Spawn the consumer thread.
  pub fn new() -> Self {
    let (tx, rx) = mpsc::channel::<Delivery>();
    let listeners: Arc<Mutex<Vec<Arc<dyn CompletionListener>>>> = Arc::default();
    let thread_listeners = Arc::clone(&listeners);
    let builder = thread::Builder::new().name("dispatch".to_string());
    let _ = builder.spawn(move || {
      while let Ok(delivery) = rx.recv() {
        Self::consume(delivery, &thread_listeners);
      }
    });
    Self { tx, listeners }
  }

  pub fn add_listener(&self, listener: Arc<dyn CompletionListener>) {
    self.listeners.lock().unwrap().push(listener);
  }

  /// Queue a completion. Never blocks on the consumer.
  pub fn dispatch(&self, delivery: Delivery) {
    // The consumer lives for the process; a send failure means it is gone
    // and there is nobody left to deliver to.
    let _ = self.tx.send(delivery);
  }

  fn consume(delivery: Delivery, listeners: &Mutex<Vec<Arc<dyn CompletionListener>>>) {
    let Delivery {
      key,
      image,
      guard,
      failure_placeholder,
      callback,
    } = delivery;

    if let Some(guard) = guard {
      let delivered = match &image {
        Some(img) => guard.deliver(Arc::clone(img)),
        None => guard.deliver_failure(failure_placeholder),
      };
      if !delivered {
        debug!(key = %key, generation = guard.generation(), "sink retargeted, dropping stale bind");
      }
    }

    if let Some(callback) = callback {
      callback(&key, image.clone());
    }

    let listeners = listeners.lock().unwrap().clone();
    for listener in listeners {
      listener.on_complete(&key, image.as_ref());
    }
  }
}

impl Default for Dispatcher {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attribute::ImageAttributes;
  use crate::locator::SourceLocator;
  use crate::sink::{BufferSink, Sink};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn key() -> CacheKey {
    CacheKey::derive(
      &SourceLocator::parse("https://example.com/a.png").unwrap(),
      &ImageAttributes::new(),
    )
  }

  fn img() -> Arc<ImageBuf> {
    Arc::new(ImageBuf::solid(2, 2, [9, 9, 9, 255]))
  }

  struct CountingListener(AtomicU32);
  impl CompletionListener for CountingListener {
    fn on_complete(&self, _key: &CacheKey, _image: Option<&Arc<ImageBuf>>) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn success_reaches_sink_callback_and_listener() {
    let dispatcher = Dispatcher::new();
    let listener = Arc::new(CountingListener(AtomicU32::new(0)));
    dispatcher.add_listener(listener.clone());

    let sink = Arc::new(BufferSink::new());
    let guard = BindingGuard::acquire(sink.clone() as Arc<dyn Sink>);
    let (done_tx, done_rx) = mpsc::channel::<bool>();
    dispatcher.dispatch(Delivery {
      key: key(),
      image: Some(img()),
      guard: Some(guard),
      failure_placeholder: None,
      callback: Some(Box::new(move |_, result| {
        done_tx.send(result.is_some()).unwrap();
      })),
    });

    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(sink.bind_count(), 1);
    assert_eq!(listener.0.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn failure_binds_placeholder_path() {
    let dispatcher = Dispatcher::new();
    let sink = Arc::new(BufferSink::new());
    let guard = BindingGuard::acquire(sink.clone() as Arc<dyn Sink>);
    let (done_tx, done_rx) = mpsc::channel::<bool>();
    dispatcher.dispatch(Delivery {
      key: key(),
      image: None,
      guard: Some(guard),
      failure_placeholder: Some(img()),
      callback: Some(Box::new(move |_, result| {
        done_tx.send(result.is_some()).unwrap();
      })),
    });

    assert!(!done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(sink.failure_count(), 1);
    assert_eq!(sink.bind_count(), 0);
  }

  #[test]
  fn stale_guard_suppresses_only_the_bind() {
    let dispatcher = Dispatcher::new();
    let sink = Arc::new(BufferSink::new());
    let stale = BindingGuard::acquire(sink.clone() as Arc<dyn Sink>);
    sink.retarget();

    let (done_tx, done_rx) = mpsc::channel::<()>();
    dispatcher.dispatch(Delivery {
      key: key(),
      image: Some(img()),
      guard: Some(stale),
      failure_placeholder: None,
      callback: Some(Box::new(move |_, _| done_tx.send(()).unwrap())),
    });

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(sink.bind_count(), 0, "stale bind must not land");
  }
}
