//! Worker pools and request classification
//!
//! Tasks run on a fixed set of named pools, each a handful of OS threads
//! pulling from a shared queue. Ordering is per-pool: the default pool is a
//! LIFO stack (the most recently submitted task runs first, which favors the
//! newest visible item during scroll), named pools choose LIFO or FIFO at
//! creation. Pools are created on demand and retained for the process
//! lifetime; there is no shutdown path in the core.

use crate::attribute::{ImageAttributes, PoolPolicy};
use crate::locator::SourceKind;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::warn;

/// Name of the shared default pool.
pub const DEFAULT_POOL: &str = "default";
/// Name of the pool reserved for filter-processing requests.
pub const FILTER_POOL: &str = "filters";
/// Name of the pool for local-file and local-video sources.
pub const LOCAL_POOL: &str = "local";
/// Name of the pool for content-provider sources.
pub const PROVIDER_POOL: &str = "provider";

const DEFAULT_POOL_SIZE: usize = 3;
const FILTER_POOL_SIZE: usize = 1;
const LOCAL_POOL_SIZE: usize = 3;
const PROVIDER_POOL_SIZE: usize = 2;

/// Queue discipline of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolOrdering {
  /// Stack: most recently submitted task is serviced first.
  #[default]
  Lifo,
  /// Queue: submission order is preserved.
  Fifo,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
  ordering: PoolOrdering,
  queue: Mutex<VecDeque<Job>>,
  available: Condvar,
}

/// A named execution pool backed by OS threads.
///
/// Workers block on a condvar when idle; `execute` never blocks beyond the
/// short queue lock. Dropping the handle does not stop the workers (pools
/// live for the process lifetime).
#[derive(Clone)]
pub struct WorkerPool {
  inner: Arc<PoolInner>,
  name: Arc<str>,
}

impl WorkerPool {
  /// Spawn a pool of `size` workers named `{name}-{i}`.
  pub fn new(name: &str, size: usize, ordering: PoolOrdering) -> Self {
    let inner = Arc::new(PoolInner {
      ordering,
      queue: Mutex::new(VecDeque::new()),
      available: Condvar::new(),
    });
    for i in 0..size.max(1) {
      let worker = Arc::clone(&inner);
      let builder = thread::Builder::new().name(format!("{name}-{i}"));
      // Spawn failure would only happen under resource exhaustion at startup;
      // remaining workers still drain the queue.
      let _ = builder.spawn(move || worker_loop(worker));
    }
    Self {
      inner,
      name: Arc::from(name),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn ordering(&self) -> PoolOrdering {
    self.inner.ordering
  }

  /// Enqueue a job according to the pool's ordering.
  pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
    let mut queue = self.inner.queue.lock().unwrap();
    queue.push_back(Box::new(job));
    drop(queue);
    self.inner.available.notify_one();
  }

  /// Number of jobs waiting for a worker (running jobs excluded).
  pub fn pending(&self) -> usize {
    self.inner.queue.lock().unwrap().len()
  }
}

fn worker_loop(inner: Arc<PoolInner>) {
  loop {
    let job = {
      let mut queue = inner.queue.lock().unwrap();
      loop {
        let next = match inner.ordering {
          PoolOrdering::Lifo => queue.pop_back(),
          PoolOrdering::Fifo => queue.pop_front(),
        };
        match next {
          Some(job) => break job,
          None => queue = inner.available.wait(queue).unwrap(),
        }
      }
    };
    // Contain panics so one bad job cannot take the worker with it.
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
      warn!(worker = ?thread::current().name(), "job panicked");
    }
  }
}

/// Registry of every pool the engine may dispatch to.
///
/// The fixed pools exist from construction; caller-named pools are created
/// lazily on first use and reused thereafter (the first declaration of a name
/// fixes its size and ordering).
pub struct PoolRegistry {
  default_pool: WorkerPool,
  filter_pool: WorkerPool,
  local_pool: WorkerPool,
  provider_pool: WorkerPool,
  named: Mutex<HashMap<String, WorkerPool>>,
}

impl PoolRegistry {
  pub fn new() -> Self {
    Self {
      default_pool: WorkerPool::new(DEFAULT_POOL, DEFAULT_POOL_SIZE, PoolOrdering::Lifo),
      filter_pool: WorkerPool::new(FILTER_POOL, FILTER_POOL_SIZE, PoolOrdering::Fifo),
      local_pool: WorkerPool::new(LOCAL_POOL, LOCAL_POOL_SIZE, PoolOrdering::Fifo),
      provider_pool: WorkerPool::new(PROVIDER_POOL, PROVIDER_POOL_SIZE, PoolOrdering::Fifo),
      named: Mutex::new(HashMap::new()),
    }
  }

  /// Pick the pool for a request. Classification priority:
  /// 1. filter-processing pool when the attribute set names a filter,
  /// 2. the local / content-provider pools for non-network sources,
  /// 3. a caller-named pool declared in the scheduling policy,
  /// 4. the shared default LIFO pool.
  pub fn select(&self, kind: SourceKind, attrs: &ImageAttributes) -> WorkerPool {
    if attrs.filter_id() != 0 {
      return self.filter_pool.clone();
    }
    match kind {
      SourceKind::LocalFile | SourceKind::LocalVideo => return self.local_pool.clone(),
      SourceKind::ContentProvider => return self.provider_pool.clone(),
      SourceKind::Network => {}
    }
    if let PoolPolicy::Named { id, size, ordering } = &attrs.pool {
      return self.named_pool(id, *size, *ordering);
    }
    self.default_pool.clone()
  }

  /// Fetch-or-create a caller-named pool.
  pub fn named_pool(&self, id: &str, size: usize, ordering: PoolOrdering) -> WorkerPool {
    let mut named = self.named.lock().unwrap();
    if let Some(pool) = named.get(id) {
      return pool.clone();
    }
    let pool = WorkerPool::new(id, size, ordering);
    named.insert(id.to_string(), pool.clone());
    pool
  }

  pub fn default_pool(&self) -> &WorkerPool {
    &self.default_pool
  }
}

impl Default for PoolRegistry {
  fn default() -> Self {
    Self::new()
  }
}
