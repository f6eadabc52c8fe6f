//! Origin fetching
//!
//! [`Fetcher`] turns a [`SourceLocator`] into raw origin bytes. The default
//! [`SourceFetcher`] handles network URLs over HTTP(S) with redirects and a
//! response size cap, reads `file://` paths from the filesystem, and delegates
//! `content://` and `video://` locators to embedder-registered
//! [`SourceProvider`] hooks. Custom implementations (mocks, offline modes,
//! rate limiters) plug in through the trait.

use crate::error::FetchError;
use crate::locator::{SourceKind, SourceLocator};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default User-Agent header for network fetches.
pub const DEFAULT_USER_AGENT: &str = "imagemill/0.1";

/// Default cap on response body size (bytes).
pub const DEFAULT_MAX_SIZE: usize = 50 * 1024 * 1024;

const MAX_REDIRECTS: usize = 10;

/// Fetches the raw bytes behind a locator.
///
/// Implementations must be `Send + Sync`; a fetch runs on a worker pool thread
/// and may block.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError>;

  /// Fast connectivity hint checked before a network fetch is attempted.
  /// Offline-aware implementations return `false` to fail requests without
  /// tying up a pool slot on a doomed connect.
  fn is_origin_reachable(&self) -> bool {
    true
  }
}

impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
  fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
    (**self).fetch(locator)
  }

  fn is_origin_reachable(&self) -> bool {
    (**self).is_origin_reachable()
  }
}

/// Embedder hook resolving a non-network source to its encoded bytes.
///
/// Registered per source kind: one provider may serve `content://` entries
/// (gallery rows, thumbnail stores), another `video://` locators (first-frame
/// extraction). The path passed in has its scheme prefix already stripped.
pub trait SourceProvider: Send + Sync {
  fn open(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

/// Default fetcher: HTTP(S) for network locators, filesystem for `file://`,
/// registered providers for the rest.
#[derive(Clone)]
pub struct SourceFetcher {
  timeout: Duration,
  user_agent: String,
  max_size: usize,
  content_provider: Option<Arc<dyn SourceProvider>>,
  video_provider: Option<Arc<dyn SourceProvider>>,
}

impl SourceFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  /// Cap on response body size; larger bodies fail with
  /// [`FetchError::TooLarge`].
  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }

  /// Register the hook serving `content://` locators.
  pub fn with_content_provider(mut self, provider: Arc<dyn SourceProvider>) -> Self {
    self.content_provider = Some(provider);
    self
  }

  /// Register the hook serving `video://` locators.
  pub fn with_video_provider(mut self, provider: Arc<dyn SourceProvider>) -> Self {
    self.video_provider = Some(provider);
    self
  }

  fn fetch_http(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
    let config = ureq::Agent::config_builder()
      .timeout_global(Some(self.timeout))
      .build();
    let agent: ureq::Agent = config.into();

    let mut current = locator.as_str().to_string();
    for _ in 0..MAX_REDIRECTS {
      let mut response = agent
        .get(&current)
        .header("User-Agent", &self.user_agent)
        .call()
        .map_err(|e| FetchError::Unreachable {
          locator: format!("{locator} ({e})"),
        })?;

      let status = response.status();
      if (300..400).contains(&status.as_u16()) {
        if let Some(loc) = response.headers().get("location").and_then(|h| h.to_str().ok()) {
          current = Url::parse(&current)
            .ok()
            .and_then(|base| base.join(loc).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| loc.to_string());
          continue;
        }
      }

      let bytes = response
        .body_mut()
        .with_config()
        .limit(self.max_size as u64)
        .read_to_vec()
        .map_err(|e| match e {
          ureq::Error::BodyExceedsLimit(_) => FetchError::TooLarge {
            locator: locator.as_str().to_string(),
            limit: self.max_size,
          },
          other => FetchError::Io {
            locator: locator.as_str().to_string(),
            reason: other.to_string(),
          },
        })?;
      if bytes.is_empty() {
        return Err(FetchError::Io {
          locator: locator.as_str().to_string(),
          reason: "empty response body".to_string(),
        });
      }
      return Ok(bytes);
    }

    Err(FetchError::Io {
      locator: locator.as_str().to_string(),
      reason: "too many redirects".to_string(),
    })
  }

  fn fetch_file(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
    std::fs::read(locator.path()).map_err(|e| FetchError::Io {
      locator: locator.as_str().to_string(),
      reason: e.to_string(),
    })
  }

  fn fetch_provider(
    &self,
    provider: Option<&Arc<dyn SourceProvider>>,
    locator: &SourceLocator,
  ) -> Result<Vec<u8>, FetchError> {
    let provider = provider.ok_or_else(|| FetchError::MissingProvider {
      locator: locator.as_str().to_string(),
    })?;
    provider.open(locator.path()).map_err(|e| FetchError::Io {
      locator: locator.as_str().to_string(),
      reason: e.to_string(),
    })
  }
}

impl Default for SourceFetcher {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      user_agent: DEFAULT_USER_AGENT.to_string(),
      max_size: DEFAULT_MAX_SIZE,
      content_provider: None,
      video_provider: None,
    }
  }
}

impl Fetcher for SourceFetcher {
  fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
    match locator.kind() {
      SourceKind::Network => self.fetch_http(locator),
      SourceKind::LocalFile => self.fetch_file(locator),
      SourceKind::ContentProvider => self.fetch_provider(self.content_provider.as_ref(), locator),
      SourceKind::LocalVideo => self.fetch_provider(self.video_provider.as_ref(), locator),
    }
  }
}
