//! Source locators
//!
//! A [`SourceLocator`] is the opaque string identifying where an image comes
//! from. The origin class is derived from a prefix convention: `file://` for
//! local files, `content://` for content-provider entries, `video://` for
//! local video frames, anything else is treated as a network URL.

use crate::error::{Error, Result};

/// Prefix marking a local file source.
pub const LOCAL_FILE_PREFIX: &str = "file://";
/// Prefix marking a content-provider source.
pub const CONTENT_PROVIDER_PREFIX: &str = "content://";
/// Prefix marking a local-video source (first frame extraction).
pub const LOCAL_VIDEO_PREFIX: &str = "video://";

/// Origin class of a locator, used for pool selection and fetch dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
  Network,
  LocalFile,
  ContentProvider,
  LocalVideo,
}

/// An opaque, validated source identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocator {
  raw: String,
  kind: SourceKind,
}

impl SourceLocator {
  /// Parse a raw locator string.
  ///
  /// An empty (or all-whitespace) locator is a caller contract violation and
  /// is rejected synchronously with [`Error::InvalidRequest`].
  pub fn parse(raw: impl Into<String>) -> Result<Self> {
    let raw = raw.into();
    if raw.trim().is_empty() {
      return Err(Error::InvalidRequest {
        reason: "empty locator".to_string(),
      });
    }
    let kind = if raw.starts_with(LOCAL_FILE_PREFIX) {
      SourceKind::LocalFile
    } else if raw.starts_with(CONTENT_PROVIDER_PREFIX) {
      SourceKind::ContentProvider
    } else if raw.starts_with(LOCAL_VIDEO_PREFIX) {
      SourceKind::LocalVideo
    } else {
      SourceKind::Network
    };
    Ok(Self { raw, kind })
  }

  /// The raw locator string, prefix included.
  pub fn as_str(&self) -> &str {
    &self.raw
  }

  /// Origin class derived from the prefix.
  pub fn kind(&self) -> SourceKind {
    self.kind
  }

  /// The locator with its scheme prefix stripped (filesystem path, provider
  /// id, ...). Network locators are returned unchanged.
  pub fn path(&self) -> &str {
    match self.kind {
      SourceKind::LocalFile => &self.raw[LOCAL_FILE_PREFIX.len()..],
      SourceKind::ContentProvider => &self.raw[CONTENT_PROVIDER_PREFIX.len()..],
      SourceKind::LocalVideo => &self.raw[LOCAL_VIDEO_PREFIX.len()..],
      SourceKind::Network => &self.raw,
    }
  }

  /// True for sources served from the local machine (file, provider, video),
  /// which are isolated from slower network fetches by pool selection.
  pub fn is_local(&self) -> bool {
    !matches!(self.kind, SourceKind::Network)
  }
}

impl std::fmt::Display for SourceLocator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.raw)
  }
}
