//! Error types for imagemill
//!
//! Each subsystem gets its own error enum (fetch, decode, transform) wrapped by
//! the top-level [`Error`]. Every variant is `Clone`: a single task result is
//! fanned out to all coalesced watchers of the same cache key, so errors carry
//! string payloads rather than non-clonable sources such as `std::io::Error`.

use thiserror::Error;

/// Result type alias for imagemill operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// No error ever crosses a task boundary back to the original caller; task
/// failures converge to a "no payload" completion delivered through the normal
/// dispatcher channels. `Error` values surface synchronously only for caller
/// contract violations ([`Error::InvalidRequest`]) and from the blocking
/// [`fetch_now`](crate::engine::ImageEngine::fetch_now) path.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// The request itself is malformed (empty locator). Rejected synchronously;
  /// no task is created.
  #[error("invalid request: {reason}")]
  InvalidRequest { reason: String },

  /// Origin fetch failed.
  #[error("fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// Source bytes could not be decoded.
  #[error("decode error: {0}")]
  Decode(#[from] DecodeError),

  /// A pipeline stage failed; the whole pipeline is aborted, never partial.
  #[error("transform error: {0}")]
  Transform(#[from] TransformError),

  /// Generic error for miscellaneous issues.
  #[error("{0}")]
  Other(String),
}

/// Errors from the origin fetch (network, local file, content provider).
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// The origin is not reachable at all (offline, no provider registered).
  #[error("origin unreachable for '{locator}'")]
  Unreachable { locator: String },

  /// I/O failure while reading the origin stream.
  #[error("failed to read '{locator}': {reason}")]
  Io { locator: String, reason: String },

  /// No content provider was registered for a `content://` locator.
  #[error("no content provider registered (locator '{locator}')")]
  MissingProvider { locator: String },

  /// The response body exceeded the configured size limit.
  #[error("response for '{locator}' exceeds {limit} bytes")]
  TooLarge { locator: String, limit: usize },
}

/// Errors from decoding origin bytes into a pixel buffer.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
  /// The byte stream is not a recognized image format.
  #[error("unsupported image format: {reason}")]
  UnsupportedFormat { reason: String },

  /// The byte stream is recognized but corrupt or truncated.
  #[error("malformed image data: {reason}")]
  Malformed { reason: String },

  /// Decoded dimensions exceed the configured pixel budget. Converted to
  /// [`TransformError::OutOfMemory`] at the task level.
  #[error("image {width}x{height} exceeds the {limit} pixel budget")]
  TooLarge { width: u32, height: u32, limit: u64 },
}

/// Errors from the transform pipeline.
#[derive(Error, Debug, Clone)]
pub enum TransformError {
  /// A stage would allocate beyond the configured pixel budget. Recoverable
  /// per-request; never terminates a worker or the process.
  #[error("transform '{stage}' needs {pixels} pixels, budget is {limit}")]
  OutOfMemory {
    stage: &'static str,
    pixels: u64,
    limit: u64,
  },

  /// The attribute set names a filter id with no registered implementation.
  #[error("no filter registered for id {id}")]
  UnknownFilter { id: u32 },

  /// The blend stage could not resolve its overlay resource.
  #[error("no overlay resource for id {id:?}")]
  MissingOverlay { id: crate::resources::ResourceId },

  /// Any other stage failure.
  #[error("transform '{stage}' failed: {reason}")]
  Failed { stage: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn errors_are_cloneable_and_display() {
    let err = Error::Fetch(FetchError::Io {
      locator: "https://example.com/a.png".to_string(),
      reason: "connection reset".to_string(),
    });
    let copy = err.clone();
    assert!(copy.to_string().contains("connection reset"));
  }

  #[test]
  fn invalid_request_mentions_reason() {
    let err = Error::InvalidRequest {
      reason: "empty locator".to_string(),
    };
    assert_eq!(err.to_string(), "invalid request: empty locator");
  }
}
