//! Error taxonomy for the sync layer.
//!
//! Callers match on these variants to drive behavior: connectivity
//! failures flip the client offline, application errors carry the
//! remote-supplied message verbatim, and cache corruption is recovered
//! internally and never escapes the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// Network unreachable, DNS failure, request timeout, or a 5xx/429
  /// that survived every retry attempt.
  #[error("Rally is unreachable: {0}")]
  Connectivity(String),

  /// The remote reported an error in its response envelope (validation,
  /// auth, not-found). The message is passed through unmodified.
  #[error("{0}")]
  Application(String),

  /// A local cache file was malformed or could not be read or written.
  /// Recovered internally (offending files deleted, cache treated as
  /// empty); never propagated past the synchronizing client.
  #[error("cache corrupted: {0}")]
  CacheCorruption(String),

  /// The client is offline; mutations are rejected without network I/O
  /// until a refresh succeeds.
  #[error("unavailable while offline")]
  Offline,

  /// Missing or invalid configuration (config file, API key).
  #[error("{0}")]
  Config(String),
}

impl Error {
  /// Failures in this class trip the offline state and are eligible for
  /// retry with backoff.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Error::Connectivity(_))
  }

  pub fn is_offline(&self) -> bool {
    matches!(self, Error::Offline)
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() || e.is_connect() {
      Error::Connectivity(e.to_string())
    } else if e.is_decode() {
      Error::Application(format!("malformed response: {}", e))
    } else {
      Error::Connectivity(e.to_string())
    }
  }
}
