//! Error types for the offline subsystem.

use std::path::PathBuf;

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The database could not be opened or migrated (storage disabled, disk full, bad path).
  #[error("durable store unavailable at {}: {reason}", .path.display())]
  Unavailable {
    /// Where the database was expected.
    path: PathBuf,
    /// Why opening failed.
    reason: String,
  },

  /// A statement failed against an open database.
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// A persisted row could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  /// A queued mutation disappeared while it was being worked on.
  #[error("queued mutation {0} not found")]
  MissingMutation(i64),

  /// Another thread panicked while holding the connection.
  #[error("store connection lock poisoned")]
  Poisoned,
}

impl From<serde_json::Error> for StoreError {
  fn from(e: serde_json::Error) -> Self {
    StoreError::Corrupt(e.to_string())
  }
}

/// Errors surfaced to callers of the request gateway.
///
/// Connectivity failures that were absorbed (queued writes, stale reads) never
/// show up here.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  #[error(transparent)]
  Store(#[from] StoreError),

  /// The network was unreachable and there was nothing cached to fall back on.
  #[error("network unavailable: {0}")]
  Offline(String),

  /// The server answered a live call with a non-success status.
  #[error("server responded {status}: {body}")]
  Server { status: u16, body: String },

  /// The request could not be built or sent for a reason other than connectivity.
  #[error("request failed: {0}")]
  Request(String),
}

/// A persisted or user-supplied enum tag that does not name a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseTagError {
  pub kind: &'static str,
  pub value: String,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
