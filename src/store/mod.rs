//! Durable store for offline operation.
//!
//! One SQLite database holds three independent collections:
//! - `response_cache`: last successful payload per URL
//! - `mutation_queue`: writes waiting to be replayed, indexed by status,
//!   owning entity and creation time
//! - `blob_store`: caller-keyed binary payloads
//!
//! The database is opened lazily by the first operation. Concurrent first
//! callers share one open attempt; a failed attempt is not remembered, so the
//! next call tries again. Every operation runs in its own transaction.

mod blobs;
mod cache;
mod queue;
mod records;

pub use records::{
  CachedResponse, MutationFilter, MutationStatus, NewMutation, QueueCounts, QueuedMutation,
  StoredBlob,
};

use rusqlite::{Connection, Transaction};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::error::{StoreError, StoreResult};

/// Bump when `SCHEMA` changes.
const SCHEMA_VERSION: i32 = 1;

/// Schema for the offline database.
const SCHEMA: &str = r#"
-- Last successful response per URL
CREATE TABLE IF NOT EXISTS response_cache (
    url TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    entity_id TEXT
);

-- Writes waiting for replay
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL,
    entity_id TEXT,
    kind TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_status ON mutation_queue(status);
CREATE INDEX IF NOT EXISTS idx_mutation_queue_entity ON mutation_queue(entity_id);
CREATE INDEX IF NOT EXISTS idx_mutation_queue_created ON mutation_queue(created_at);

-- Binary payloads
CREATE TABLE IF NOT EXISTS blob_store (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    filename TEXT,
    entity_id TEXT,
    created_at INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone)]
enum Location {
  File(PathBuf),
  Memory,
}

impl Location {
  fn display_path(&self) -> PathBuf {
    match self {
      Location::File(path) => path.clone(),
      Location::Memory => PathBuf::from(":memory:"),
    }
  }
}

struct StoreInner {
  location: Location,
  conn: OnceCell<Mutex<Connection>>,
}

/// Shared handle to the offline database. Clones refer to the same connection.
#[derive(Clone)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  /// A store backed by the database file at `path`. Nothing is opened yet.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self::with_location(Location::File(path.into()))
  }

  /// A private in-memory database, gone when the last clone is dropped.
  pub fn in_memory() -> Self {
    Self::with_location(Location::Memory)
  }

  fn with_location(location: Location) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        location,
        conn: OnceCell::new(),
      }),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Unavailable {
        path: PathBuf::from("offline.db"),
        reason: "could not determine data directory".into(),
      })?;

    Ok(data_dir.join("cairn").join("offline.db"))
  }

  pub fn path(&self) -> PathBuf {
    self.inner.location.display_path()
  }

  pub fn is_open(&self) -> bool {
    self.inner.conn.initialized()
  }

  /// Open the database now instead of on first use.
  pub async fn ensure_open(&self) -> StoreResult<()> {
    self.connection().await.map(|_| ())
  }

  async fn connection(&self) -> StoreResult<&Mutex<Connection>> {
    self
      .inner
      .conn
      .get_or_try_init(|| async { self.open_connection() })
      .await
  }

  fn open_connection(&self) -> StoreResult<Mutex<Connection>> {
    let location = &self.inner.location;
    let unavailable = |reason: String| StoreError::Unavailable {
      path: location.display_path(),
      reason,
    };

    let conn = match location {
      Location::File(path) => {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
          std::fs::create_dir_all(parent)
            .map_err(|e| unavailable(format!("failed to create directory: {}", e)))?;
        }
        let conn = Connection::open(path).map_err(|e| unavailable(e.to_string()))?;
        conn
          .query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
          .map_err(|e| unavailable(e.to_string()))?;
        conn
      }
      Location::Memory => Connection::open_in_memory().map_err(|e| unavailable(e.to_string()))?,
    };

    run_migrations(&conn).map_err(|e| {
      error!(path = %location.display_path().display(), error = %e, "store migration failed");
      unavailable(format!("migration failed: {}", e))
    })?;

    info!(path = %location.display_path().display(), "opened offline store");
    Ok(Mutex::new(conn))
  }

  /// Run `f` inside its own transaction, committing on success.
  pub(crate) async fn transact<T, F>(&self, f: F) -> StoreResult<T>
  where
    F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send,
    T: Send,
  {
    let cell = self.connection().await?;
    let mut conn = cell.lock().map_err(|_| StoreError::Poisoned)?;
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
  }
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Store")
      .field("path", &self.path())
      .field("open", &self.is_open())
      .finish()
  }
}

/// Run database migrations.
fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
  let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
  if version < SCHEMA_VERSION {
    debug!(from = version, to = SCHEMA_VERSION, "migrating offline store");
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
  }
  Ok(())
}
