//! Records persisted in the durable store.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseTagError;
use crate::transport::{Headers, Method, OutboundRequest};

/// A response body captured from a successful read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
  pub url: String,
  pub payload: Value,
  pub captured_at: DateTime<Utc>,
  /// Owning entity (e.g. visit id) used for targeted invalidation.
  pub entity_id: Option<String>,
}

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Syncing,
  Failed,
  Completed,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationStatus::Pending => "pending",
      MutationStatus::Syncing => "syncing",
      MutationStatus::Failed => "failed",
      MutationStatus::Completed => "completed",
    }
  }
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationStatus {
  type Err = ParseTagError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(MutationStatus::Pending),
      "syncing" => Ok(MutationStatus::Syncing),
      "failed" => Ok(MutationStatus::Failed),
      "completed" => Ok(MutationStatus::Completed),
      _ => Err(ParseTagError {
        kind: "mutation status",
        value: s.to_string(),
      }),
    }
  }
}

impl ToSql for MutationStatus {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::from(self.as_str()))
  }
}

impl FromSql for MutationStatus {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    value
      .as_str()?
      .parse()
      .map_err(|e: ParseTagError| FromSqlError::Other(Box::new(e)))
  }
}

impl ToSql for Method {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::from(self.as_str()))
  }
}

impl FromSql for Method {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    value
      .as_str()?
      .parse()
      .map_err(|e: ParseTagError| FromSqlError::Other(Box::new(e)))
  }
}

/// A write captured while the network was unreachable, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
  pub method: Method,
  pub url: String,
  pub body: Option<Value>,
  pub headers: Headers,
  pub entity_id: Option<String>,
  /// Classification tag, the last path segment of the URL (e.g. "vitals").
  pub kind: String,
  pub created_at: DateTime<Utc>,
}

/// A write waiting in (or moving through) the replay queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub method: Method,
  pub url: String,
  pub body: Option<Value>,
  pub headers: Headers,
  pub entity_id: Option<String>,
  pub kind: String,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: MutationStatus,
  pub last_error: Option<String>,
}

impl QueuedMutation {
  /// Short human-readable label, e.g. "POST vitals (visit v1)".
  pub fn describe(&self) -> String {
    match &self.entity_id {
      Some(entity) => format!("{} {} (visit {})", self.method, self.kind, entity),
      None => format!("{} {}", self.method, self.kind),
    }
  }

  /// The request to replay, carrying the headers captured at enqueue time.
  pub fn to_request(&self) -> OutboundRequest {
    OutboundRequest {
      method: self.method,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Secondary-index filter for queue listings. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationFilter {
  pub status: Option<MutationStatus>,
  pub entity_id: Option<String>,
}

impl MutationFilter {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn with_status(status: MutationStatus) -> Self {
    Self {
      status: Some(status),
      entity_id: None,
    }
  }

  pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
    self.entity_id = Some(entity_id.into());
    self
  }
}

/// Per-status row counts of the mutation queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
  pub pending: usize,
  pub syncing: usize,
  pub failed: usize,
  pub completed: usize,
}

impl QueueCounts {
  /// Work that is still going to be attempted.
  pub fn outstanding(&self) -> usize {
    self.pending + self.syncing
  }

  pub fn total(&self) -> usize {
    self.pending + self.syncing + self.failed + self.completed
  }
}

/// Binary payload kept for offline use (e.g. captured audio).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
  pub id: String,
  pub data: Vec<u8>,
  pub mime_type: String,
  pub filename: Option<String>,
  pub entity_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

/// Read a millisecond timestamp column.
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
  let millis: i64 = row.get(idx)?;
  DateTime::from_timestamp_millis(millis).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      idx,
      Type::Integer,
      format!("timestamp out of range: {}", millis).into(),
    )
  })
}

/// Read a JSON text column.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
  let text: String = row.get(idx)?;
  serde_json::from_str(&text)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable JSON text column.
pub(crate) fn optional_json_column<T: DeserializeOwned>(
  row: &Row<'_>,
  idx: usize,
) -> rusqlite::Result<Option<T>> {
  let text: Option<String> = row.get(idx)?;
  text
    .map(|t| {
      serde_json::from_str(&t)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mutation(entity_id: Option<&str>) -> QueuedMutation {
    QueuedMutation {
      id: 7,
      method: Method::Post,
      url: "/api/visits/v1/vitals".into(),
      body: Some(serde_json::json!({"systolic": 160})),
      headers: Headers::new(),
      entity_id: entity_id.map(String::from),
      kind: "vitals".into(),
      created_at: Utc::now(),
      retry_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    }
  }

  #[test]
  fn test_status_round_trips_through_text() {
    for status in [
      MutationStatus::Pending,
      MutationStatus::Syncing,
      MutationStatus::Failed,
      MutationStatus::Completed,
    ] {
      assert_eq!(status.as_str().parse::<MutationStatus>().unwrap(), status);
    }
    assert!("done".parse::<MutationStatus>().is_err());
  }

  #[test]
  fn test_describe() {
    assert_eq!(mutation(Some("v1")).describe(), "POST vitals (visit v1)");
    assert_eq!(mutation(None).describe(), "POST vitals");
  }

  #[test]
  fn test_counts() {
    let counts = QueueCounts {
      pending: 2,
      syncing: 1,
      failed: 3,
      completed: 0,
    };
    assert_eq!(counts.outstanding(), 3);
    assert_eq!(counts.total(), 6);
  }
}
