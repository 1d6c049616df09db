//! Mutation queue collection.

use rusqlite::{params, OptionalExtension, Row};

use super::records::{
  json_column, optional_json_column, time_column, to_millis, MutationFilter, MutationStatus,
  NewMutation, QueueCounts, QueuedMutation,
};
use super::Store;
use crate::error::{StoreError, StoreResult};

const MUTATION_COLUMNS: &str = "id, method, url, body, headers, entity_id, kind, created_at, \
   retry_count, status, last_error";

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedMutation> {
  Ok(QueuedMutation {
    id: row.get(0)?,
    method: row.get(1)?,
    url: row.get(2)?,
    body: optional_json_column(row, 3)?,
    headers: json_column(row, 4)?,
    entity_id: row.get(5)?,
    kind: row.get(6)?,
    created_at: time_column(row, 7)?,
    retry_count: row.get(8)?,
    status: row.get(9)?,
    last_error: row.get(10)?,
  })
}

impl Store {
  /// Persist a new `pending` mutation and return it with its assigned id.
  pub async fn enqueue(&self, mutation: NewMutation) -> StoreResult<QueuedMutation> {
    let body = mutation
      .body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;
    let headers = serde_json::to_string(&mutation.headers)?;

    let id = self
      .transact(|tx| {
        tx.execute(
          "INSERT INTO mutation_queue
             (method, url, body, headers, entity_id, kind, created_at, retry_count, status)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
          params![
            mutation.method,
            mutation.url,
            body,
            headers,
            mutation.entity_id,
            mutation.kind,
            to_millis(mutation.created_at),
            MutationStatus::Pending,
          ],
        )?;
        Ok(tx.last_insert_rowid())
      })
      .await?;

    Ok(QueuedMutation {
      id,
      method: mutation.method,
      url: mutation.url,
      body: mutation.body,
      headers: mutation.headers,
      entity_id: mutation.entity_id,
      kind: mutation.kind,
      created_at: mutation.created_at,
      retry_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    })
  }

  pub async fn mutation(&self, id: i64) -> StoreResult<Option<QueuedMutation>> {
    self
      .transact(|tx| {
        let sql = format!("SELECT {} FROM mutation_queue WHERE id = ?1", MUTATION_COLUMNS);
        Ok(
          tx.query_row(&sql, params![id], mutation_from_row)
            .optional()?,
        )
      })
      .await
  }

  /// Mutations matching `filter`, oldest first (creation time, then id).
  pub async fn mutations(&self, filter: &MutationFilter) -> StoreResult<Vec<QueuedMutation>> {
    self
      .transact(|tx| {
        let sql = format!(
          "SELECT {} FROM mutation_queue
           WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR entity_id = ?2)
           ORDER BY created_at ASC, id ASC",
          MUTATION_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
          .query_map(params![filter.status, filter.entity_id], mutation_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
  }

  /// Returns whether the mutation existed.
  pub async fn set_status(
    &self,
    id: i64,
    status: MutationStatus,
    last_error: Option<&str>,
  ) -> StoreResult<bool> {
    self
      .transact(|tx| {
        let updated = tx.execute(
          "UPDATE mutation_queue SET status = ?2, last_error = COALESCE(?3, last_error)
           WHERE id = ?1",
          params![id, status, last_error],
        )?;
        Ok(updated > 0)
      })
      .await
  }

  /// Bump the retry counter and return its new value.
  pub async fn record_attempt(&self, id: i64) -> StoreResult<u32> {
    self
      .transact(|tx| {
        let updated = tx.execute(
          "UPDATE mutation_queue SET retry_count = retry_count + 1 WHERE id = ?1",
          params![id],
        )?;
        if updated == 0 {
          return Err(StoreError::MissingMutation(id));
        }
        let count = tx.query_row(
          "SELECT retry_count FROM mutation_queue WHERE id = ?1",
          params![id],
          |row| row.get(0),
        )?;
        Ok(count)
      })
      .await
  }

  /// Returns whether the mutation existed.
  pub async fn delete_mutation(&self, id: i64) -> StoreResult<bool> {
    self
      .transact(|tx| {
        let removed = tx.execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])?;
        Ok(removed > 0)
      })
      .await
  }

  /// Move every `failed` mutation back to `pending`. Retry counters are kept.
  pub async fn requeue_failed(&self) -> StoreResult<usize> {
    self
      .move_status(MutationStatus::Failed, MutationStatus::Pending)
      .await
  }

  /// Move mutations stranded in `syncing` (process died mid-replay) back to `pending`.
  pub async fn requeue_interrupted(&self) -> StoreResult<usize> {
    self
      .move_status(MutationStatus::Syncing, MutationStatus::Pending)
      .await
  }

  async fn move_status(&self, from: MutationStatus, to: MutationStatus) -> StoreResult<usize> {
    self
      .transact(|tx| {
        Ok(tx.execute(
          "UPDATE mutation_queue SET status = ?2 WHERE status = ?1",
          params![from, to],
        )?)
      })
      .await
  }

  pub async fn purge_completed(&self) -> StoreResult<usize> {
    self
      .transact(|tx| {
        Ok(tx.execute(
          "DELETE FROM mutation_queue WHERE status = ?1",
          params![MutationStatus::Completed],
        )?)
      })
      .await
  }

  pub async fn queue_counts(&self) -> StoreResult<QueueCounts> {
    self
      .transact(|tx| {
        let mut stmt =
          tx.prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")?;
        let rows = stmt
          .query_map([], |row| {
            Ok((row.get::<_, MutationStatus>(0)?, row.get::<_, i64>(1)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
          let count = usize::try_from(count).unwrap_or(0);
          match status {
            MutationStatus::Pending => counts.pending = count,
            MutationStatus::Syncing => counts.syncing = count,
            MutationStatus::Failed => counts.failed = count,
            MutationStatus::Completed => counts.completed = count,
          }
        }
        Ok(counts)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{Headers, Method};
  use chrono::{DateTime, Duration, Utc};
  use serde_json::json;

  fn new_mutation(url: &str, created_at: DateTime<Utc>) -> NewMutation {
    let mut headers = Headers::new();
    headers.insert("X-User-Id".into(), "u-17".into());
    NewMutation {
      method: Method::Post,
      url: url.to_string(),
      body: Some(json!({"systolic": 160})),
      headers,
      entity_id: Some("v1".into()),
      kind: "vitals".into(),
      created_at,
    }
  }

  #[tokio::test]
  async fn test_enqueue_round_trip() {
    let store = Store::in_memory();
    let now = Utc::now();
    let queued = store
      .enqueue(new_mutation("/api/visits/v1/vitals", now))
      .await
      .unwrap();

    let loaded = store.mutation(queued.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, MutationStatus::Pending);
    assert_eq!(loaded.body, Some(json!({"systolic": 160})));
    assert_eq!(loaded.headers.get("X-User-Id").map(String::as_str), Some("u-17"));
    assert_eq!(loaded.entity_id.as_deref(), Some("v1"));
    assert_eq!(loaded.created_at.timestamp_millis(), now.timestamp_millis());
  }

  #[tokio::test]
  async fn test_listing_is_ordered_by_creation_time() {
    let store = Store::in_memory();
    let base = Utc::now();

    // Inserted out of chronological order.
    store
      .enqueue(new_mutation("/api/visits/v1/c", base + Duration::seconds(3)))
      .await
      .unwrap();
    store
      .enqueue(new_mutation("/api/visits/v1/a", base + Duration::seconds(1)))
      .await
      .unwrap();
    store
      .enqueue(new_mutation("/api/visits/v1/b", base + Duration::seconds(2)))
      .await
      .unwrap();

    let urls: Vec<_> = store
      .mutations(&MutationFilter::with_status(MutationStatus::Pending))
      .await
      .unwrap()
      .into_iter()
      .map(|m| m.url)
      .collect();
    assert_eq!(
      urls,
      vec!["/api/visits/v1/a", "/api/visits/v1/b", "/api/visits/v1/c"]
    );
  }

  #[tokio::test]
  async fn test_filters_by_status_and_entity() {
    let store = Store::in_memory();
    let now = Utc::now();
    let first = store
      .enqueue(new_mutation("/api/visits/v1/vitals", now))
      .await
      .unwrap();
    let mut other = new_mutation("/api/visits/v2/notes", now);
    other.entity_id = Some("v2".into());
    store.enqueue(other).await.unwrap();

    store
      .set_status(first.id, MutationStatus::Failed, Some("Conflict"))
      .await
      .unwrap();

    let failed = store
      .mutations(&MutationFilter::with_status(MutationStatus::Failed))
      .await
      .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("Conflict"));

    let v2 = store
      .mutations(&MutationFilter::all().for_entity("v2"))
      .await
      .unwrap();
    assert_eq!(v2.len(), 1);
    assert_eq!(v2[0].kind, "vitals");
    assert_eq!(store.mutations(&MutationFilter::all()).await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_record_attempt_counts_up() {
    let store = Store::in_memory();
    let queued = store
      .enqueue(new_mutation("/api/visits/v1/vitals", Utc::now()))
      .await
      .unwrap();

    assert_eq!(store.record_attempt(queued.id).await.unwrap(), 1);
    assert_eq!(store.record_attempt(queued.id).await.unwrap(), 2);
    assert!(matches!(
      store.record_attempt(queued.id + 100).await,
      Err(StoreError::MissingMutation(_))
    ));
  }

  #[tokio::test]
  async fn test_requeue_and_purge() {
    let store = Store::in_memory();
    let now = Utc::now();
    let a = store.enqueue(new_mutation("/api/a", now)).await.unwrap();
    let b = store.enqueue(new_mutation("/api/b", now)).await.unwrap();
    let c = store.enqueue(new_mutation("/api/c", now)).await.unwrap();

    store.record_attempt(a.id).await.unwrap();
    store
      .set_status(a.id, MutationStatus::Failed, Some("HTTP 503"))
      .await
      .unwrap();
    store
      .set_status(b.id, MutationStatus::Syncing, None)
      .await
      .unwrap();
    store
      .set_status(c.id, MutationStatus::Completed, None)
      .await
      .unwrap();

    assert_eq!(
      store.queue_counts().await.unwrap(),
      QueueCounts {
        pending: 0,
        syncing: 1,
        failed: 1,
        completed: 1
      }
    );

    assert_eq!(store.requeue_failed().await.unwrap(), 1);
    assert_eq!(store.requeue_interrupted().await.unwrap(), 1);
    assert_eq!(store.purge_completed().await.unwrap(), 1);

    let requeued = store.mutation(a.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, MutationStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(store.queue_counts().await.unwrap().pending, 2);
  }

  #[tokio::test]
  async fn test_delete_mutation() {
    let store = Store::in_memory();
    let queued = store
      .enqueue(new_mutation("/api/a", Utc::now()))
      .await
      .unwrap();
    assert!(store.delete_mutation(queued.id).await.unwrap());
    assert!(!store.delete_mutation(queued.id).await.unwrap());
    assert!(store.mutation(queued.id).await.unwrap().is_none());
  }
}
