//! Blob collection.

use rusqlite::{params, OptionalExtension, Row};

use super::records::{time_column, to_millis, StoredBlob};
use super::Store;
use crate::error::StoreResult;

fn blob_from_row(row: &Row<'_>) -> rusqlite::Result<StoredBlob> {
  Ok(StoredBlob {
    id: row.get(0)?,
    data: row.get(1)?,
    mime_type: row.get(2)?,
    filename: row.get(3)?,
    entity_id: row.get(4)?,
    created_at: time_column(row, 5)?,
  })
}

impl Store {
  /// Insert or overwrite the blob with `blob.id`.
  pub async fn put_blob(&self, blob: &StoredBlob) -> StoreResult<()> {
    self
      .transact(|tx| {
        tx.execute(
          "INSERT OR REPLACE INTO blob_store (id, data, mime_type, filename, entity_id, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          params![
            blob.id,
            blob.data,
            blob.mime_type,
            blob.filename,
            blob.entity_id,
            to_millis(blob.created_at)
          ],
        )?;
        Ok(())
      })
      .await
  }

  pub async fn blob(&self, id: &str) -> StoreResult<Option<StoredBlob>> {
    self
      .transact(|tx| {
        Ok(
          tx.query_row(
            "SELECT id, data, mime_type, filename, entity_id, created_at
             FROM blob_store WHERE id = ?1",
            params![id],
            blob_from_row,
          )
          .optional()?,
        )
      })
      .await
  }

  /// Returns whether a blob was removed.
  pub async fn delete_blob(&self, id: &str) -> StoreResult<bool> {
    self
      .transact(|tx| Ok(tx.execute("DELETE FROM blob_store WHERE id = ?1", params![id])? > 0))
      .await
  }

  /// Blobs owned by `entity_id`, oldest first.
  pub async fn blobs_for_entity(&self, entity_id: &str) -> StoreResult<Vec<StoredBlob>> {
    self
      .transact(|tx| {
        let mut stmt = tx.prepare(
          "SELECT id, data, mime_type, filename, entity_id, created_at
           FROM blob_store WHERE entity_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let blobs = stmt
          .query_map(params![entity_id], blob_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blobs)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn blob(id: &str, data: &[u8], entity: Option<&str>) -> StoredBlob {
    StoredBlob {
      id: id.to_string(),
      data: data.to_vec(),
      mime_type: "audio/webm".into(),
      filename: Some(format!("{}.webm", id)),
      entity_id: entity.map(String::from),
      created_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_duplicate_id_overwrites_in_place() {
    let store = Store::in_memory();
    store.put_blob(&blob("rec-1", b"first", Some("v1"))).await.unwrap();
    store.put_blob(&blob("rec-1", b"second", Some("v1"))).await.unwrap();

    let stored = store.blob("rec-1").await.unwrap().unwrap();
    assert_eq!(stored.data, b"second");
    assert_eq!(store.blobs_for_entity("v1").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_delete_blob() {
    let store = Store::in_memory();
    store.put_blob(&blob("rec-1", b"audio", None)).await.unwrap();

    assert!(store.delete_blob("rec-1").await.unwrap());
    assert!(!store.delete_blob("rec-1").await.unwrap());
    assert!(store.blob("rec-1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_blobs_for_entity() {
    let store = Store::in_memory();
    store.put_blob(&blob("a", b"1", Some("v1"))).await.unwrap();
    store.put_blob(&blob("b", b"2", Some("v2"))).await.unwrap();
    store.put_blob(&blob("c", b"3", Some("v1"))).await.unwrap();

    let ids: Vec<_> = store
      .blobs_for_entity("v1")
      .await
      .unwrap()
      .into_iter()
      .map(|b| b.id)
      .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"a".to_string()) && ids.contains(&"c".to_string()));
  }
}
