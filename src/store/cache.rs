//! Response cache collection.

use rusqlite::{params, OptionalExtension};

use super::records::{json_column, time_column, to_millis, CachedResponse};
use super::Store;
use crate::error::StoreResult;

impl Store {
  /// Insert or overwrite the cached payload for `entry.url`.
  pub async fn put_cached(&self, entry: &CachedResponse) -> StoreResult<()> {
    let payload = serde_json::to_string(&entry.payload)?;
    self
      .transact(|tx| {
        tx.execute(
          "INSERT OR REPLACE INTO response_cache (url, payload, captured_at, entity_id)
           VALUES (?1, ?2, ?3, ?4)",
          params![
            entry.url,
            payload,
            to_millis(entry.captured_at),
            entry.entity_id
          ],
        )?;
        Ok(())
      })
      .await
  }

  pub async fn cached(&self, url: &str) -> StoreResult<Option<CachedResponse>> {
    self
      .transact(|tx| {
        let entry = tx
          .query_row(
            "SELECT url, payload, captured_at, entity_id FROM response_cache WHERE url = ?1",
            params![url],
            |row| {
              Ok(CachedResponse {
                url: row.get(0)?,
                payload: json_column(row, 1)?,
                captured_at: time_column(row, 2)?,
                entity_id: row.get(3)?,
              })
            },
          )
          .optional()?;
        Ok(entry)
      })
      .await
  }

  /// Returns whether an entry was removed.
  pub async fn delete_cached(&self, url: &str) -> StoreResult<bool> {
    self
      .transact(|tx| {
        let removed = tx.execute("DELETE FROM response_cache WHERE url = ?1", params![url])?;
        Ok(removed > 0)
      })
      .await
  }

  /// Drop every cached payload owned by `entity_id`.
  pub async fn clear_cache_for_entity(&self, entity_id: &str) -> StoreResult<usize> {
    self
      .transact(|tx| {
        let removed = tx.execute(
          "DELETE FROM response_cache WHERE entity_id = ?1",
          params![entity_id],
        )?;
        Ok(removed)
      })
      .await
  }

  pub async fn clear_cache(&self) -> StoreResult<usize> {
    self
      .transact(|tx| Ok(tx.execute("DELETE FROM response_cache", [])?))
      .await
  }

  /// All cached URLs, sorted.
  pub async fn cached_urls(&self) -> StoreResult<Vec<String>> {
    self
      .transact(|tx| {
        let mut stmt = tx.prepare("SELECT url FROM response_cache ORDER BY url")?;
        let urls = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(urls)
      })
      .await
  }
}
