//! Process-wide sync state and the observer list that republishes it.
//!
//! The state is a cache of the durable store: counts are always re-derived
//! from the queue (see [`publish_counts`]) rather than adjusted in place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::StoreResult;
use crate::store::{QueueCounts, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  #[default]
  Idle,
  /// Only while the engine holds its drain lock.
  Syncing,
  /// Failed mutations are waiting for the user.
  Error,
}

impl SyncStatus {
  pub fn is_syncing(&self) -> bool {
    matches!(self, SyncStatus::Syncing)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, SyncStatus::Error)
  }

  /// Status when no drain is running.
  pub fn resting(counts: &QueueCounts) -> Self {
    if counts.failed > 0 {
      SyncStatus::Error
    } else {
      SyncStatus::Idle
    }
  }
}

/// Snapshot handed to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
  pub status: SyncStatus,
  /// Mutations in `pending` or `syncing`.
  pub pending: usize,
  pub failed: usize,
  pub last_sync_at: Option<DateTime<Utc>>,
  /// Description of the mutation being replayed right now.
  pub current: Option<String>,
}

impl SyncState {
  pub fn apply_counts(&mut self, counts: &QueueCounts) {
    self.pending = counts.outstanding();
    self.failed = counts.failed;
  }
}

type Handler = Arc<dyn Fn(&SyncState) + Send + Sync>;

#[derive(Default)]
struct PublisherInner {
  state: SyncState,
  subscribers: Vec<(u64, Handler)>,
  next_id: u64,
}

/// Holds the latest [`SyncState`] and fans updates out to subscribers.
///
/// Handlers run synchronously on the publishing task and must not publish
/// themselves.
#[derive(Default)]
pub struct StatePublisher {
  inner: Mutex<PublisherInner>,
  /// Serializes delivery so every subscriber sees states in publish order.
  delivery: Mutex<()>,
}

impl StatePublisher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn current(&self) -> SyncState {
    self.lock().state.clone()
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock().subscribers.len()
  }

  /// Register `handler`. It is called with the current state before this
  /// returns, and then with every later update until the subscription is dropped.
  pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
  where
    F: Fn(&SyncState) + Send + Sync + 'static,
  {
    let handler: Handler = Arc::new(handler);
    let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);

    let (id, snapshot) = {
      let mut inner = self.lock();
      let id = inner.next_id;
      inner.next_id += 1;
      inner.subscribers.push((id, Arc::clone(&handler)));
      (id, inner.state.clone())
    };
    handler(&snapshot);

    Subscription {
      id,
      publisher: Arc::downgrade(self),
    }
  }

  /// Apply `change` to the current state and notify every subscriber.
  pub fn update<F>(&self, change: F) -> SyncState
  where
    F: FnOnce(&mut SyncState),
  {
    let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);

    let (state, handlers) = {
      let mut inner = self.lock();
      change(&mut inner.state);
      let handlers: Vec<Handler> = inner.subscribers.iter().map(|(_, h)| h.clone()).collect();
      (inner.state.clone(), handlers)
    };

    for handler in handlers {
      handler(&state);
    }
    state
  }

  fn unsubscribe(&self, id: u64) {
    self.lock().subscribers.retain(|(sid, _)| *sid != id);
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, PublisherInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Keeps a handler registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  publisher: Weak<StatePublisher>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(publisher) = self.publisher.upgrade() {
      publisher.unsubscribe(self.id);
    }
  }
}

/// Re-derive pending/failed counts from the store and publish them, leaving
/// the status untouched.
pub async fn publish_counts(store: &Store, publisher: &StatePublisher) -> StoreResult<SyncState> {
  let counts = store.queue_counts().await?;
  Ok(publisher.update(|state| state.apply_counts(&counts)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn recorder(publisher: &Arc<StatePublisher>) -> (Arc<Mutex<Vec<SyncState>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = publisher.subscribe(move |state| sink.lock().unwrap().push(state.clone()));
    (seen, subscription)
  }

  #[test]
  fn test_subscribe_replays_current_state() {
    let publisher = StatePublisher::new();
    publisher.update(|s| s.pending = 4);

    let (seen, _subscription) = recorder(&publisher);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].pending, 4);
  }

  #[test]
  fn test_updates_reach_every_subscriber_in_order() {
    let publisher = StatePublisher::new();
    let (first, _a) = recorder(&publisher);
    let (second, _b) = recorder(&publisher);

    publisher.update(|s| s.status = SyncStatus::Syncing);
    publisher.update(|s| s.status = SyncStatus::Idle);

    for seen in [first, second] {
      let statuses: Vec<_> = seen.lock().unwrap().iter().map(|s| s.status).collect();
      assert_eq!(
        statuses,
        vec![SyncStatus::Idle, SyncStatus::Syncing, SyncStatus::Idle]
      );
    }
  }

  #[test]
  fn test_dropping_subscription_unsubscribes() {
    let publisher = StatePublisher::new();
    let (seen, subscription) = recorder(&publisher);
    assert_eq!(publisher.subscriber_count(), 1);

    subscription.unsubscribe();
    assert_eq!(publisher.subscriber_count(), 0);

    publisher.update(|s| s.failed = 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_publish_counts_reads_the_store() {
    use crate::store::NewMutation;
    use crate::transport::Method;

    let store = Store::in_memory();
    store
      .enqueue(NewMutation {
        method: Method::Post,
        url: "/api/visits/v1/vitals".into(),
        body: None,
        headers: Default::default(),
        entity_id: Some("v1".into()),
        kind: "vitals".into(),
        created_at: Utc::now(),
      })
      .await
      .unwrap();

    let publisher = StatePublisher::new();
    publisher.update(|s| s.status = SyncStatus::Error);
    let state = publish_counts(&store, &publisher).await.unwrap();
    assert_eq!(state.pending, 1);
    assert_eq!(state.failed, 0);
    assert_eq!(state.status, SyncStatus::Error);
  }
}
