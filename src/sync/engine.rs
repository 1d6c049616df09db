//! Replay engine for the mutation queue.
//!
//! A drain walks every `pending` mutation oldest first and replays it with the
//! identity headers captured when it was queued. Only one drain runs at a
//! time; a second `sync_now` while one is active returns the current state.
//! The drain lock guards draining and nothing else: reading or recounting the
//! state never takes it.
//!
//! Outcome handling:
//! - 2xx: the item is removed
//! - 409: failed with a `Conflict:` message, never retried automatically
//! - other 4xx: failed with the response body
//! - 5xx, timeout, unreachable: back to pending until the retry bound, then failed
//! - anything else: failed immediately

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{publish_counts, Connectivity, StatePublisher, SyncState, SyncStatus};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::{MutationFilter, MutationStatus, QueuedMutation, Store};
use crate::transport::{send_with_timeout, Delivery, Transport};

/// Bounds applied to each replayed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
  /// Attempts before a transient failure becomes permanent.
  pub max_retries: u32,
  /// Per-attempt limit; on expiry the request is abandoned and counted as transient.
  pub timeout: Duration,
}

impl Default for ReplayPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      timeout: Duration::from_secs(30),
    }
  }
}

/// What happened to one mutation during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
  Delivered,
  Requeued,
  Failed,
  /// The row vanished (discarded) before it could be replayed.
  Skipped,
}

#[derive(Debug, Default)]
struct DrainSummary {
  delivered: usize,
  requeued: usize,
  failed: usize,
  interrupted: bool,
}

impl DrainSummary {
  fn record(&mut self, outcome: ReplayOutcome) {
    match outcome {
      ReplayOutcome::Delivered => self.delivered += 1,
      ReplayOutcome::Requeued => self.requeued += 1,
      ReplayOutcome::Failed => self.failed += 1,
      ReplayOutcome::Skipped => {}
    }
  }
}

pub struct SyncEngine {
  store: Store,
  transport: Arc<dyn Transport>,
  connectivity: Arc<Connectivity>,
  publisher: Arc<StatePublisher>,
  clock: Arc<dyn Clock>,
  policy: ReplayPolicy,
  drain_lock: Mutex<()>,
  /// Set by `retry_failed`; the holder of the drain lock runs another pass.
  rerun: AtomicBool,
}

impl SyncEngine {
  pub fn new(
    store: Store,
    transport: Arc<dyn Transport>,
    connectivity: Arc<Connectivity>,
    publisher: Arc<StatePublisher>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      transport,
      connectivity,
      publisher,
      clock,
      policy: ReplayPolicy::default(),
      drain_lock: Mutex::new(()),
      rerun: AtomicBool::new(false),
    }
  }

  pub fn with_policy(mut self, policy: ReplayPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn policy(&self) -> ReplayPolicy {
    self.policy
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn publisher(&self) -> &Arc<StatePublisher> {
    &self.publisher
  }

  pub fn connectivity(&self) -> &Arc<Connectivity> {
    &self.connectivity
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  /// Whether a drain is running. Published status is `syncing` exactly while
  /// one is.
  pub fn is_draining(&self) -> bool {
    self.publisher.current().status.is_syncing()
  }

  /// Drain the queue.
  ///
  /// Returns the published state. If a drain is already running this is a
  /// no-op that returns the current state as is.
  pub async fn sync_now(&self) -> StoreResult<SyncState> {
    loop {
      let state = {
        let Ok(_guard) = self.drain_lock.try_lock() else {
          debug!("drain already in progress");
          return Ok(self.publisher.current());
        };
        self.rerun.store(false, Ordering::SeqCst);
        self.drain_locked().await?
      };

      // Checked after the lock is released so a request made while the last
      // pass was finishing is not lost.
      if !self.rerun.load(Ordering::SeqCst) || !self.connectivity.is_online() {
        return Ok(state);
      }
      debug!("rerun requested, draining again");
    }
  }

  async fn drain_locked(&self) -> StoreResult<SyncState> {
    if !self.connectivity.is_online() {
      debug!("offline, skipping drain");
      return self.settle(None).await;
    }

    self.publisher.update(|state| state.status = SyncStatus::Syncing);
    info!("drain started");

    match self.drain().await {
      Ok(summary) => {
        info!(
          delivered = summary.delivered,
          requeued = summary.requeued,
          failed = summary.failed,
          interrupted = summary.interrupted,
          "drain finished"
        );
        let synced_at = (!summary.interrupted).then(|| self.clock.now());
        self.settle(synced_at).await
      }
      Err(e) => {
        error!(error = %e, "drain aborted");
        self.publisher.update(|state| {
          state.status = SyncStatus::Error;
          state.current = None;
        });
        Err(e)
      }
    }
  }

  /// Move every failed mutation back to `pending` and drain straight away.
  /// Retry counters are left as they are.
  ///
  /// When a drain is already running it picks the requeued items up in an
  /// extra pass before it finishes.
  pub async fn retry_failed(&self) -> StoreResult<SyncState> {
    let requeued = self.store.requeue_failed().await?;
    info!(requeued, "failed mutations requeued");
    publish_counts(&self.store, &self.publisher).await?;
    self.rerun.store(true, Ordering::SeqCst);
    self.sync_now().await
  }

  /// Delete one mutation regardless of its status. Returns whether it existed.
  pub async fn discard(&self, id: i64) -> StoreResult<bool> {
    let removed = self.store.delete_mutation(id).await?;
    if removed {
      info!(id, "mutation discarded");
    }
    self.refresh().await?;
    Ok(removed)
  }

  /// Re-derive the published state from the store. A running drain keeps
  /// its `syncing` status and settles it itself.
  pub async fn refresh(&self) -> StoreResult<SyncState> {
    let counts = self.store.queue_counts().await?;
    Ok(self.publisher.update(|state| {
      state.apply_counts(&counts);
      if !state.status.is_syncing() {
        state.status = SyncStatus::resting(&counts);
      }
    }))
  }

  async fn drain(&self) -> StoreResult<DrainSummary> {
    let queue = self
      .store
      .mutations(&MutationFilter::with_status(MutationStatus::Pending))
      .await?;
    let mut summary = DrainSummary::default();
    debug!(count = queue.len(), "pending mutations");

    for mutation in queue {
      if !self.connectivity.is_online() {
        info!(id = mutation.id, "connectivity lost, stopping drain");
        summary.interrupted = true;
        break;
      }

      let outcome = self.replay(&mutation).await?;
      summary.record(outcome);
      publish_counts(&self.store, &self.publisher).await?;
    }

    let purged = self.store.purge_completed().await?;
    if purged > 0 {
      debug!(purged, "purged completed mutations");
    }
    Ok(summary)
  }

  async fn replay(&self, mutation: &QueuedMutation) -> StoreResult<ReplayOutcome> {
    let id = mutation.id;
    if !self
      .store
      .set_status(id, MutationStatus::Syncing, None)
      .await?
    {
      return Ok(ReplayOutcome::Skipped);
    }

    let description = mutation.describe();
    self
      .publisher
      .update(|state| state.current = Some(description.clone()));

    let attempts = match self.store.record_attempt(id).await {
      Ok(attempts) => attempts,
      Err(StoreError::MissingMutation(_)) => return Ok(ReplayOutcome::Skipped),
      Err(e) => return Err(e),
    };

    let result = send_with_timeout(
      self.transport.as_ref(),
      &mutation.to_request(),
      self.policy.timeout,
    )
    .await;

    match Delivery::classify(result) {
      Delivery::Delivered(response) => {
        self.store.delete_mutation(id).await?;
        info!(id, status = response.status, mutation = %description, "mutation replayed");
        Ok(ReplayOutcome::Delivered)
      }
      Delivery::Conflict { body } => self.fail(mutation, &format!("Conflict: {}", body)).await,
      Delivery::Rejected { status, body } => {
        self.fail(mutation, &format!("HTTP {}: {}", status, body)).await
      }
      Delivery::Transient { reason } if attempts >= self.policy.max_retries => {
        self.fail(mutation, &reason).await
      }
      Delivery::Transient { reason } => {
        self
          .store
          .set_status(id, MutationStatus::Pending, Some(&reason))
          .await?;
        warn!(id, attempts, reason = %reason, "replay failed, will retry");
        Ok(ReplayOutcome::Requeued)
      }
      Delivery::Unclassified { reason } => self.fail(mutation, &reason).await,
    }
  }

  async fn fail(&self, mutation: &QueuedMutation, message: &str) -> StoreResult<ReplayOutcome> {
    self
      .store
      .set_status(mutation.id, MutationStatus::Failed, Some(message))
      .await?;
    warn!(id = mutation.id, mutation = %mutation.describe(), error = message, "replay failed permanently");
    Ok(ReplayOutcome::Failed)
  }

  /// Publish counts from the store plus the resting status they imply.
  /// Callers hold the drain lock.
  async fn settle(&self, synced_at: Option<DateTime<Utc>>) -> StoreResult<SyncState> {
    let counts = self.store.queue_counts().await?;
    Ok(self.publisher.update(|state| {
      state.apply_counts(&counts);
      state.status = SyncStatus::resting(&counts);
      state.current = None;
      if synced_at.is_some() {
        state.last_sync_at = synced_at;
      }
    }))
  }
}
