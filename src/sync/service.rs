//! Lifecycle wrapper that wires connectivity transitions to the engine.

use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::connectivity::{spawn_probe, ProbeOptions};
use super::{SyncEngine, SyncState};
use crate::error::StoreResult;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
  /// Quiet period after coming online before a drain starts.
  pub debounce: Duration,
  /// Active reachability probing; `None` leaves connectivity to the host.
  pub probe: Option<ProbeOptions>,
}

impl Default for ServiceOptions {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(1500),
      probe: None,
    }
  }
}

/// Handles of the drain waiting out its debounce and of the last drain started.
#[derive(Default)]
struct Drains {
  scheduled: Mutex<Option<JoinHandle<()>>>,
  running: Mutex<Option<JoinHandle<()>>>,
}

impl Drains {
  fn cancel_scheduled(&self) {
    if let Some(handle) = lock(&self.scheduled).take() {
      if !handle.is_finished() {
        debug!("cancelled scheduled drain");
      }
      handle.abort();
    }
  }

  /// Reap the last drain if it has ended. One still running stays tracked.
  async fn reap(&self) {
    let finished = {
      let mut running = lock(&self.running);
      match running.as_ref() {
        Some(handle) if handle.is_finished() => running.take(),
        Some(_) => {
          debug!("drain in progress, leaving it to finish");
          None
        }
        None => None,
      }
    };
    if let Some(handle) = finished {
      if let Err(e) = handle.await {
        error!(error = %e, "drain task ended abnormally");
      }
    }
  }
}

/// Background side of the sync subsystem.
///
/// `start` recovers the queue and spawns the reconnect watcher (plus the probe
/// when configured); `stop` tears those tasks down. A drain that has already
/// begun is left to finish.
pub struct SyncService {
  engine: Arc<SyncEngine>,
  options: ServiceOptions,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  drains: Arc<Drains>,
}

impl SyncService {
  pub fn new(engine: Arc<SyncEngine>, options: ServiceOptions) -> Self {
    Self {
      engine,
      options,
      tasks: Mutex::new(Vec::new()),
      drains: Arc::new(Drains::default()),
    }
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub async fn start(&self) -> StoreResult<SyncState> {
    self.stop().await;

    let store = self.engine.store();
    let recovered = store.requeue_interrupted().await?;
    if recovered > 0 {
      info!(recovered, "returned interrupted mutations to the queue");
    }
    let state = self.engine.refresh().await?;

    let mut tasks = Vec::new();
    tasks.push(spawn_reconnect_watcher(
      Arc::clone(&self.engine),
      Arc::clone(&self.drains),
      self.options.debounce,
    ));
    if let Some(probe) = &self.options.probe {
      tasks.push(spawn_probe(
        Arc::clone(self.engine.transport()),
        Arc::clone(self.engine.connectivity()),
        probe.clone(),
      ));
    }
    lock(&self.tasks).extend(tasks);

    if self.engine.connectivity().is_online() && state.pending > 0 {
      schedule_drain(&self.engine, &self.drains, Duration::ZERO);
    }

    info!(pending = state.pending, failed = state.failed, "sync service started");
    Ok(state)
  }

  pub async fn stop(&self) {
    self.drains.cancel_scheduled();

    let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
    for task in &tasks {
      task.abort();
    }
    let stopped = !tasks.is_empty();
    join_all(tasks).await;

    self.drains.reap().await;
    if stopped {
      debug!("sync service stopped");
    }
  }

  /// Whether a debounced drain is waiting to fire.
  pub fn drain_scheduled(&self) -> bool {
    is_live(&self.drains.scheduled)
  }

  /// Whether a drain started by the service is still running.
  pub fn drain_running(&self) -> bool {
    is_live(&self.drains.running)
  }
}

impl Drop for SyncService {
  fn drop(&mut self) {
    self.drains.cancel_scheduled();
    for task in lock(&self.tasks).drain(..) {
      task.abort();
    }
  }
}

fn spawn_reconnect_watcher(
  engine: Arc<SyncEngine>,
  drains: Arc<Drains>,
  debounce: Duration,
) -> JoinHandle<()> {
  let mut online = engine.connectivity().watch();
  tokio::spawn(async move {
    while online.changed().await.is_ok() {
      if *online.borrow_and_update() {
        debug!(?debounce, "online, scheduling drain");
        schedule_drain(&engine, &drains, debounce);
      } else {
        // In-flight replays fail on their own timeout.
        drains.cancel_scheduled();
      }
    }
  })
}

/// Run a drain after `delay`, replacing any drain already scheduled.
fn schedule_drain(engine: &Arc<SyncEngine>, drains: &Arc<Drains>, delay: Duration) {
  let engine = Arc::clone(engine);
  let tracked = Arc::clone(drains);
  let handle = tokio::spawn(async move {
    tokio::time::sleep(delay).await;
    // A separate task so cancelling a later debounce cannot cut a drain short.
    let drain = tokio::spawn(async move {
      if let Err(e) = engine.sync_now().await {
        error!(error = %e, "scheduled drain failed");
      }
    });
    // The engine is single-flight, so a replaced handle belongs to a drain
    // that has finished or is about to return early.
    *lock(&tracked.running) = Some(drain);
  });

  if let Some(previous) = lock(&drains.scheduled).replace(handle) {
    previous.abort();
  }
}

fn is_live(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
  lock(slot)
    .as_ref()
    .is_some_and(|handle| !handle.is_finished())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::gateway::RequestGateway;
  use crate::store::{MutationStatus, Store};
  use crate::sync::{Connectivity, StatePublisher};
  use crate::transport::{Method, MockTransport};
  use serde_json::json;

  struct Fixture {
    service: SyncService,
    gateway: RequestGateway,
    store: Store,
    transport: MockTransport,
    connectivity: Arc<Connectivity>,
    publisher: Arc<StatePublisher>,
  }

  fn fixture(online: bool, debounce: Duration) -> Fixture {
    let store = Store::in_memory();
    let transport = MockTransport::new();
    let connectivity = Arc::new(Connectivity::new(online));
    let publisher = StatePublisher::new();

    let engine = SyncEngine::new(
      store.clone(),
      Arc::new(transport.clone()),
      Arc::clone(&connectivity),
      Arc::clone(&publisher),
      Arc::new(SystemClock),
    );
    let gateway = RequestGateway::new(
      store.clone(),
      Arc::new(transport.clone()),
      Arc::clone(&connectivity),
      Arc::clone(&publisher),
      Arc::new(SystemClock),
    );
    let service = SyncService::new(
      Arc::new(engine),
      ServiceOptions {
        debounce,
        probe: None,
      },
    );

    Fixture {
      service,
      gateway,
      store,
      transport,
      connectivity,
      publisher,
    }
  }

  async fn wait_until(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
      while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn test_reconnect_drains_offline_writes() {
    let f = fixture(false, Duration::from_millis(20));
    f.service.start().await.unwrap();

    let reply = f
      .gateway
      .execute(
        Method::Post,
        "/api/visits/v1/vitals",
        Some(json!({"systolic": 160})),
      )
      .await
      .unwrap();
    assert!(reply.is_queued());
    assert_eq!(f.publisher.current().pending, 1);

    f.transport.respond(200, "{}");
    f.connectivity.set_online(true);

    let publisher = Arc::clone(&f.publisher);
    wait_until(move || publisher.current().last_sync_at.is_some()).await;

    let state = f.publisher.current();
    assert_eq!(state.pending, 0);
    assert_eq!(f.store.queue_counts().await.unwrap().total(), 0);
    assert_eq!(f.transport.sent_count(), 1);
    f.service.stop().await;
  }

  #[tokio::test]
  async fn test_going_offline_cancels_debounce() {
    let f = fixture(false, Duration::from_secs(60));
    f.service.start().await.unwrap();

    f.connectivity.set_online(true);
    let service = &f.service;
    wait_until(|| service.drain_scheduled()).await;

    f.connectivity.set_online(false);
    wait_until(|| !service.drain_scheduled()).await;
    f.service.stop().await;
  }

  #[tokio::test]
  async fn test_start_recovers_and_recounts() {
    let f = fixture(false, Duration::from_millis(20));
    let queued = f
      .gateway
      .execute(Method::Put, "/api/visits/v1/notes/n1", Some(json!({"text": "x"})))
      .await
      .unwrap();
    let crate::gateway::Origin::Queued { mutation_id } = queued.origin else {
      panic!("expected queued reply");
    };
    f.store
      .set_status(mutation_id, MutationStatus::Syncing, None)
      .await
      .unwrap();

    let state = f.service.start().await.unwrap();
    assert_eq!(state.pending, 1);
    let item = f.store.mutation(mutation_id).await.unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Pending);
    f.service.stop().await;
  }

  #[tokio::test]
  async fn test_start_online_drains_leftover_work() {
    let f = fixture(false, Duration::from_secs(60));
    f.gateway
      .execute(Method::Post, "/api/visits/v1/vitals", None)
      .await
      .unwrap();
    f.connectivity.set_online(true);

    f.service.start().await.unwrap();
    let publisher = Arc::clone(&f.publisher);
    wait_until(move || publisher.current().last_sync_at.is_some()).await;
    assert_eq!(f.store.queue_counts().await.unwrap().total(), 0);
    f.service.stop().await;
  }

  #[tokio::test]
  async fn test_stop_leaves_running_drain_to_finish() {
    let f = fixture(false, Duration::from_millis(5));
    f.service.start().await.unwrap();
    f.gateway
      .execute(Method::Post, "/api/visits/v1/vitals", Some(json!({"systolic": 160})))
      .await
      .unwrap();

    f.transport.pause();
    f.connectivity.set_online(true);
    tokio::time::timeout(Duration::from_secs(2), f.transport.entered())
      .await
      .unwrap();
    let service = &f.service;
    wait_until(|| service.drain_running()).await;

    f.service.stop().await;
    assert!(f.service.drain_running());

    f.transport.release(1);
    wait_until(|| !service.drain_running()).await;
    assert_eq!(f.store.queue_counts().await.unwrap().total(), 0);
    assert_eq!(f.transport.sent_count(), 1);

    // A later stop reaps the finished drain.
    f.service.stop().await;
    assert!(!f.service.drain_running());
  }

  #[tokio::test]
  async fn test_stopped_service_ignores_reconnects() {
    let f = fixture(false, Duration::from_millis(5));
    f.service.start().await.unwrap();
    f.service.stop().await;

    f.connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!f.service.drain_scheduled());
    assert!(f.publisher.current().last_sync_at.is_none());
  }
}
