//! Request gateway: the one entry point for network calls.
//!
//! Per call it decides whether to go live, fall back to the response cache,
//! or park the write in the mutation queue:
//! 1. Live call with the session's identity headers
//! 2. Successful cacheable reads are written to the cache
//! 3. Connectivity failure on a write: enqueue and acknowledge as queued
//! 4. Connectivity failure on a read: serve the cached payload, marked stale
//! 5. Anything else propagates to the caller

mod url;

pub use self::url::{entity_id, is_cacheable, kind, request_path};

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};
use crate::session::Session;
use crate::store::{CachedResponse, NewMutation, QueuedMutation, Store};
use crate::sync::{publish_counts, Connectivity, StatePublisher};
use crate::transport::{
  send_with_timeout, truncate_diagnostic, HttpResponse, Method, OutboundRequest, Transport,
  TransportError,
};

/// Where a reply's payload came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
  /// Fresh from the network.
  Live,
  /// From the response cache because the network was unreachable.
  Stale { captured_at: DateTime<Utc> },
  /// Not sent yet; parked in the mutation queue.
  Queued { mutation_id: i64 },
}

/// What the caller gets back from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
  pub status: u16,
  pub body: Value,
  pub origin: Origin,
}

impl Reply {
  fn live(response: &HttpResponse) -> Self {
    Self {
      status: response.status,
      body: response.json(),
      origin: Origin::Live,
    }
  }

  fn stale(entry: CachedResponse) -> Self {
    Self {
      status: 200,
      body: entry.payload,
      origin: Origin::Stale {
        captured_at: entry.captured_at,
      },
    }
  }

  /// Synthetic acknowledgement so the caller can carry on optimistically.
  fn queued(mutation: &QueuedMutation) -> Self {
    Self {
      status: 202,
      body: json!({ "queued": true, "mutation_id": mutation.id }),
      origin: Origin::Queued {
        mutation_id: mutation.id,
      },
    }
  }

  pub fn is_stale(&self) -> bool {
    matches!(self.origin, Origin::Stale { .. })
  }

  pub fn is_queued(&self) -> bool {
    matches!(self.origin, Origin::Queued { .. })
  }
}

pub struct RequestGateway {
  store: Store,
  transport: Arc<dyn Transport>,
  connectivity: Arc<Connectivity>,
  publisher: Arc<StatePublisher>,
  clock: Arc<dyn Clock>,
  session: RwLock<Option<Session>>,
  timeout: Duration,
}

impl RequestGateway {
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
      session: RwLock::new(None),
      timeout: Duration::from_secs(30),
    }
  }

  /// Bound on live calls.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_session(self, session: Option<Session>) -> Self {
    self.set_session(session);
    self
  }

  /// Replace the identity attached to subsequent calls. Already-queued
  /// mutations keep the identity they were captured with.
  pub fn set_session(&self, session: Option<Session>) {
    *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
  }

  pub fn session(&self) -> Option<Session> {
    self
      .session
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Issue a call. Writes that cannot reach the network are queued and
  /// acknowledged with an [`Origin::Queued`] reply.
  pub async fn execute(
    &self,
    method: Method,
    url: &str,
    body: Option<Value>,
  ) -> GatewayResult<Reply> {
    let request = self.build_request(method, url, body);

    match self.send_live(&request).await {
      Ok(response) => self.accept(&request, response).await,
      Err(e) if e.is_connectivity() && method.is_unsafe() => {
        debug!(error = %e, "write could not reach the network");
        self.enqueue(request).await
      }
      Err(e) if e.is_connectivity() => Err(GatewayError::Offline(e.to_string())),
      Err(e) => Err(GatewayError::Request(e.to_string())),
    }
  }

  /// Fetch `url`, falling back to the last cached payload (marked stale) when
  /// the network is unreachable.
  pub async fn read(&self, url: &str) -> GatewayResult<Reply> {
    if !is_cacheable(url) {
      return self.execute(Method::Get, url, None).await;
    }

    let request = self.build_request(Method::Get, url, None);
    match self.send_live(&request).await {
      Ok(response) => self.accept(&request, response).await,
      Err(e) if e.is_connectivity() => match self.store.cached(url).await? {
        Some(entry) => {
          info!(url, captured_at = %entry.captured_at, "serving cached response");
          Ok(Reply::stale(entry))
        }
        None => Err(GatewayError::Offline(e.to_string())),
      },
      Err(e) => Err(GatewayError::Request(e.to_string())),
    }
  }

  /// Drop every cached payload belonging to a visit.
  pub async fn clear_cache_for_visit(&self, visit_id: &str) -> GatewayResult<usize> {
    let removed = self.store.clear_cache_for_entity(visit_id).await?;
    debug!(visit_id, removed, "cleared cached responses");
    Ok(removed)
  }

  fn build_request(&self, method: Method, url: &str, body: Option<Value>) -> OutboundRequest {
    let mut headers = self
      .session()
      .map(|session| session.identity_headers())
      .unwrap_or_default();
    if body.is_some() {
      headers.insert(CONTENT_TYPE.as_str().to_string(), "application/json".to_string());
    }

    OutboundRequest {
      method,
      url: url.to_string(),
      headers,
      body,
    }
  }

  async fn send_live(&self, request: &OutboundRequest) -> Result<HttpResponse, TransportError> {
    if !self.connectivity.is_online() {
      return Err(TransportError::Unreachable("device reports offline".into()));
    }
    send_with_timeout(self.transport.as_ref(), request, self.timeout).await
  }

  async fn accept(&self, request: &OutboundRequest, response: HttpResponse) -> GatewayResult<Reply> {
    if !response.is_success() {
      return Err(GatewayError::Server {
        status: response.status,
        body: truncate_diagnostic(&response.body),
      });
    }

    let reply = Reply::live(&response);
    if request.method.is_unsafe() {
      info!(method = %request.method, url = %request.url, status = response.status, "mutation delivered");
    } else if is_cacheable(&request.url) {
      self
        .store
        .put_cached(&CachedResponse {
          url: request.url.clone(),
          payload: reply.body.clone(),
          captured_at: self.clock.now(),
          entity_id: entity_id(&request.url),
        })
        .await?;
      debug!(url = %request.url, "cached response");
    }
    Ok(reply)
  }

  async fn enqueue(&self, request: OutboundRequest) -> GatewayResult<Reply> {
    let entity_id = entity_id(&request.url);
    let kind = kind(&request.url);
    let queued = self
      .store
      .enqueue(NewMutation {
        method: request.method,
        url: request.url,
        body: request.body,
        headers: request.headers,
        entity_id,
        kind,
        created_at: self.clock.now(),
      })
      .await?;

    info!(
      id = queued.id,
      method = %queued.method,
      url = %queued.url,
      "queued mutation for replay"
    );
    publish_counts(&self.store, &self.publisher).await?;
    Ok(Reply::queued(&queued))
  }
}
