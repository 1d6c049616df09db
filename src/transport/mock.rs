//! Mock transport for testing.
//!
//! Allows scripting responses, capturing sent requests, simulating an
//! unreachable network, and holding requests in flight.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use super::{HttpResponse, OutboundRequest, Transport, TransportError};

/// Mock transport. Clones share state.
///
/// With nothing scripted every request is answered `200 {}`.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
  inner: Arc<Mutex<MockTransportInner>>,
  entered: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
  sent: Vec<OutboundRequest>,
  script: VecDeque<Result<HttpResponse, TransportError>>,
  offline: bool,
  gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer the next request with this status and body.
  pub fn respond(&self, status: u16, body: &str) {
    self.push(Ok(HttpResponse::new(status, body)));
  }

  /// Fail the next request with this error.
  pub fn fail(&self, error: TransportError) {
    self.push(Err(error));
  }

  /// While set, every request fails as unreachable without consuming the script.
  pub fn set_offline(&self, offline: bool) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.offline = offline;
    }
  }

  /// Hold every subsequent request in flight until [`release`](Self::release) is called.
  pub fn pause(&self) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.gate = Some(Arc::new(Semaphore::new(0)));
    }
  }

  /// Let `n` held requests proceed.
  pub fn release(&self, n: usize) {
    if let Ok(inner) = self.inner.lock() {
      if let Some(gate) = &inner.gate {
        gate.add_permits(n);
      }
    }
  }

  /// Resolves once a request has reached the transport.
  pub async fn entered(&self) {
    self.entered.notified().await;
  }

  /// Every request received so far, in order.
  pub fn sent(&self) -> Vec<OutboundRequest> {
    self
      .inner
      .lock()
      .map(|inner| inner.sent.clone())
      .unwrap_or_default()
  }

  pub fn sent_count(&self) -> usize {
    self.inner.lock().map(|inner| inner.sent.len()).unwrap_or(0)
  }

  fn push(&self, outcome: Result<HttpResponse, TransportError>) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.script.push_back(outcome);
    }
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, TransportError> {
    let (outcome, gate) = {
      let mut inner = self
        .inner
        .lock()
        .map_err(|_| TransportError::Malformed("mock transport poisoned".into()))?;
      inner.sent.push(request.clone());
      let outcome = if inner.offline {
        Err(TransportError::Unreachable("mock network is offline".into()))
      } else {
        inner
          .script
          .pop_front()
          .unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
      };
      (outcome, inner.gate.clone())
    };

    self.entered.notify_one();

    if let Some(gate) = gate {
      // A closed semaphore also lets the request through.
      let _permit = gate.acquire().await;
    }

    outcome
  }
}
