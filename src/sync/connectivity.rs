//! Connectivity flag and the optional reachability probe that drives it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::{send_with_timeout, Method, OutboundRequest, Transport};

/// Current online/offline flag. Hosts report transitions with [`set_online`](Self::set_online);
/// interested tasks follow them through [`watch`](Self::watch).
#[derive(Debug)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Returns whether this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  pub fn watch(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// How to probe the API for reachability.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
  pub path: String,
  pub every: Duration,
  pub timeout: Duration,
}

/// One reachability check. Any HTTP response means online; an unreachable
/// network or a timeout means offline. `None` when the probe itself is broken.
pub async fn probe_once(transport: &dyn Transport, path: &str, timeout: Duration) -> Option<bool> {
  let request = OutboundRequest {
    method: Method::Get,
    url: path.to_string(),
    headers: Default::default(),
    body: None,
  };

  match send_with_timeout(transport, &request, timeout).await {
    Ok(response) => {
      debug!(status = response.status, "probe answered");
      Some(true)
    }
    Err(e) if e.is_connectivity() => Some(false),
    Err(e) => {
      warn!(error = %e, path, "connectivity probe misconfigured");
      None
    }
  }
}

/// Probe on a fixed interval and feed the result into `connectivity`.
pub fn spawn_probe(
  transport: Arc<dyn Transport>,
  connectivity: Arc<Connectivity>,
  options: ProbeOptions,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    info!(path = %options.path, every = ?options.every, "connectivity probe started");
    let mut timer = interval(options.every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      timer.tick().await;
      if let Some(online) = probe_once(transport.as_ref(), &options.path, options.timeout).await {
        connectivity.set_online(online);
      }
    }
  })
}
