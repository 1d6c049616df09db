use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::gateway::RequestGateway;
use crate::session::Session;
use crate::store::Store;
use crate::sync::{Connectivity, StatePublisher, SyncEngine, SyncService};
use crate::transport::{HttpTransport, Transport};

/// Everything wired together from one configuration.
pub struct App {
  config: Config,
  store: Store,
  connectivity: Arc<Connectivity>,
  publisher: Arc<StatePublisher>,
  gateway: RequestGateway,
  engine: Arc<SyncEngine>,
  session_path: PathBuf,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let transport = HttpTransport::new(&config.api.base_url)
      .map_err(|e| eyre!("Failed to set up HTTP transport: {}", e))?;
    Self::with_transport(config, Arc::new(transport)).await
  }

  pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
    let db_path = match &config.storage.path {
      Some(path) => path.clone(),
      None => Store::default_path()?,
    };
    let session_path = match &config.storage.session_path {
      Some(path) => path.clone(),
      None => Session::default_path()?,
    };

    let store = Store::at(&db_path);
    // Surface an unusable store once, up front.
    store.ensure_open().await?;
    debug!(path = %db_path.display(), "durable store ready");

    let session = Session::load(&session_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let connectivity = Arc::new(Connectivity::new(true));
    let publisher = StatePublisher::new();

    let gateway = RequestGateway::new(
      store.clone(),
      Arc::clone(&transport),
      Arc::clone(&connectivity),
      Arc::clone(&publisher),
      Arc::clone(&clock),
    )
    .with_timeout(config.request_timeout())
    .with_session(session);

    let engine = SyncEngine::new(
      store.clone(),
      transport,
      Arc::clone(&connectivity),
      Arc::clone(&publisher),
      clock,
    )
    .with_policy(config.replay_policy());

    Ok(Self {
      config,
      store,
      connectivity,
      publisher,
      gateway,
      engine: Arc::new(engine),
      session_path,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn gateway(&self) -> &RequestGateway {
    &self.gateway
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub fn publisher(&self) -> &Arc<StatePublisher> {
    &self.publisher
  }

  pub fn connectivity(&self) -> &Arc<Connectivity> {
    &self.connectivity
  }

  pub fn session_path(&self) -> &Path {
    &self.session_path
  }

  /// Background service bound to this app's engine.
  pub fn service(&self) -> SyncService {
    SyncService::new(Arc::clone(&self.engine), self.config.service_options())
  }

  /// Persist `session` and attach it to subsequent calls.
  pub fn login(&self, session: Session) -> Result<()> {
    session.save(&self.session_path)?;
    info!(user_id = %session.user_id, role = %session.role, "session stored");
    self.gateway.set_session(Some(session));
    Ok(())
  }

  /// Returns whether a session was stored.
  pub fn logout(&self) -> Result<bool> {
    let removed = Session::clear(&self.session_path)?;
    self.gateway.set_session(None);
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{ApiConfig, LogConfig, StorageConfig, SyncConfig};
  use crate::transport::{Method, MockTransport};
  use crate::session::USER_ROLE_HEADER;

  fn config(dir: &Path) -> Config {
    Config {
      api: ApiConfig {
        base_url: "http://127.0.0.1:9/".into(),
        request_timeout_secs: 1,
      },
      sync: SyncConfig::default(),
      storage: StorageConfig {
        path: Some(dir.join("offline.db")),
        session_path: Some(dir.join("session.json")),
      },
      log: LogConfig::default(),
    }
  }

  #[tokio::test]
  async fn test_session_follows_login_and_logout() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let app = App::with_transport(config(dir.path()), Arc::new(transport.clone()))
      .await
      .unwrap();
    assert!(app.store().is_open());

    app
      .login(Session::new("u-3", "N. Reyes", "nurse"))
      .unwrap();
    app
      .gateway()
      .execute(Method::Post, "/api/visits/v7/vitals", None)
      .await
      .unwrap();
    let sent = transport.sent();
    assert_eq!(
      sent[0].headers.get(USER_ROLE_HEADER).map(String::as_str),
      Some("nurse")
    );

    // A fresh app picks the stored session up again.
    let reopened = App::with_transport(config(dir.path()), Arc::new(MockTransport::new()))
      .await
      .unwrap();
    assert_eq!(reopened.gateway().session().unwrap().user_id, "u-3");

    assert!(app.logout().unwrap());
    assert!(app.gateway().session().is_none());
    assert!(!app.logout().unwrap());
  }

  #[tokio::test]
  async fn test_unusable_store_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = config(dir.path());
    config.storage.path = Some(blocker.join("offline.db"));
    assert!(App::with_transport(config, Arc::new(MockTransport::new()))
      .await
      .is_err());
  }
}
