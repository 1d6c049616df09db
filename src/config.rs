use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{ProbeOptions, ReplayPolicy, ServiceOptions};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL that request paths are resolved against
  pub base_url: String,
  /// Upper bound on live gateway calls
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts before a transient replay failure becomes permanent
  pub max_retries: u32,
  pub replay_timeout_secs: u64,
  /// Quiet period after reconnecting before the queue drains
  pub reconnect_debounce_ms: u64,
  /// Probe the API on this interval (seconds). Unset leaves connectivity
  /// to whoever embeds the library.
  pub probe_interval_secs: Option<u64>,
  pub probe_path: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      replay_timeout_secs: 30,
      reconnect_debounce_ms: 1500,
      probe_interval_secs: None,
      probe_path: "/api/health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/cairn/offline.db)
  pub path: Option<PathBuf>,
  /// Session record (default: $XDG_DATA_HOME/cairn/session.json)
  pub session_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset
  pub level: String,
  /// Write a daily rolling log file here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

fn default_request_timeout() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cairn.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cairn/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/cairn/config.yaml\n\
                 See cairn.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cairn.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cairn").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config
      .validate()
      .map_err(|reason| eyre!("Invalid config file {}: {}", path.display(), reason))?;

    Ok(config)
  }

  /// Reject values that would stall or panic at runtime.
  fn validate(&self) -> std::result::Result<(), &'static str> {
    if self.api.request_timeout_secs == 0 {
      return Err("api.request_timeout_secs must be positive");
    }
    if self.sync.max_retries == 0 {
      return Err("sync.max_retries must be at least 1");
    }
    if self.sync.replay_timeout_secs == 0 {
      return Err("sync.replay_timeout_secs must be positive");
    }
    // tokio intervals panic on a zero period.
    if self.sync.probe_interval_secs == Some(0) {
      return Err("sync.probe_interval_secs must be positive");
    }
    Ok(())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.request_timeout_secs)
  }

  pub fn replay_policy(&self) -> ReplayPolicy {
    ReplayPolicy {
      max_retries: self.sync.max_retries,
      timeout: Duration::from_secs(self.sync.replay_timeout_secs),
    }
  }

  pub fn service_options(&self) -> ServiceOptions {
    ServiceOptions {
      debounce: Duration::from_millis(self.sync.reconnect_debounce_ms),
      probe: self.sync.probe_interval_secs.map(|secs| ProbeOptions {
        path: self.sync.probe_path.clone(),
        every: Duration::from_secs(secs),
        timeout: self.request_timeout(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let file = write_config("api:\n  base_url: https://clinic.example.org\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.api.base_url, "https://clinic.example.org");
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.replay_policy(), ReplayPolicy::default());

    let options = config.service_options();
    assert_eq!(options.debounce, Duration::from_millis(1500));
    assert!(options.probe.is_none());
    assert_eq!(config.log.level, "info");
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_full_config() {
    let file = write_config(
      r#"
api:
  base_url: http://localhost:8080
  request_timeout_secs: 5
sync:
  max_retries: 5
  probe_interval_secs: 15
storage:
  path: /var/lib/cairn/offline.db
log:
  level: debug
  directory: /var/log/cairn
"#,
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.replay_policy().max_retries, 5);
    assert_eq!(config.replay_policy().timeout, Duration::from_secs(30));
    let probe = config.service_options().probe.unwrap();
    assert_eq!(probe.path, "/api/health");
    assert_eq!(probe.every, Duration::from_secs(15));
    assert_eq!(probe.timeout, Duration::from_secs(5));
    assert_eq!(
      config.storage.path.as_deref(),
      Some(Path::new("/var/lib/cairn/offline.db"))
    );
    assert_eq!(config.log.directory, Some(PathBuf::from("/var/log/cairn")));
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/cairn.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_rejects_zero_retries() {
    let file = write_config("api:\n  base_url: http://x\nsync:\n  max_retries: 0\n");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_rejects_zero_durations() {
    let cases = [
      ("api:\n  base_url: http://x\n  request_timeout_secs: 0\n", "request_timeout_secs"),
      ("api:\n  base_url: http://x\nsync:\n  replay_timeout_secs: 0\n", "replay_timeout_secs"),
      ("api:\n  base_url: http://x\nsync:\n  probe_interval_secs: 0\n", "probe_interval_secs"),
    ];
    for (contents, field) in cases {
      let file = write_config(contents);
      let err = Config::load(Some(file.path())).unwrap_err().to_string();
      assert!(err.starts_with("Invalid config file"), "{}", err);
      assert!(err.contains(field), "{}", err);
    }
  }

  #[test]
  fn test_base_url_is_required() {
    let file = write_config("sync:\n  max_retries: 3\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse"));
  }
}
