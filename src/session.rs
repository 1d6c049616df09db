//! Locally persisted session record and the identity headers derived from it.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::transport::Headers;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_NAME_HEADER: &str = "X-User-Name";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub user_id: String,
  pub user_name: String,
  pub role: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("failed to access session file {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("session file {} is not valid: {source}", .path.display())]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },

  #[error("could not determine data directory")]
  NoDataDir,
}

impl Session {
  pub fn new(
    user_id: impl Into<String>,
    user_name: impl Into<String>,
    role: impl Into<String>,
  ) -> Self {
    Self {
      user_id: user_id.into(),
      user_name: user_name.into(),
      role: role.into(),
    }
  }

  /// Headers attached to every outgoing call made on behalf of this user.
  pub fn identity_headers(&self) -> Headers {
    let mut headers = Headers::new();
    headers.insert(USER_ID_HEADER.to_string(), self.user_id.clone());
    headers.insert(USER_NAME_HEADER.to_string(), self.user_name.clone());
    headers.insert(USER_ROLE_HEADER.to_string(), self.role.clone());
    headers
  }

  /// Get the default session file path.
  pub fn default_path() -> Result<PathBuf, SessionError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(SessionError::NoDataDir)?;

    Ok(data_dir.join("cairn").join("session.json"))
  }

  /// Load the session at `path`. A missing file means nobody is signed in.
  pub fn load(path: &Path) -> Result<Option<Self>, SessionError> {
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(SessionError::Io {
          path: path.to_path_buf(),
          source,
        })
      }
    };

    serde_json::from_str(&contents)
      .map(Some)
      .map_err(|source| SessionError::Parse {
        path: path.to_path_buf(),
        source,
      })
  }

  pub fn save(&self, path: &Path) -> Result<(), SessionError> {
    let io_error = |source: std::io::Error| SessionError::Io {
      path: path.to_path_buf(),
      source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let contents = serde_json::to_string_pretty(self).map_err(|source| SessionError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    std::fs::write(path, contents).map_err(io_error)
  }

  /// Remove the session file. Returns whether one existed.
  pub fn clear(path: &Path) -> Result<bool, SessionError> {
    match std::fs::remove_file(path) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
      Err(source) => Err(SessionError::Io {
        path: path.to_path_buf(),
        source,
      }),
    }
  }
}
