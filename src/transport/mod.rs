//! Outbound HTTP contract shared by the request gateway and the sync engine.
//!
//! Everything that leaves the process goes through a [`Transport`]. The
//! transport never interprets status codes; it reports either the raw
//! response or a structured [`TransportError`], and [`Delivery::classify`]
//! turns that into the replay taxonomy.

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::MockTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ParseTagError;

/// Request headers, kept sorted so persisted copies are stable.
pub type Headers = BTreeMap<String, String>;

/// Upper bound on the amount of response text kept as diagnostic context.
pub const MAX_DIAGNOSTIC_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Create, update and delete. These are the calls that get queued when offline.
  pub fn is_unsafe(&self) -> bool {
    !matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = ParseTagError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      _ => Err(ParseTagError {
        kind: "HTTP method",
        value: s.to_string(),
      }),
    }
  }
}

/// A request as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
  pub method: Method,
  /// Path (resolved against the API base URL) or absolute URL.
  pub url: String,
  pub headers: Headers,
  pub body: Option<Value>,
}

/// Raw response: status code plus body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: String,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Body as JSON. Empty bodies are `null`, anything unparseable is kept as a string.
  pub fn json(&self) -> Value {
    if self.body.trim().is_empty() {
      return Value::Null;
    }
    serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
  }
}

/// Transport-level failures. No response was received in any of these cases.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  /// The request never reached the server (DNS, refused, reset, no route).
  #[error("network unreachable: {0}")]
  Unreachable(String),

  /// No response within the allotted time; the request was abandoned.
  #[error("request timed out")]
  Timeout,

  /// The request could not be built (bad URL, unserializable body, client setup).
  #[error("malformed request: {0}")]
  Malformed(String),
}

impl TransportError {
  /// Failures that mean "treat as offline".
  pub fn is_connectivity(&self) -> bool {
    matches!(
      self,
      TransportError::Unreachable(_) | TransportError::Timeout
    )
  }
}

/// Pluggable network backend.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Issue the request and return whatever the server answered.
  async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, TransportError>;
}

/// Send with an upper bound. On expiry the in-flight request future is dropped,
/// which cancels it, and the result is [`TransportError::Timeout`].
pub async fn send_with_timeout(
  transport: &dyn Transport,
  request: &OutboundRequest,
  limit: Duration,
) -> Result<HttpResponse, TransportError> {
  match tokio::time::timeout(limit, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(TransportError::Timeout),
  }
}

/// Outcome of delivering a queued mutation, derived only from the status code
/// and (for diagnostics) the response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
  /// 2xx.
  Delivered(HttpResponse),
  /// 409. Needs a human; never retried automatically.
  Conflict { body: String },
  /// Any other 4xx. The request itself is wrong; never retried automatically.
  Rejected { status: u16, body: String },
  /// 5xx, timeout or unreachable. Retried up to the configured bound.
  Transient { reason: String },
  /// Anything else. Not retried, so unknown failure modes cannot loop.
  Unclassified { reason: String },
}

impl Delivery {
  pub fn classify(result: Result<HttpResponse, TransportError>) -> Self {
    match result {
      Ok(response) => match response.status {
        200..=299 => Delivery::Delivered(response),
        409 => Delivery::Conflict {
          body: truncate_diagnostic(&response.body),
        },
        400..=499 => Delivery::Rejected {
          status: response.status,
          body: truncate_diagnostic(&response.body),
        },
        500..=599 => Delivery::Transient {
          reason: format!(
            "HTTP {}: {}",
            response.status,
            truncate_diagnostic(&response.body)
          ),
        },
        other => Delivery::Unclassified {
          reason: format!("unexpected HTTP status {}", other),
        },
      },
      Err(e) if e.is_connectivity() => Delivery::Transient {
        reason: e.to_string(),
      },
      Err(e) => Delivery::Unclassified {
        reason: e.to_string(),
      },
    }
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, Delivery::Transient { .. })
  }
}

/// Trim response text to [`MAX_DIAGNOSTIC_CHARS`] characters.
pub fn truncate_diagnostic(body: &str) -> String {
  let body = body.trim();
  match body.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
    Some((cut, _)) => format!("{}…", &body[..cut]),
    None => body.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_parsing() {
    assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
    assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
    assert!("TRACE".parse::<Method>().is_err());
    assert!(!Method::Get.is_unsafe());
    assert!(Method::Patch.is_unsafe());
  }

  #[test]
  fn test_classify_status_codes() {
    let ok = HttpResponse::new(201, "{}");
    assert_eq!(Delivery::classify(Ok(ok.clone())), Delivery::Delivered(ok));

    assert!(matches!(
      Delivery::classify(Ok(HttpResponse::new(409, "stale version"))),
      Delivery::Conflict { body } if body == "stale version"
    ));
    assert!(matches!(
      Delivery::classify(Ok(HttpResponse::new(422, "systolic out of range"))),
      Delivery::Rejected { status: 422, .. }
    ));
    assert!(Delivery::classify(Ok(HttpResponse::new(503, ""))).is_retryable());
    assert!(matches!(
      Delivery::classify(Ok(HttpResponse::new(304, ""))),
      Delivery::Unclassified { .. }
    ));
  }

  #[test]
  fn test_classify_transport_errors() {
    assert!(Delivery::classify(Err(TransportError::Timeout)).is_retryable());
    assert!(Delivery::classify(Err(TransportError::Unreachable("refused".into()))).is_retryable());
    assert!(matches!(
      Delivery::classify(Err(TransportError::Malformed("bad url".into()))),
      Delivery::Unclassified { .. }
    ));
  }

  #[test]
  fn test_truncate_diagnostic() {
    let long = "é".repeat(MAX_DIAGNOSTIC_CHARS + 20);
    let cut = truncate_diagnostic(&long);
    assert_eq!(cut.chars().count(), MAX_DIAGNOSTIC_CHARS + 1);
    assert_eq!(truncate_diagnostic("  short  "), "short");
  }

  #[test]
  fn test_response_json() {
    assert_eq!(HttpResponse::new(204, "").json(), Value::Null);
    assert_eq!(
      HttpResponse::new(200, r#"{"a":1}"#).json(),
      serde_json::json!({"a": 1})
    );
    assert_eq!(
      HttpResponse::new(200, "plain").json(),
      Value::String("plain".into())
    );
  }
}
