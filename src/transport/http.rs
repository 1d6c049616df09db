use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

use super::{HttpResponse, Method, OutboundRequest, Transport, TransportError};

/// reqwest-backed transport resolving request paths against the API base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str) -> Result<Self, TransportError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| TransportError::Malformed(format!("invalid API base URL {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .user_agent(concat!("cairn/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| TransportError::Malformed(format!("failed to create HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  /// Resolve a request path (or absolute URL) against the base URL.
  pub fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(url)
      .map_err(|e| TransportError::Malformed(format!("invalid request URL {}: {}", url, e)))
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let mut builder = self.client.request(request.method.into(), url);

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if let Some(body) = &request.body {
      let has_content_type = request
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
      if !has_content_type {
        builder = builder.header(CONTENT_TYPE, "application/json");
      }
      let bytes =
        serde_json::to_vec(body).map_err(|e| TransportError::Malformed(e.to_string()))?;
      builder = builder.body(bytes);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse { status, body })
  }
}

/// Map reqwest's error kinds onto the structured transport taxonomy.
fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_builder() || e.is_redirect() {
    TransportError::Malformed(e.to_string())
  } else {
    TransportError::Unreachable(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_paths_against_base() {
    let transport = HttpTransport::new("https://clinic.example.org/").unwrap();
    assert_eq!(
      transport.resolve("/api/visits/v1/vitals").unwrap().as_str(),
      "https://clinic.example.org/api/visits/v1/vitals"
    );
    assert_eq!(
      transport.resolve("https://other.example.org/api/x").unwrap().as_str(),
      "https://other.example.org/api/x"
    );
  }

  #[test]
  fn test_rejects_bad_base_url() {
    assert!(matches!(
      HttpTransport::new("not a url"),
      Err(TransportError::Malformed(_))
    ));
  }

  #[tokio::test]
  async fn test_unreachable_host_is_connectivity_failure() {
    // Port 9 on localhost has nothing listening in test environments.
    let transport = HttpTransport::new("http://127.0.0.1:9/").unwrap();
    let request = OutboundRequest {
      method: Method::Get,
      url: "/api/health".into(),
      headers: Default::default(),
      body: None,
    };
    let err = transport.send(&request).await.unwrap_err();
    assert!(err.is_connectivity(), "unexpected error: {err:?}");
  }
}
